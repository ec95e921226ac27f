use crate::error::ConnectorError;
use crate::producer::client::{ProducerRecord, RecordMetadata};

/// Input of the producer flow: what to publish plus a value carried through to
/// the result untouched, usually the offset of the consumed record.
#[derive(Debug, Clone)]
pub enum Envelope<P> {
    Single {
        record: ProducerRecord,
        pass_through: P,
    },
    Multi {
        records: Vec<ProducerRecord>,
        pass_through: P,
    },
    /// Publish nothing, only carry the value to the output in order
    PassThrough(P),
}

impl<P> Envelope<P> {
    pub fn single(record: ProducerRecord, pass_through: P) -> Self {
        Envelope::Single {
            record,
            pass_through,
        }
    }

    pub fn multi(records: Vec<ProducerRecord>, pass_through: P) -> Self {
        Envelope::Multi {
            records,
            pass_through,
        }
    }

    pub fn pass_through(value: P) -> Self {
        Envelope::PassThrough(value)
    }

    pub fn pass_through_value(&self) -> &P {
        match self {
            Envelope::Single { pass_through, .. }
            | Envelope::Multi { pass_through, .. }
            | Envelope::PassThrough(pass_through) => pass_through,
        }
    }

    pub(crate) fn into_parts(self) -> (Shape, Vec<ProducerRecord>, P) {
        match self {
            Envelope::Single {
                record,
                pass_through,
            } => (Shape::Single, vec![record], pass_through),
            Envelope::Multi {
                records,
                pass_through,
            } => (Shape::Multi, records, pass_through),
            Envelope::PassThrough(pass_through) => (Shape::PassThrough, Vec::new(), pass_through),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Shape {
    Single,
    Multi,
    PassThrough,
}

/// Outcome of a successfully published envelope, same shape as its input
#[derive(Debug, Clone, PartialEq)]
pub enum ProducerResult<P> {
    Single {
        record: ProducerRecord,
        metadata: RecordMetadata,
        pass_through: P,
    },
    Multi {
        parts: Vec<(ProducerRecord, RecordMetadata)>,
        pass_through: P,
    },
    PassThrough(P),
}

impl<P> ProducerResult<P> {
    pub fn pass_through(&self) -> &P {
        match self {
            ProducerResult::Single { pass_through, .. }
            | ProducerResult::Multi { pass_through, .. }
            | ProducerResult::PassThrough(pass_through) => pass_through,
        }
    }

    pub fn into_pass_through(self) -> P {
        match self {
            ProducerResult::Single { pass_through, .. }
            | ProducerResult::Multi { pass_through, .. }
            | ProducerResult::PassThrough(pass_through) => pass_through,
        }
    }
}

/// An envelope whose publish failed. The pass-through value is handed back so
/// the caller can decide what to do with it; it must not be committed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("failed to publish envelope: {error}")]
pub struct EnvelopeError<P: std::fmt::Debug> {
    pub error: ConnectorError,
    pub pass_through: P,
}
