//! Producer Flow - publishes envelopes and reports their outcomes in input order

pub mod client;
pub mod envelope;
pub mod flow;
pub mod resequencer;

pub use client::{KafkaProducerClient, ProducerClient, ProducerRecord, RecordMetadata};
pub use envelope::{Envelope, EnvelopeError, ProducerResult};
pub use flow::{EnvelopeOutcome, ProducerFlow, ProducerResults};
pub use resequencer::Resequencer;
