use std::collections::BTreeSet;
use std::time::Duration;

use thiserror::Error;

use crate::kafka::types::{PartitionState, SubscriptionKind, TopicPartition};

/// Errors surfaced to callers of the coordinator, the engine, the committer and the producer flow.
///
/// Errors are `Clone` because a single fatal client failure is fanned out to every
/// active partition stream.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectorError {
    #[error("already subscribed by {current}, cannot subscribe by {requested}")]
    SubscriptionConflict {
        current: SubscriptionKind,
        requested: SubscriptionKind,
    },

    #[error("partition {partition} is {state}")]
    InvalidPartitionState {
        partition: TopicPartition,
        state: PartitionState,
    },

    #[error("unknown topic: {0}")]
    TopicUnknown(String),

    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    #[error("commit failed for partitions {partitions:?}")]
    CommitFailed { partitions: BTreeSet<TopicPartition> },

    /// The request may still complete; callers must not assume it did not happen
    #[error("no response within {0:?}, outcome unknown")]
    TimedOut(Duration),

    #[error("request cancelled, consumer is shutting down")]
    Cancelled,

    #[error("consumer did not stop within {0:?} and was force-closed")]
    ShutdownTimeout(Duration),

    #[error("unrecoverable client failure: {0}")]
    Fatal(String),

    #[error("client error: {0}")]
    Client(String),

    #[error("failed to produce: {0}")]
    Produce(String),
}

impl ConnectorError {
    pub fn commit_failed(partitions: impl IntoIterator<Item = TopicPartition>) -> Self {
        ConnectorError::CommitFailed {
            partitions: partitions.into_iter().collect(),
        }
    }

    /// Errors after which the coordinator will not serve further requests
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectorError::Fatal(_)
                | ConnectorError::Cancelled
                | ConnectorError::ShutdownTimeout(_)
        )
    }
}

pub type ConnectorResult<T> = Result<T, ConnectorError>;

/// Errors reported by a [`ConsumerClient`](crate::kafka::client::ConsumerClient) implementation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    #[error("unknown topic or partition: {0}")]
    UnknownTopic(String),

    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    #[error("commit rejected for {partitions:?}: {reason}")]
    CommitFailed {
        partitions: BTreeSet<TopicPartition>,
        reason: String,
    },

    /// Authorization failures, fatal protocol errors, a closed consumer
    #[error("fatal: {0}")]
    Fatal(String),

    /// Retriable broker or transport trouble, already retried by the client
    #[error("transient: {0}")]
    Transient(String),

    #[error("close did not complete within {0:?}")]
    CloseTimedOut(Duration),

    #[error("{0}")]
    Other(String),
}

pub type ClientResult<T> = Result<T, ClientError>;

impl From<ClientError> for ConnectorError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::UnknownTopic(topic) => ConnectorError::TopicUnknown(topic),
            ClientError::InvalidTopic(topic) => ConnectorError::InvalidTopic(topic),
            ClientError::CommitFailed { partitions, .. } => {
                ConnectorError::CommitFailed { partitions }
            }
            ClientError::Fatal(msg) => ConnectorError::Fatal(msg),
            ClientError::CloseTimedOut(timeout) => ConnectorError::ShutdownTimeout(timeout),
            ClientError::Transient(msg) | ClientError::Other(msg) => ConnectorError::Client(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_errors_map_to_connector_taxonomy() {
        let tp = TopicPartition::new("events", 0);

        assert_eq!(
            ConnectorError::from(ClientError::UnknownTopic("events".into())),
            ConnectorError::TopicUnknown("events".into())
        );
        assert_eq!(
            ConnectorError::from(ClientError::CommitFailed {
                partitions: BTreeSet::from([tp.clone()]),
                reason: "rebalance".into(),
            }),
            ConnectorError::commit_failed([tp])
        );
        assert!(ConnectorError::from(ClientError::Fatal("auth".into())).is_terminal());
        assert!(!ConnectorError::from(ClientError::Transient("broker down".into())).is_terminal());
    }
}
