use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::error::{ConnectorError, ConnectorResult};
use crate::kafka::types::{Subscription, TopicPartition};

pub type Reply<T> = oneshot::Sender<ConnectorResult<T>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataQuery {
    BeginningOffsets(BTreeSet<TopicPartition>),
    EndOffsets(BTreeSet<TopicPartition>),
    PartitionsFor(String),
    CommittedOffsets(BTreeSet<TopicPartition>),
    ListTopics,
    /// Timestamps in milliseconds since the epoch
    OffsetsForTimes(BTreeMap<TopicPartition, i64>),
}

impl MetadataQuery {
    /// Topics named by the query, validated before the client sees them
    pub fn topics(&self) -> BTreeSet<&str> {
        match self {
            MetadataQuery::BeginningOffsets(partitions)
            | MetadataQuery::EndOffsets(partitions)
            | MetadataQuery::CommittedOffsets(partitions) => {
                partitions.iter().map(TopicPartition::topic).collect()
            }
            MetadataQuery::PartitionsFor(topic) => BTreeSet::from([topic.as_str()]),
            MetadataQuery::ListTopics => BTreeSet::new(),
            MetadataQuery::OffsetsForTimes(timestamps) => {
                timestamps.keys().map(TopicPartition::topic).collect()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataResponse {
    Offsets(BTreeMap<TopicPartition, i64>),
    Partitions(Vec<TopicPartition>),
    CommittedOffsets(BTreeMap<TopicPartition, Option<i64>>),
    Topics(BTreeMap<String, Vec<TopicPartition>>),
    OffsetsForTimes(BTreeMap<TopicPartition, Option<i64>>),
}

/// Operations served by the coordinator thread, one at a time, in arrival order
#[derive(Debug)]
pub enum Request {
    Assign {
        subscription: Subscription,
        reply: Reply<()>,
    },
    RequestRecords {
        partitions: BTreeSet<TopicPartition>,
        max_batch: usize,
        reply: Reply<()>,
    },
    Seek {
        partition: TopicPartition,
        offset: i64,
        reply: Reply<()>,
    },
    /// Record offsets; the client commits `offset + 1`
    Commit {
        offsets: BTreeMap<TopicPartition, i64>,
        reply: Reply<BTreeMap<TopicPartition, i64>>,
    },
    Metadata {
        query: MetadataQuery,
        reply: Reply<MetadataResponse>,
    },
    Shutdown {
        stop_timeout: Duration,
        reply: Reply<()>,
    },
}

#[derive(Debug)]
pub struct PendingRequest {
    pub request: Request,
    pub received_at: Instant,
}

impl PendingRequest {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            received_at: Instant::now(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match &self.request {
            Request::Assign { .. } => "assign",
            Request::RequestRecords { .. } => "request_records",
            Request::Seek { .. } => "seek",
            Request::Commit { .. } => "commit",
            Request::Metadata { .. } => "metadata",
            Request::Shutdown { .. } => "shutdown",
        }
    }

    /// Answer with an error without touching the client. The caller may be gone.
    pub fn fail(self, error: ConnectorError) {
        match self.request {
            Request::Assign { reply, .. }
            | Request::RequestRecords { reply, .. }
            | Request::Seek { reply, .. }
            | Request::Shutdown { reply, .. } => {
                let _unused = reply.send(Err(error));
            }
            Request::Commit { reply, .. } => {
                let _unused = reply.send(Err(error));
            }
            Request::Metadata { reply, .. } => {
                let _unused = reply.send(Err(error));
            }
        }
    }
}

/// Kafka's rules for topic names: 1 to 249 characters out of `[a-zA-Z0-9._-]`, not `.` or `..`
pub fn validate_topic(topic: &str) -> ConnectorResult<()> {
    let legal = !topic.is_empty()
        && topic.len() <= 249
        && topic != "."
        && topic != ".."
        && topic
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));

    if legal {
        Ok(())
    } else {
        Err(ConnectorError::InvalidTopic(topic.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("events", true)]
    #[case("events_v2.raw-1", true)]
    #[case("non-existing topic", false)]
    #[case("", false)]
    #[case(".", false)]
    #[case("..", false)]
    #[case("caf\u{e9}", false)]
    fn test_validate_topic(#[case] topic: &str, #[case] valid: bool) {
        assert_eq!(validate_topic(topic).is_ok(), valid);
    }

    #[test]
    fn test_overlong_topic_is_invalid() {
        let topic = "a".repeat(250);
        assert_eq!(
            validate_topic(&topic),
            Err(ConnectorError::InvalidTopic(topic.clone()))
        );
    }

    #[test]
    fn test_fail_answers_the_caller() {
        let (reply, rx) = oneshot::channel();
        let pending = PendingRequest::new(Request::Seek {
            partition: TopicPartition::new("events", 0),
            offset: 3,
            reply,
        });
        assert_eq!(pending.kind(), "seek");

        pending.fail(ConnectorError::Cancelled);
        assert_eq!(rx.blocking_recv().unwrap(), Err(ConnectorError::Cancelled));
    }

    #[test]
    fn test_metadata_query_topics() {
        let query = MetadataQuery::EndOffsets(BTreeSet::from([
            TopicPartition::new("a", 0),
            TopicPartition::new("a", 1),
            TopicPartition::new("b", 0),
        ]));
        assert_eq!(query.topics(), BTreeSet::from(["a", "b"]));
        assert!(MetadataQuery::ListTopics.topics().is_empty());
    }
}
