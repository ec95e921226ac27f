use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use bytes::Bytes;
use rdkafka::topic_partition_list::TopicPartitionListElem;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    topic: String,
    partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition)
    }
}

impl From<TopicPartitionListElem<'_>> for TopicPartition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic(), elem.partition())
    }
}

/// A record fetched by the consumer client. Never mutated after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerRecord {
    topic_partition: TopicPartition,
    offset: i64,
    key: Option<Bytes>,
    value: Option<Bytes>,
    timestamp: Option<i64>,
    headers: Vec<(String, Option<Bytes>)>,
}

impl ConsumerRecord {
    pub fn new(
        topic_partition: TopicPartition,
        offset: i64,
        key: Option<Bytes>,
        value: Option<Bytes>,
        timestamp: Option<i64>,
    ) -> Self {
        Self {
            topic_partition,
            offset,
            key,
            value,
            timestamp,
            headers: Vec::new(),
        }
    }

    pub fn with_headers(mut self, headers: Vec<(String, Option<Bytes>)>) -> Self {
        self.headers = headers;
        self
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.topic_partition
    }

    pub fn topic(&self) -> &str {
        self.topic_partition.topic()
    }

    pub fn partition(&self) -> i32 {
        self.topic_partition.partition()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn key(&self) -> Option<&Bytes> {
        self.key.as_ref()
    }

    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    /// Milliseconds since the epoch, when the broker reported one
    pub fn timestamp(&self) -> Option<i64> {
        self.timestamp
    }

    pub fn headers(&self) -> &[(String, Option<Bytes>)] {
        &self.headers
    }

    /// Rough in-memory footprint used for buffer accounting
    pub fn estimated_size(&self) -> usize {
        self.key.as_ref().map(|k| k.len()).unwrap_or(0)
            + self.value.as_ref().map(|v| v.len()).unwrap_or(0)
            + self.topic_partition.topic().len()
    }
}

/// What the consumer should read from.
///
/// A consumer holds exactly one kind of subscription at a time. Topic lists and
/// manual assignments can be extended by later calls of the same kind, a pattern
/// replaces the previous pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscription {
    Topics(BTreeSet<String>),
    Pattern(String),
    Assignment(BTreeSet<TopicPartition>),
    AssignmentWithOffsets(BTreeMap<TopicPartition, i64>),
}

impl Subscription {
    pub fn topics<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Subscription::Topics(topics.into_iter().map(Into::into).collect())
    }

    pub fn pattern(pattern: impl Into<String>) -> Self {
        Subscription::Pattern(pattern.into())
    }

    pub fn assignment(partitions: impl IntoIterator<Item = TopicPartition>) -> Self {
        Subscription::Assignment(partitions.into_iter().collect())
    }

    pub fn assignment_with_offsets(
        offsets: impl IntoIterator<Item = (TopicPartition, i64)>,
    ) -> Self {
        Subscription::AssignmentWithOffsets(offsets.into_iter().collect())
    }

    pub fn kind(&self) -> SubscriptionKind {
        match self {
            Subscription::Topics(_) => SubscriptionKind::Topics,
            Subscription::Pattern(_) => SubscriptionKind::Pattern,
            Subscription::Assignment(_) | Subscription::AssignmentWithOffsets(_) => {
                SubscriptionKind::Manual
            }
        }
    }

    /// Whether the group coordinator hands out partitions (as opposed to manual assignment)
    pub fn is_group_managed(&self) -> bool {
        !matches!(self.kind(), SubscriptionKind::Manual)
    }

    /// Combine a follow-up subscription with this one. Returns `None` when the
    /// kinds differ and the update must be rejected.
    pub fn merge(&self, update: &Subscription) -> Option<Subscription> {
        match (self, update) {
            (Subscription::Topics(current), Subscription::Topics(new)) => Some(
                Subscription::Topics(current.union(new).cloned().collect()),
            ),
            (Subscription::Pattern(_), Subscription::Pattern(new)) => {
                Some(Subscription::Pattern(new.clone()))
            }
            (current, new)
                if current.kind() == SubscriptionKind::Manual
                    && new.kind() == SubscriptionKind::Manual =>
            {
                let partitions: BTreeSet<TopicPartition> = current
                    .manual_partitions()
                    .into_iter()
                    .chain(new.manual_partitions())
                    .collect();
                let mut offsets = current.manual_offsets();
                offsets.extend(new.manual_offsets());

                // pinned offsets only survive if every partition has one
                if !offsets.is_empty() && partitions.iter().all(|tp| offsets.contains_key(tp)) {
                    Some(Subscription::AssignmentWithOffsets(offsets))
                } else {
                    Some(Subscription::Assignment(partitions))
                }
            }
            _ => None,
        }
    }

    pub fn manual_partitions(&self) -> BTreeSet<TopicPartition> {
        match self {
            Subscription::Assignment(partitions) => partitions.clone(),
            Subscription::AssignmentWithOffsets(offsets) => offsets.keys().cloned().collect(),
            _ => BTreeSet::new(),
        }
    }

    pub fn manual_offsets(&self) -> BTreeMap<TopicPartition, i64> {
        match self {
            Subscription::AssignmentWithOffsets(offsets) => offsets.clone(),
            _ => BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    Topics,
    Pattern,
    Manual,
}

impl fmt::Display for SubscriptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionKind::Topics => write!(f, "topics"),
            SubscriptionKind::Pattern => write!(f, "pattern"),
            SubscriptionKind::Manual => write!(f, "manual assignment"),
        }
    }
}

/// Lifecycle of a partition on this member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    Unassigned,
    Assigning, // buffers created, waiting for initial positions
    Active,    // sub-stream running
    Revoking,  // sub-stream signaled, draining
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PartitionState::Unassigned => "unassigned",
            PartitionState::Assigning => "assigning",
            PartitionState::Active => "active",
            PartitionState::Revoking => "revoking",
        };
        f.write_str(name)
    }
}

/// Process-wide rebalance notification, mostly for observability
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebalanceEvent {
    Assigned(BTreeSet<TopicPartition>),
    Revoked(BTreeSet<TopicPartition>),
}
