use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::commit::aggregator::{CommitAck, Committer};
use crate::error::ConnectorResult;
use crate::kafka::types::TopicPartition;

/// Counts records handed to the application whose offsets have not been
/// committed or dropped yet.
#[derive(Debug, Default)]
pub struct OutstandingOffsets {
    count: AtomicUsize,
    settled: Notify,
}

impl OutstandingOffsets {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub(crate) fn track(self: &Arc<Self>) -> Arc<OutstandingGuard> {
        self.count.fetch_add(1, Ordering::SeqCst);
        Arc::new(OutstandingGuard {
            outstanding: self.clone(),
        })
    }

    /// Resolves once nothing is outstanding
    pub async fn settled(&self) {
        loop {
            let notified = self.settled.notified();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Held by every copy of a delivered offset; released when the last copy is
/// committed or dropped.
#[derive(Debug)]
pub struct OutstandingGuard {
    outstanding: Arc<OutstandingOffsets>,
}

impl Drop for OutstandingGuard {
    fn drop(&mut self) {
        if self.outstanding.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.outstanding.settled.notify_waiters();
        }
    }
}

/// A record offset and the assignment generation of its partition at the time
/// it was handed out. Offsets from an earlier generation are never committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IssuedOffset {
    pub offset: i64,
    pub generation: u64,
}

/// Offset of one consumed record, committable through the committer that issued it.
///
/// `offset` is the record's own offset; committing stores `offset + 1` in Kafka.
#[derive(Clone)]
pub struct CommittableOffset {
    partition: TopicPartition,
    offset: i64,
    generation: u64,
    group_id: Arc<str>,
    metadata: Option<String>,
    committer: Committer,
    _outstanding: Option<Arc<OutstandingGuard>>,
}

impl CommittableOffset {
    pub(crate) fn new(
        partition: TopicPartition,
        offset: i64,
        generation: u64,
        group_id: Arc<str>,
        committer: Committer,
        outstanding: Option<Arc<OutstandingGuard>>,
    ) -> Self {
        Self {
            partition,
            offset,
            generation,
            group_id,
            metadata: None,
            committer,
            _outstanding: outstanding,
        }
    }

    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    pub fn partition(&self) -> &TopicPartition {
        &self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub(crate) fn issued(&self) -> IssuedOffset {
        IssuedOffset {
            offset: self.offset,
            generation: self.generation,
        }
    }

    /// What Kafka stores once this offset is committed
    pub fn position(&self) -> i64 {
        self.offset + 1
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn metadata(&self) -> Option<&str> {
        self.metadata.as_deref()
    }

    pub fn committer(&self) -> &Committer {
        &self.committer
    }

    /// Commit and wait until the offset is covered by a successful commit
    pub async fn commit(self) -> ConnectorResult<CommitAck> {
        let committer = self.committer.clone();
        committer.commit_single(self).await
    }

    /// Hand the offset to the committer without waiting for the outcome
    pub fn submit(self) {
        let committer = self.committer.clone();
        committer.submit(self)
    }
}

impl fmt::Debug for CommittableOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommittableOffset")
            .field("partition", &self.partition)
            .field("offset", &self.offset)
            .field("group_id", &self.group_id)
            .field("metadata", &self.metadata)
            .finish()
    }
}

impl PartialEq for CommittableOffset {
    fn eq(&self, other: &Self) -> bool {
        self.partition == other.partition
            && self.offset == other.offset
            && self.generation == other.generation
            && self.group_id == other.group_id
            && self.metadata == other.metadata
    }
}

/// Highest record offset per partition. Offsets only move forward within an
/// assignment of the partition; an offset from a later assignment replaces the
/// earlier ones.
#[derive(Debug, Clone, Default)]
pub struct CommittableOffsetBatch {
    offsets: BTreeMap<TopicPartition, i64>,
    generations: BTreeMap<TopicPartition, u64>,
    committer: Option<Committer>,
}

impl CommittableOffsetBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an offset; a lower offset for a partition already in the batch is ignored
    pub fn update(&mut self, offset: CommittableOffset) {
        self.keep(offset.partition.clone(), offset.issued());
        if self.committer.is_none() {
            self.committer = Some(offset.committer.clone());
        }
    }

    pub fn merge(&mut self, other: CommittableOffsetBatch) {
        for (partition, offset) in other.offsets {
            let generation = other.generations.get(&partition).copied().unwrap_or(0);
            self.keep(partition, IssuedOffset { offset, generation });
        }
        if self.committer.is_none() {
            self.committer = other.committer;
        }
    }

    fn keep(&mut self, partition: TopicPartition, issued: IssuedOffset) {
        let current = self
            .offsets
            .get(&partition)
            .zip(self.generations.get(&partition));
        let replace = match current {
            None => true,
            Some((&offset, &generation)) => {
                issued.generation > generation
                    || (issued.generation == generation && issued.offset > offset)
            }
        };
        if replace {
            self.offsets.insert(partition.clone(), issued.offset);
            self.generations.insert(partition, issued.generation);
        }
    }

    pub fn offsets(&self) -> &BTreeMap<TopicPartition, i64> {
        &self.offsets
    }

    pub fn get(&self, partition: &TopicPartition) -> Option<i64> {
        self.offsets.get(partition).copied()
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub(crate) fn into_offsets(self) -> BTreeMap<TopicPartition, IssuedOffset> {
        let generations = self.generations;
        self.offsets
            .into_iter()
            .map(|(partition, offset)| {
                let generation = generations.get(&partition).copied().unwrap_or(0);
                (partition, IssuedOffset { offset, generation })
            })
            .collect()
    }

    /// Commit the whole batch. An empty batch succeeds without a round trip.
    pub async fn commit(self) -> ConnectorResult<CommitAck> {
        match self.committer.clone() {
            Some(committer) => committer.commit_batch(self).await,
            None => Ok(CommitAck::default()),
        }
    }
}

impl FromIterator<CommittableOffset> for CommittableOffsetBatch {
    fn from_iter<I: IntoIterator<Item = CommittableOffset>>(iter: I) -> Self {
        let mut batch = CommittableOffsetBatch::new();
        for offset in iter {
            batch.update(offset);
        }
        batch
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn offset(committer: &Committer, partition: i32, offset: i64) -> CommittableOffset {
        committer.committable_offset(TopicPartition::new("events", partition), offset)
    }

    #[test]
    fn test_position_is_next_offset() {
        let committer = Committer::detached("group");
        let offset = offset(&committer, 0, 41);
        assert_eq!(offset.position(), 42);
        assert_eq!(offset.group_id(), "group");
    }

    #[test]
    fn test_batch_keeps_highest_offset() {
        let committer = Committer::detached("group");
        let mut batch = CommittableOffsetBatch::new();
        batch.update(offset(&committer, 0, 10));
        batch.update(offset(&committer, 0, 7));
        batch.update(offset(&committer, 1, 3));

        assert_eq!(batch.get(&TopicPartition::new("events", 0)), Some(10));
        assert_eq!(batch.len(), 2);

        let mut other: CommittableOffsetBatch =
            [offset(&committer, 0, 4), offset(&committer, 1, 9)].into_iter().collect();
        other.merge(batch);
        assert_eq!(other.get(&TopicPartition::new("events", 0)), Some(10));
        assert_eq!(other.get(&TopicPartition::new("events", 1)), Some(9));
    }

    #[tokio::test]
    async fn test_empty_batch_commits_trivially() {
        let ack = CommittableOffsetBatch::new().commit().await.unwrap();
        assert!(ack.is_empty());
    }

    #[tokio::test]
    async fn test_outstanding_settles_when_all_copies_dropped() {
        let outstanding = OutstandingOffsets::new();
        let guard = outstanding.track();
        let copy = guard.clone();
        assert_eq!(outstanding.count(), 1);

        drop(guard);
        assert_eq!(outstanding.count(), 1);

        let waiter = {
            let outstanding = outstanding.clone();
            tokio::spawn(async move { outstanding.settled().await })
        };
        drop(copy);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("outstanding offsets did not settle")
            .unwrap();
        assert_eq!(outstanding.count(), 0);
    }
}
