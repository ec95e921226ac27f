use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use crate::error::ClientResult;
use crate::kafka::types::{ConsumerRecord, Subscription, TopicPartition};

/// Commits Kafka positions (next offset to read) while a revocation is in progress
pub type RevokeCommit<'a> = dyn FnMut(&BTreeMap<TopicPartition, i64>) -> ClientResult<()> + 'a;

/// Receives rebalance notifications from inside [`ConsumerClient::poll`].
///
/// Both callbacks run on the thread that called `poll`, before `poll` returns.
/// The client does not release revoked partitions, nor fetch assigned ones,
/// until the callback has returned.
pub trait RebalanceListener: Send + Sync {
    /// Called before the partitions are released. Anything committed through
    /// `commit` lands before another member can fetch the partitions.
    fn on_partitions_revoked(
        &self,
        partitions: &BTreeSet<TopicPartition>,
        commit: &mut RevokeCommit<'_>,
    );

    /// Called once the partitions are owned and paused. The returned positions are
    /// sought before the first fetch; partitions not in the map start from the
    /// committed offset (or the reset policy).
    fn on_partitions_assigned(
        &self,
        partitions: &BTreeSet<TopicPartition>,
    ) -> BTreeMap<TopicPartition, i64>;
}

/// Pull-based consumer client. Not safe for concurrent use: exactly one thread owns it.
///
/// Newly assigned partitions, through a group rebalance or [`ConsumerClient::assign`],
/// start paused.
pub trait ConsumerClient: Send + 'static {
    /// Join the group for the given topics or pattern. Replaces a previous subscription.
    fn subscribe(
        &mut self,
        subscription: &Subscription,
        listener: Arc<dyn RebalanceListener>,
    ) -> ClientResult<()>;

    /// Replace the manual assignment. `Some(offset)` starts the partition at that position.
    fn assign(&mut self, assignment: &BTreeMap<TopicPartition, Option<i64>>) -> ClientResult<()>;

    /// Fetch up to `max_records` from resumed partitions, waiting at most `timeout`.
    /// Rebalance callbacks fire from within this call.
    fn poll(&mut self, timeout: Duration, max_records: usize) -> ClientResult<Vec<ConsumerRecord>>;

    fn pause(&mut self, partitions: &BTreeSet<TopicPartition>) -> ClientResult<()>;

    fn resume(&mut self, partitions: &BTreeSet<TopicPartition>) -> ClientResult<()>;

    fn seek(&mut self, partition: &TopicPartition, offset: i64) -> ClientResult<()>;

    /// Synchronously commit positions. Partial failure is reported as
    /// [`ClientError::CommitFailed`](crate::error::ClientError::CommitFailed) naming
    /// only the rejected partitions.
    fn commit(&mut self, positions: &BTreeMap<TopicPartition, i64>) -> ClientResult<()>;

    fn beginning_offsets(
        &mut self,
        partitions: &BTreeSet<TopicPartition>,
        timeout: Duration,
    ) -> ClientResult<BTreeMap<TopicPartition, i64>>;

    fn end_offsets(
        &mut self,
        partitions: &BTreeSet<TopicPartition>,
        timeout: Duration,
    ) -> ClientResult<BTreeMap<TopicPartition, i64>>;

    fn committed_offsets(
        &mut self,
        partitions: &BTreeSet<TopicPartition>,
        timeout: Duration,
    ) -> ClientResult<BTreeMap<TopicPartition, Option<i64>>>;

    fn partitions_for(
        &mut self,
        topic: &str,
        timeout: Duration,
    ) -> ClientResult<Vec<TopicPartition>>;

    fn list_topics(
        &mut self,
        timeout: Duration,
    ) -> ClientResult<BTreeMap<String, Vec<TopicPartition>>>;

    /// Earliest offset whose timestamp is at or after the given one, `None` past the end
    fn offsets_for_times(
        &mut self,
        timestamps: &BTreeMap<TopicPartition, i64>,
        timeout: Duration,
    ) -> ClientResult<BTreeMap<TopicPartition, Option<i64>>>;

    /// Leave the group and release the client. Revocation callbacks run from
    /// within this call. Subsequent calls fail with a fatal error.
    fn close(&mut self, timeout: Duration) -> ClientResult<()>;
}
