use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::commit::offsets::{
    CommittableOffset, CommittableOffsetBatch, IssuedOffset, OutstandingGuard,
};
use crate::config::CommitterSettings;
use crate::coordinator::CoordinatorHandle;
use crate::error::{ClientError, ClientResult, ConnectorError, ConnectorResult};
use crate::kafka::types::TopicPartition;
use crate::metrics_const::{
    COMMIT_ABANDONED_COUNTER, COMMIT_BATCHES_COUNTER, COMMIT_BATCH_SIZE_HISTOGRAM,
    COMMIT_DURATION_HISTOGRAM,
};

/// Record offsets covered by a successful commit, per partition
pub type CommitAck = BTreeMap<TopicPartition, i64>;

type AckReply = oneshot::Sender<ConnectorResult<CommitAck>>;

#[derive(Debug)]
pub(crate) enum AggregatorCommand {
    Commit {
        offsets: BTreeMap<TopicPartition, IssuedOffset>,
        reply: Option<AckReply>,
    },
    Flush {
        reply: oneshot::Sender<ConnectorResult<()>>,
    },
    Revoke {
        partitions: BTreeSet<TopicPartition>,
        reply: oneshot::Sender<RevokedCommits>,
    },
    RevokeCompleted {
        committed: BTreeSet<TopicPartition>,
        failed: BTreeSet<TopicPartition>,
    },
    Shutdown,
}

/// Handle to the offset commit aggregator. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Committer {
    tx: mpsc::UnboundedSender<AggregatorCommand>,
    group_id: Arc<str>,
    /// Bumped by the aggregator each time a partition is revoked
    generations: Arc<DashMap<TopicPartition, u64>>,
}

impl Committer {
    /// Start the aggregator task. Must be called from within a tokio runtime.
    pub fn spawn(
        coordinator: CoordinatorHandle,
        settings: CommitterSettings,
        group_id: &str,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let generations = Arc::new(DashMap::new());
        let aggregator =
            CommitAggregator::new(coordinator, settings, generations.clone(), tx.downgrade());
        let task = tokio::spawn(aggregator.run(rx));
        (
            Self {
                tx,
                group_id: Arc::from(group_id),
                generations,
            },
            task,
        )
    }

    /// A committer with no aggregator behind it; every commit fails with `Cancelled`
    pub fn detached(group_id: &str) -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self {
            tx,
            group_id: Arc::from(group_id),
            generations: Arc::new(DashMap::new()),
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    fn generation(&self, partition: &TopicPartition) -> u64 {
        self.generations.get(partition).map_or(0, |generation| *generation)
    }

    /// Offset for a record obtained outside of a partition stream
    pub fn committable_offset(&self, partition: TopicPartition, offset: i64) -> CommittableOffset {
        let generation = self.generation(&partition);
        CommittableOffset::new(
            partition,
            offset,
            generation,
            self.group_id.clone(),
            self.clone(),
            None,
        )
    }

    pub(crate) fn delivered_offset(
        &self,
        partition: TopicPartition,
        offset: i64,
        outstanding: Arc<OutstandingGuard>,
    ) -> CommittableOffset {
        let generation = self.generation(&partition);
        CommittableOffset::new(
            partition,
            offset,
            generation,
            self.group_id.clone(),
            self.clone(),
            Some(outstanding),
        )
    }

    /// Resolves once the offset is covered by a successful commit
    pub async fn commit_single(&self, offset: CommittableOffset) -> ConnectorResult<CommitAck> {
        let offsets = BTreeMap::from([(offset.partition().clone(), offset.issued())]);
        self.commit_offsets(offsets, Some(offset)).await
    }

    /// Resolves once every partition of the batch is committed, or with
    /// `CommitFailed` naming only the partitions that could not be.
    pub async fn commit_batch(&self, batch: CommittableOffsetBatch) -> ConnectorResult<CommitAck> {
        if batch.is_empty() {
            return Ok(CommitAck::default());
        }
        self.commit_offsets(batch.into_offsets(), None).await
    }

    async fn commit_offsets(
        &self,
        offsets: BTreeMap<TopicPartition, IssuedOffset>,
        release_after_send: Option<CommittableOffset>,
    ) -> ConnectorResult<CommitAck> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(AggregatorCommand::Commit {
                offsets,
                reply: Some(reply),
            })
            .map_err(|_| ConnectorError::Cancelled)?;
        // the aggregator owns the offset now; waiting must not hold up a revocation
        drop(release_after_send);

        rx.await.unwrap_or(Err(ConnectorError::Cancelled))
    }

    /// Queue the offset for the next commit without waiting for the outcome
    pub fn submit(&self, offset: CommittableOffset) {
        let offsets = BTreeMap::from([(offset.partition().clone(), offset.issued())]);
        if self
            .tx
            .send(AggregatorCommand::Commit {
                offsets,
                reply: None,
            })
            .is_err()
        {
            debug!("Committer stopped, dropping offset {}", offset.offset());
        }
    }

    /// Commit everything pending now and wait for the outcome
    pub async fn flush(&self) -> ConnectorResult<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(AggregatorCommand::Flush { reply })
            .map_err(|_| ConnectorError::Cancelled)?;
        rx.await.unwrap_or(Err(ConnectorError::Cancelled))
    }

    /// Take the pending offsets of partitions being revoked. The aggregator will
    /// not commit them itself any more, and offsets handed out before the
    /// revocation are refused from now on.
    pub(crate) async fn revoke(&self, partitions: BTreeSet<TopicPartition>) -> RevokedCommits {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(AggregatorCommand::Revoke { partitions, reply })
            .is_err()
        {
            return RevokedCommits::default();
        }
        rx.await.unwrap_or_default()
    }

    pub(crate) fn shutdown(&self) {
        if self.tx.send(AggregatorCommand::Shutdown).is_err() {
            debug!("Committer already stopped");
        }
    }
}

/// Pending offsets of revoked partitions, to be committed by the revocation itself
#[derive(Debug, Default)]
pub struct RevokedCommits {
    offsets: BTreeMap<TopicPartition, i64>,
    reporter: Option<mpsc::UnboundedSender<AggregatorCommand>>,
}

impl RevokedCommits {
    /// Record offsets
    pub fn offsets(&self) -> &BTreeMap<TopicPartition, i64> {
        &self.offsets
    }

    /// Kafka positions to commit
    pub fn positions(&self) -> BTreeMap<TopicPartition, i64> {
        self.offsets
            .iter()
            .map(|(tp, offset)| (tp.clone(), offset + 1))
            .collect()
    }

    /// Report the commit outcome so callers waiting on these offsets get an answer
    pub fn complete(self, result: &ClientResult<()>) {
        let all: BTreeSet<TopicPartition> = self.offsets.keys().cloned().collect();
        let (committed, failed) = match result {
            Ok(()) => (all, BTreeSet::new()),
            Err(ClientError::CommitFailed { partitions, .. }) => {
                let failed: BTreeSet<TopicPartition> =
                    all.intersection(partitions).cloned().collect();
                (all.difference(&failed).cloned().collect(), failed)
            }
            Err(_) => (BTreeSet::new(), all),
        };

        if let Some(reporter) = self.reporter {
            if reporter
                .send(AggregatorCommand::RevokeCompleted { committed, failed })
                .is_err()
            {
                debug!("Committer stopped before revocation outcome");
            }
        }
    }
}

#[derive(Debug, Default)]
struct PartitionCommits {
    /// Highest record offset known to be committed
    acknowledged: Option<i64>,
    pending: Option<i64>,
    in_flight: Option<i64>,
    /// Highest offset given to a revocation to commit
    handed_over: Option<i64>,
    failed_attempts: u32,
    /// (waiter id, offset) pairs still waiting on this partition
    waiters: Vec<(u64, i64)>,
}

impl PartitionCommits {
    /// Offsets at or below this are already taken care of
    fn floor(&self) -> Option<i64> {
        self.acknowledged
            .max(self.in_flight)
            .max(self.pending)
            .max(self.handed_over)
    }
}

struct CommitWaiter {
    remaining: BTreeSet<TopicPartition>,
    acknowledged: CommitAck,
    failed: BTreeSet<TopicPartition>,
    reply: AckReply,
}

struct InFlightCommit {
    offsets: BTreeMap<TopicPartition, i64>,
    /// Revoked while the commit was out; never retried
    revoked: BTreeSet<TopicPartition>,
    started: Instant,
    task: JoinHandle<ConnectorResult<CommitAck>>,
}

enum Wake {
    Command(Option<AggregatorCommand>),
    Committed(Result<ConnectorResult<CommitAck>, JoinError>),
    WindowElapsed,
}

/// Batches offsets and commits them through the coordinator, one commit at a time.
///
/// Per partition only the highest pending offset is kept. A commit is issued when
/// `max_batch` partitions are pending, when the oldest pending offset is
/// `max_interval` old, or on flush. Offsets at or below what is committed or in
/// flight are no-ops, so committed positions never go backwards. Revoking a
/// partition starts a new generation for it; offsets issued in an earlier one
/// fail with `CommitFailed`.
struct CommitAggregator {
    coordinator: CoordinatorHandle,
    settings: CommitterSettings,
    generations: Arc<DashMap<TopicPartition, u64>>,
    partitions: BTreeMap<TopicPartition, PartitionCommits>,
    waiters: HashMap<u64, CommitWaiter>,
    next_waiter: u64,
    window_opened: Option<Instant>,
    flushes: Vec<oneshot::Sender<ConnectorResult<()>>>,
    revoking: BTreeMap<TopicPartition, Vec<(u64, i64)>>,
    reporter: mpsc::WeakUnboundedSender<AggregatorCommand>,
}

impl CommitAggregator {
    fn new(
        coordinator: CoordinatorHandle,
        settings: CommitterSettings,
        generations: Arc<DashMap<TopicPartition, u64>>,
        reporter: mpsc::WeakUnboundedSender<AggregatorCommand>,
    ) -> Self {
        Self {
            coordinator,
            settings,
            generations,
            partitions: BTreeMap::new(),
            waiters: HashMap::new(),
            next_waiter: 0,
            window_opened: None,
            flushes: Vec::new(),
            revoking: BTreeMap::new(),
            reporter,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<AggregatorCommand>) {
        info!(
            max_batch = self.settings.max_batch,
            max_interval = ?self.settings.max_interval,
            "Commit aggregator started"
        );
        let mut in_flight: Option<InFlightCommit> = None;

        loop {
            if in_flight.is_none() && self.should_commit() {
                in_flight = self.issue();
            }
            if in_flight.is_none() && self.pending_count() == 0 {
                self.answer_flushes();
            }

            let deadline = self
                .window_opened
                .map(|opened| opened + self.settings.max_interval)
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            let window_open = self.window_opened.is_some() && in_flight.is_none();
            let committing = in_flight.is_some();

            let wake = tokio::select! {
                command = rx.recv() => Wake::Command(command),
                joined = async {
                    match in_flight.as_mut() {
                        Some(commit) => (&mut commit.task).await,
                        None => std::future::pending().await,
                    }
                }, if committing => Wake::Committed(joined),
                _ = tokio::time::sleep_until(deadline), if window_open => Wake::WindowElapsed,
            };

            match wake {
                Wake::Command(None) | Wake::Command(Some(AggregatorCommand::Shutdown)) => break,
                Wake::Command(Some(command)) => self.handle(command, in_flight.as_mut()),
                Wake::Committed(joined) => {
                    if let Some(commit) = in_flight.take() {
                        let result = joined.unwrap_or_else(|e| {
                            Err(ConnectorError::Client(format!("commit task failed: {e}")))
                        });
                        self.committed(commit, result);
                    }
                }
                // picked up by should_commit on the next turn
                Wake::WindowElapsed => {}
            }
        }

        if let Some(commit) = in_flight {
            commit.task.abort();
        }
        self.cancel_everything();
        info!("Commit aggregator stopped");
    }

    fn handle(&mut self, command: AggregatorCommand, in_flight: Option<&mut InFlightCommit>) {
        match command {
            AggregatorCommand::Commit { offsets, reply } => self.add(offsets, reply),
            AggregatorCommand::Flush { reply } => self.flushes.push(reply),
            AggregatorCommand::Revoke { partitions, reply } => {
                if let Some(commit) = in_flight {
                    commit.revoked.extend(
                        partitions
                            .iter()
                            .filter(|tp| commit.offsets.contains_key(*tp))
                            .cloned(),
                    );
                }
                let revoked = self.revoke(&partitions);
                if reply.send(revoked).is_err() {
                    debug!("Revocation stopped waiting for pending offsets");
                }
            }
            AggregatorCommand::RevokeCompleted { committed, failed } => {
                for tp in committed {
                    if let Some(entry) = self.partitions.get_mut(&tp) {
                        entry.acknowledged = entry.acknowledged.max(entry.handed_over);
                    }
                    for (id, offset) in self.revoking.remove(&tp).unwrap_or_default() {
                        self.settle(id, &tp, offset, true);
                    }
                }
                for tp in failed {
                    metrics::counter!(COMMIT_ABANDONED_COUNTER, "reason" => "revoked").increment(1);
                    for (id, offset) in self.revoking.remove(&tp).unwrap_or_default() {
                        self.settle(id, &tp, offset, false);
                    }
                }
            }
            AggregatorCommand::Shutdown => {}
        }
    }

    fn add(&mut self, offsets: BTreeMap<TopicPartition, IssuedOffset>, reply: Option<AckReply>) {
        let id = self.next_waiter;
        self.next_waiter += 1;
        let mut waiter = reply.map(|reply| CommitWaiter {
            remaining: BTreeSet::new(),
            acknowledged: CommitAck::new(),
            failed: BTreeSet::new(),
            reply,
        });

        for (tp, issued) in offsets {
            let offset = issued.offset;
            let generation = self.generations.get(&tp).map_or(0, |g| *g);
            if issued.generation < generation {
                debug!(
                    topic = tp.topic(),
                    partition = tp.partition(),
                    offset,
                    "Refusing offset handed out before the partition was revoked"
                );
                metrics::counter!(COMMIT_ABANDONED_COUNTER, "reason" => "stale").increment(1);
                if let Some(waiter) = waiter.as_mut() {
                    waiter.failed.insert(tp);
                }
                continue;
            }

            let entry = self.partitions.entry(tp.clone()).or_default();

            if entry.acknowledged.is_some_and(|acked| acked >= offset) {
                // already committed, nothing to do
                if let Some(waiter) = waiter.as_mut() {
                    waiter.acknowledged.insert(tp, offset);
                }
                continue;
            }
            if entry.handed_over.is_some_and(|handed| handed >= offset) {
                // left to a revocation whose commit did not go through
                if let Some(waiter) = waiter.as_mut() {
                    waiter.failed.insert(tp);
                }
                continue;
            }
            if entry.floor().map_or(true, |floor| offset > floor) {
                entry.pending = Some(offset);
                if self.window_opened.is_none() {
                    self.window_opened = Some(Instant::now());
                }
            }
            if let Some(waiter) = waiter.as_mut() {
                entry.waiters.push((id, offset));
                waiter.remaining.insert(tp);
            }
        }

        if let Some(waiter) = waiter {
            if waiter.remaining.is_empty() {
                finish(waiter);
            } else {
                self.waiters.insert(id, waiter);
            }
        }
    }

    fn pending_count(&self) -> usize {
        self.partitions
            .values()
            .filter(|entry| entry.pending.is_some())
            .count()
    }

    fn should_commit(&self) -> bool {
        let pending = self.pending_count();
        if pending == 0 {
            return false;
        }
        pending >= self.settings.max_batch
            || !self.flushes.is_empty()
            || self
                .window_opened
                .is_some_and(|opened| opened.elapsed() >= self.settings.max_interval)
    }

    fn issue(&mut self) -> Option<InFlightCommit> {
        let mut offsets = BTreeMap::new();
        for (tp, entry) in self.partitions.iter_mut() {
            if let Some(offset) = entry.pending.take() {
                entry.in_flight = Some(offset);
                offsets.insert(tp.clone(), offset);
            }
        }
        self.window_opened = None;
        if offsets.is_empty() {
            return None;
        }

        debug!("Committing {} partitions", offsets.len());
        metrics::histogram!(COMMIT_BATCH_SIZE_HISTOGRAM).record(offsets.len() as f64);

        let coordinator = self.coordinator.clone();
        let timeout = self.settings.commit_timeout;
        let request = offsets.clone();
        let task = tokio::spawn(async move { coordinator.commit(request, timeout).await });

        Some(InFlightCommit {
            offsets,
            revoked: BTreeSet::new(),
            started: Instant::now(),
            task,
        })
    }

    fn committed(&mut self, commit: InFlightCommit, result: ConnectorResult<CommitAck>) {
        metrics::histogram!(COMMIT_DURATION_HISTOGRAM)
            .record(commit.started.elapsed().as_secs_f64());

        let outcome = match &result {
            Ok(_) => "success",
            Err(ConnectorError::CommitFailed { .. }) => "partial",
            Err(_) => "failure",
        };
        metrics::counter!(COMMIT_BATCHES_COUNTER, "outcome" => outcome).increment(1);

        let (failed, retriable): (BTreeSet<TopicPartition>, bool) = match result {
            Ok(_) => (BTreeSet::new(), true),
            Err(ConnectorError::CommitFailed { partitions }) => (partitions, true),
            Err(e) => {
                warn!("Commit of {} partitions failed: {}", commit.offsets.len(), e);
                let retriable = !e.is_terminal();
                (commit.offsets.keys().cloned().collect(), retriable)
            }
        };

        for (tp, offset) in commit.offsets {
            if failed.contains(&tp) {
                let retry = retriable && !commit.revoked.contains(&tp);
                self.commit_failed(&tp, offset, retry);
            } else {
                self.acknowledge(&tp, offset);
            }
        }
    }

    fn acknowledge(&mut self, tp: &TopicPartition, offset: i64) {
        let Some(entry) = self.partitions.get_mut(tp) else {
            return;
        };
        entry.in_flight = None;
        entry.failed_attempts = 0;
        entry.acknowledged = entry.acknowledged.max(Some(offset));
        if entry.pending.is_some_and(|pending| pending <= offset) {
            entry.pending = None;
        }

        let (covered, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut entry.waiters)
            .into_iter()
            .partition(|(_, waited)| *waited <= offset);
        entry.waiters = waiting;
        for (id, waited) in covered {
            self.settle(id, tp, waited, true);
        }
    }

    fn commit_failed(&mut self, tp: &TopicPartition, offset: i64, retry: bool) {
        let max_attempts = self.settings.max_attempts;
        let Some(entry) = self.partitions.get_mut(tp) else {
            return;
        };
        entry.in_flight = None;
        entry.failed_attempts += 1;

        if retry && entry.failed_attempts < max_attempts {
            debug!(
                topic = tp.topic(),
                partition = tp.partition(),
                offset,
                attempt = entry.failed_attempts,
                "Commit failed, retrying with the next batch"
            );
            entry.pending = entry.pending.max(Some(offset));
            if self.window_opened.is_none() {
                self.window_opened = Some(Instant::now());
            }
            return;
        }

        warn!(
            topic = tp.topic(),
            partition = tp.partition(),
            offset,
            attempts = entry.failed_attempts,
            "Giving up on commit"
        );
        let reason = if retry { "attempts_exhausted" } else { "not_retriable" };
        metrics::counter!(COMMIT_ABANDONED_COUNTER, "reason" => reason).increment(1);
        entry.failed_attempts = 0;

        let (abandoned, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut entry.waiters)
            .into_iter()
            .partition(|(_, waited)| *waited <= offset);
        entry.waiters = waiting;
        for (id, waited) in abandoned {
            self.settle(id, tp, waited, false);
        }
    }

    fn revoke(&mut self, partitions: &BTreeSet<TopicPartition>) -> RevokedCommits {
        let mut offsets = BTreeMap::new();
        for tp in partitions {
            *self.generations.entry(tp.clone()).or_insert(0) += 1;

            let Some(entry) = self.partitions.get_mut(tp) else {
                continue;
            };
            // the revocation commits the highest offset we know of, in flight or not
            let highest = entry.pending.take().max(entry.in_flight);
            entry.failed_attempts = 0;
            let waiters = std::mem::take(&mut entry.waiters);
            match highest {
                Some(offset) => {
                    entry.handed_over = entry.handed_over.max(Some(offset));
                    offsets.insert(tp.clone(), offset);
                    if !waiters.is_empty() {
                        self.revoking.entry(tp.clone()).or_default().extend(waiters);
                    }
                }
                None => {
                    for (id, waited) in waiters {
                        self.settle(id, tp, waited, false);
                    }
                }
            }
        }
        if self.pending_count() == 0 {
            self.window_opened = None;
        }

        RevokedCommits {
            offsets,
            reporter: self.reporter.upgrade(),
        }
    }

    fn settle(&mut self, id: u64, tp: &TopicPartition, offset: i64, committed: bool) {
        let Some(waiter) = self.waiters.get_mut(&id) else {
            return;
        };
        if !waiter.remaining.remove(tp) {
            return;
        }
        if committed {
            waiter.acknowledged.insert(tp.clone(), offset);
        } else {
            waiter.failed.insert(tp.clone());
        }
        if waiter.remaining.is_empty() {
            if let Some(waiter) = self.waiters.remove(&id) {
                finish(waiter);
            }
        }
    }

    fn answer_flushes(&mut self) {
        for reply in self.flushes.drain(..) {
            if reply.send(Ok(())).is_err() {
                debug!("Flush caller stopped waiting");
            }
        }
    }

    fn cancel_everything(&mut self) {
        for (_, waiter) in self.waiters.drain() {
            if waiter.reply.send(Err(ConnectorError::Cancelled)).is_err() {
                debug!("Commit caller stopped waiting");
            }
        }
        for reply in self.flushes.drain(..) {
            if reply.send(Err(ConnectorError::Cancelled)).is_err() {
                debug!("Flush caller stopped waiting");
            }
        }
    }
}

fn finish(waiter: CommitWaiter) {
    let result = if waiter.failed.is_empty() {
        Ok(waiter.acknowledged)
    } else {
        Err(ConnectorError::CommitFailed {
            partitions: waiter.failed,
        })
    };
    if waiter.reply.send(result).is_err() {
        debug!("Commit caller stopped waiting");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::coordinator::request::{PendingRequest, Request};

    type Script = Arc<Mutex<Vec<ConnectorResult<()>>>>;

    /// Answers commits from a script (default success) and records what it saw
    fn fake_coordinator(
        script: Vec<ConnectorResult<()>>,
    ) -> (CoordinatorHandle, Arc<Mutex<Vec<BTreeMap<TopicPartition, i64>>>>) {
        let (handle, mut inbox) = CoordinatorHandle::channel(Duration::from_secs(1));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let script: Script = Arc::new(Mutex::new(script.into_iter().rev().collect()));
        let recorded = seen.clone();
        tokio::spawn(async move {
            while let Some(PendingRequest { request, .. }) = inbox.recv().await {
                if let Request::Commit { offsets, reply } = request {
                    recorded.lock().unwrap().push(offsets.clone());
                    let outcome = script.lock().unwrap().pop().unwrap_or(Ok(()));
                    let _unused = reply.send(outcome.map(|()| offsets));
                }
            }
        });
        (handle, seen)
    }

    fn settings(max_batch: usize, max_interval: Duration) -> CommitterSettings {
        CommitterSettings {
            max_batch,
            max_interval,
            max_attempts: 2,
            commit_timeout: Duration::from_secs(1),
        }
    }

    fn tp(partition: i32) -> TopicPartition {
        TopicPartition::new("events", partition)
    }

    #[tokio::test]
    async fn test_offsets_are_aggregated_per_partition() {
        let (handle, seen) = fake_coordinator(vec![]);
        let (committer, task) =
            Committer::spawn(handle, settings(100, Duration::from_secs(60)), "group");

        for offset in 0..10 {
            committer.submit(committer.committable_offset(tp(0), offset));
        }
        committer.submit(committer.committable_offset(tp(1), 3));
        committer.flush().await.unwrap();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen, vec![BTreeMap::from([(tp(0), 9), (tp(1), 3)])]);

        committer.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_resolves_after_interval() {
        let (handle, seen) = fake_coordinator(vec![]);
        let (committer, _task) =
            Committer::spawn(handle, settings(100, Duration::from_millis(20)), "group");

        let ack = committer
            .committable_offset(tp(2), 41)
            .commit()
            .await
            .unwrap();
        assert_eq!(ack, CommitAck::from([(tp(2), 41)]));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_committing_same_offset_twice_is_a_noop() {
        let (handle, seen) = fake_coordinator(vec![]);
        let (committer, _task) =
            Committer::spawn(handle, settings(1, Duration::from_secs(60)), "group");

        let offset = committer.committable_offset(tp(0), 5);
        offset.clone().commit().await.unwrap();
        let ack = offset.commit().await.unwrap();

        assert_eq!(ack, CommitAck::from([(tp(0), 5)]));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_partial_failure_names_failed_partitions() {
        let failure = ConnectorError::commit_failed([tp(1)]);
        // both attempts for partition 1 fail
        let (handle, _seen) = fake_coordinator(vec![Err(failure.clone()), Err(failure)]);
        let (committer, _task) =
            Committer::spawn(handle, settings(2, Duration::from_millis(10)), "group");

        let batch: CommittableOffsetBatch = [
            committer.committable_offset(tp(0), 10),
            committer.committable_offset(tp(1), 20),
        ]
        .into_iter()
        .collect();

        let result = batch.commit().await;
        assert_eq!(result, Err(ConnectorError::commit_failed([tp(1)])));
    }

    #[tokio::test]
    async fn test_later_offset_covers_failed_commit() {
        let failure = ConnectorError::commit_failed([tp(0)]);
        let (handle, seen) = fake_coordinator(vec![Err(failure.clone()), Err(failure)]);
        let (committer, _task) =
            Committer::spawn(handle, settings(1, Duration::from_millis(10)), "group");

        let first = committer.committable_offset(tp(0), 50).commit().await;
        assert_eq!(first, Err(ConnectorError::commit_failed([tp(0)])));

        let second = committer.committable_offset(tp(0), 60).commit().await;
        assert_eq!(second, Ok(CommitAck::from([(tp(0), 60)])));

        let last = seen.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last, BTreeMap::from([(tp(0), 60)]));
    }

    #[tokio::test]
    async fn test_revoke_hands_over_pending_offsets() {
        let (handle, seen) = fake_coordinator(vec![]);
        let (committer, _task) =
            Committer::spawn(handle, settings(100, Duration::from_secs(60)), "group");

        let waiting = {
            let offset = committer.committable_offset(tp(3), 7);
            tokio::spawn(async move { offset.commit().await })
        };
        // let the commit reach the aggregator
        committer.flush().await.ok();
        committer.submit(committer.committable_offset(tp(3), 8));

        let revoked = committer.revoke(BTreeSet::from([tp(3)])).await;
        assert_eq!(revoked.positions(), BTreeMap::from([(tp(3), 9)]));
        revoked.complete(&Ok(()));

        let ack = waiting.await.unwrap().unwrap();
        assert_eq!(ack.get(&tp(3)), Some(&7));
        assert!(seen.lock().unwrap().iter().all(|c| c.get(&tp(3)) != Some(&8)));
    }

    #[tokio::test]
    async fn test_offsets_from_before_a_revocation_are_refused() {
        let (handle, seen) = fake_coordinator(vec![]);
        let (committer, _task) =
            Committer::spawn(handle, settings(100, Duration::from_millis(20)), "group");

        let held = committer.committable_offset(tp(3), 3);
        committer.submit(committer.committable_offset(tp(3), 8));
        let revoked = committer.revoke(BTreeSet::from([tp(3)])).await;
        assert_eq!(revoked.positions(), BTreeMap::from([(tp(3), 9)]));
        revoked.complete(&Ok(()));

        assert_eq!(
            held.commit().await,
            Err(ConnectorError::commit_failed([tp(3)]))
        );

        // issued after the revocation, already covered by what it committed
        let covered = committer.committable_offset(tp(3), 5).commit().await;
        assert_eq!(covered, Ok(CommitAck::from([(tp(3), 5)])));

        let next = committer.committable_offset(tp(3), 12).commit().await;
        assert_eq!(next, Ok(CommitAck::from([(tp(3), 12)])));

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen, vec![BTreeMap::from([(tp(3), 12)])]);
    }

    #[tokio::test]
    async fn test_offset_handed_to_failed_revocation_is_not_retried() {
        let (handle, seen) = fake_coordinator(vec![]);
        let (committer, _task) =
            Committer::spawn(handle, settings(100, Duration::from_millis(20)), "group");

        committer.submit(committer.committable_offset(tp(1), 8));
        let revoked = committer.revoke(BTreeSet::from([tp(1)])).await;
        revoked.complete(&Err(ClientError::CommitFailed {
            partitions: BTreeSet::from([tp(1)]),
            reason: "rebalance in progress".to_string(),
        }));

        let result = committer.committable_offset(tp(1), 6).commit().await;
        assert_eq!(result, Err(ConnectorError::commit_failed([tp(1)])));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_waiters() {
        let (handle, _seen) = fake_coordinator(vec![]);
        let (committer, task) =
            Committer::spawn(handle, settings(100, Duration::from_secs(60)), "group");

        let waiting = {
            let offset = committer.committable_offset(tp(0), 1);
            tokio::spawn(async move { offset.commit().await })
        };
        tokio::task::yield_now().await;
        committer.shutdown();
        task.await.unwrap();

        assert_eq!(waiting.await.unwrap(), Err(ConnectorError::Cancelled));
        assert_eq!(committer.flush().await, Err(ConnectorError::Cancelled));
    }

    #[tokio::test]
    async fn test_detached_committer_cancels() {
        let committer = Committer::detached("group");
        let result = committer.committable_offset(tp(0), 1).commit().await;
        assert_eq!(result, Err(ConnectorError::Cancelled));
    }
}
