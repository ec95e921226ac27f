use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use tokio::runtime::Handle;
use tracing::{error, info, warn};

use crate::commit::RevokedCommits;
use crate::coordinator::demand_buffer::DemandBuffer;
use crate::coordinator::partition_table::{PartitionSlot, PartitionTable};
use crate::error::{ClientError, ConnectorError};
use crate::kafka::client::{RebalanceListener, RevokeCommit};
use crate::kafka::types::{PartitionState, TopicPartition};
use crate::metrics_const::{
    ASSIGNED_PARTITIONS_GAUGE, OFFSETS_ON_ASSIGN_FAILED_COUNTER, REBALANCE_EVENTS_COUNTER,
    REVOKE_DURATION_HISTOGRAM,
};

/// Looks up where newly assigned partitions should start, for offsets kept
/// outside of Kafka. Returned positions win over everything else.
#[async_trait]
pub trait OffsetsOnAssign: Send + Sync {
    async fn offsets_for(
        &self,
        assigned: &BTreeSet<TopicPartition>,
    ) -> Result<BTreeMap<TopicPartition, i64>>;
}

/// What the partition streams hand back when their partitions are revoked
#[derive(Debug, Default)]
pub struct RevokeOutcome {
    /// Next undelivered offset per partition
    pub resume_positions: BTreeMap<TopicPartition, i64>,
    /// Offsets accepted for commit but not committed yet
    pub pending_commits: Option<RevokedCommits>,
}

/// Consumer of assignment changes, called on the coordinator thread while the
/// client is inside a rebalance callback. Implementations may block.
pub trait AssignmentObserver: Send + Sync {
    fn partitions_assigned(&self, assigned: Vec<(TopicPartition, Arc<DemandBuffer>)>);

    /// Stop delivering records for the partitions before returning
    fn partitions_revoked(&self, revoked: &BTreeSet<TopicPartition>) -> RevokeOutcome;

    fn consumer_failed(&self, error: &ConnectorError);
}

/// Observer for a coordinator used only for metadata and commits
pub struct NoopObserver;

impl AssignmentObserver for NoopObserver {
    fn partitions_assigned(&self, _assigned: Vec<(TopicPartition, Arc<DemandBuffer>)>) {}

    fn partitions_revoked(&self, _revoked: &BTreeSet<TopicPartition>) -> RevokeOutcome {
        RevokeOutcome::default()
    }

    fn consumer_failed(&self, _error: &ConnectorError) {}
}

/// Moves partitions through Assigning/Active/Revoking as the client reports
/// rebalances, and keeps resume positions for partitions that come back within
/// the same rebalance cycle.
pub struct RebalanceBridge {
    partitions: Arc<PartitionTable>,
    observer: Arc<dyn AssignmentObserver>,
    resolver: Option<Arc<dyn OffsetsOnAssign>>,
    resume_positions: Mutex<BTreeMap<TopicPartition, i64>>,
    /// Highest position this member committed per partition, kept across assignments
    committed: Mutex<BTreeMap<TopicPartition, i64>>,
    buffer_capacity: usize,
    resolver_timeout: Duration,
    runtime: Handle,
}

impl RebalanceBridge {
    pub fn new(
        partitions: Arc<PartitionTable>,
        observer: Arc<dyn AssignmentObserver>,
        resolver: Option<Arc<dyn OffsetsOnAssign>>,
        buffer_capacity: usize,
        resolver_timeout: Duration,
        runtime: Handle,
    ) -> Self {
        Self {
            partitions,
            observer,
            resolver,
            resume_positions: Mutex::new(BTreeMap::new()),
            committed: Mutex::new(BTreeMap::new()),
            buffer_capacity,
            resolver_timeout,
            runtime,
        }
    }

    pub fn observer(&self) -> &Arc<dyn AssignmentObserver> {
        &self.observer
    }

    fn take_resume_positions(&self) -> BTreeMap<TopicPartition, i64> {
        let mut guard = match self.resume_positions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::take(&mut *guard)
    }

    fn keep_resume_positions(&self, positions: BTreeMap<TopicPartition, i64>) {
        let mut guard = match self.resume_positions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.extend(positions);
    }

    /// Split `positions` into those that move a partition forward and those at or
    /// below what this member already committed
    pub fn split_committed(
        &self,
        positions: BTreeMap<TopicPartition, i64>,
    ) -> (BTreeMap<TopicPartition, i64>, BTreeMap<TopicPartition, i64>) {
        let guard = match self.committed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        positions
            .into_iter()
            .partition(|(tp, position)| guard.get(tp).map_or(true, |done| position > done))
    }

    pub fn record_committed<'a>(
        &self,
        positions: impl IntoIterator<Item = (&'a TopicPartition, &'a i64)>,
    ) {
        let mut guard = match self.committed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for (tp, position) in positions {
            let done = guard.entry(tp.clone()).or_insert(*position);
            *done = (*done).max(*position);
        }
    }

    /// Take ownership of `partitions`. `explicit` positions come from a manual
    /// assignment. Returns the positions the client must seek to.
    pub fn assign(
        &self,
        partitions: &BTreeSet<TopicPartition>,
        explicit: &BTreeMap<TopicPartition, i64>,
    ) -> BTreeMap<TopicPartition, i64> {
        // a resume position only survives until the next assignment
        let resumed = self.take_resume_positions();

        let fresh: BTreeSet<TopicPartition> = partitions
            .iter()
            .filter(|tp| !self.partitions.contains(tp))
            .cloned()
            .collect();
        if fresh.is_empty() {
            return BTreeMap::new();
        }

        let mut buffers = Vec::with_capacity(fresh.len());
        for tp in &fresh {
            let buffer = Arc::new(DemandBuffer::new(tp.clone(), self.buffer_capacity));
            self.partitions.insert(
                tp.clone(),
                PartitionSlot {
                    state: PartitionState::Assigning,
                    buffer: buffer.clone(),
                },
            );
            buffers.push((tp.clone(), buffer));
        }

        let mut positions: BTreeMap<TopicPartition, i64> = resumed
            .into_iter()
            .filter(|(tp, _)| fresh.contains(tp))
            .collect();
        positions.extend(
            explicit
                .iter()
                .filter(|(tp, _)| fresh.contains(*tp))
                .map(|(tp, offset)| (tp.clone(), *offset)),
        );
        if let Some(resolved) = self.resolve_positions(&fresh) {
            positions.extend(resolved.into_iter().filter(|(tp, _)| fresh.contains(tp)));
        }

        for (tp, buffer) in &buffers {
            if let Some(position) = positions.get(tp) {
                buffer.reset(*position);
            }
        }
        self.partitions.set_state(&fresh, PartitionState::Active);

        info!(
            "Assigned {} partitions ({} with explicit positions)",
            fresh.len(),
            positions.len()
        );
        metrics::counter!(REBALANCE_EVENTS_COUNTER, "event_type" => "assign").increment(1);
        metrics::gauge!(ASSIGNED_PARTITIONS_GAUGE).set(self.partitions.len() as f64);

        self.observer.partitions_assigned(buffers);
        positions
    }

    fn resolve_positions(
        &self,
        partitions: &BTreeSet<TopicPartition>,
    ) -> Option<BTreeMap<TopicPartition, i64>> {
        let resolver = self.resolver.as_ref()?;
        let lookup = tokio::time::timeout(self.resolver_timeout, resolver.offsets_for(partitions));

        match self.runtime.block_on(lookup) {
            Ok(Ok(positions)) => Some(positions),
            Ok(Err(e)) => {
                error!("Offsets lookup for assigned partitions failed: {:#}", e);
                metrics::counter!(OFFSETS_ON_ASSIGN_FAILED_COUNTER, "reason" => "error")
                    .increment(1);
                None
            }
            Err(_) => {
                error!(
                    "Offsets lookup for assigned partitions timed out after {:?}",
                    self.resolver_timeout
                );
                metrics::counter!(OFFSETS_ON_ASSIGN_FAILED_COUNTER, "reason" => "timeout")
                    .increment(1);
                None
            }
        }
    }

    /// Release `partitions`: stop their streams, commit what was pending through
    /// `commit`, then forget them.
    pub fn revoke(&self, partitions: &BTreeSet<TopicPartition>, commit: &mut RevokeCommit<'_>) {
        let owned: BTreeSet<TopicPartition> = partitions
            .iter()
            .filter(|tp| self.partitions.contains(tp))
            .cloned()
            .collect();
        if owned.is_empty() {
            return;
        }
        let started = Instant::now();
        self.partitions.set_state(&owned, PartitionState::Revoking);

        let outcome = self.observer.partitions_revoked(&owned);

        if let Some(pending) = outcome.pending_commits {
            let (positions, _covered) = self.split_committed(pending.positions());
            let result = if positions.is_empty() {
                Ok(())
            } else {
                commit(&positions)
            };
            match &result {
                Ok(()) => self.record_committed(&positions),
                Err(ClientError::CommitFailed { partitions, .. }) => self.record_committed(
                    positions.iter().filter(|(tp, _)| !partitions.contains(*tp)),
                ),
                Err(_) => {}
            }
            match &result {
                Ok(()) if !positions.is_empty() => {
                    info!("Committed {} partitions before revocation", positions.len())
                }
                Ok(()) => {}
                Err(e) => warn!("Commit before revocation failed: {}", e),
            }
            pending.complete(&result);
        }

        for tp in &owned {
            if let Some(slot) = self.partitions.remove(tp) {
                slot.buffer.close();
            }
        }
        self.keep_resume_positions(outcome.resume_positions);

        info!("Revoked {} partitions", owned.len());
        metrics::counter!(REBALANCE_EVENTS_COUNTER, "event_type" => "revoke").increment(1);
        metrics::histogram!(REVOKE_DURATION_HISTOGRAM).record(started.elapsed().as_secs_f64());
        metrics::gauge!(ASSIGNED_PARTITIONS_GAUGE).set(self.partitions.len() as f64);
    }
}

impl RebalanceListener for RebalanceBridge {
    fn on_partitions_revoked(
        &self,
        partitions: &BTreeSet<TopicPartition>,
        commit: &mut RevokeCommit<'_>,
    ) {
        self.revoke(partitions, commit)
    }

    fn on_partitions_assigned(
        &self,
        partitions: &BTreeSet<TopicPartition>,
    ) -> BTreeMap<TopicPartition, i64> {
        self.assign(partitions, &BTreeMap::new())
    }
}
