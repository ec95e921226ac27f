//! Partitioned Stream Engine - one stream per assigned partition
//!
//! The engine owns a registry of partition workers keyed by partition. The
//! coordinator calls into it from inside rebalance callbacks: new partitions get
//! a worker and a [`PartitionSource`] handed to the application, revoked ones
//! have their worker stopped and their pending offsets committed before the
//! client is allowed to move on.

pub mod partition_source;
pub mod partition_worker;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use dashmap::DashMap;
use futures::Stream;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use partition_source::{CommittableRecord, PartitionSource};
pub use partition_worker::{PartitionWorker, PartitionWorkerConfig, WorkerExit};

use crate::commit::Committer;
use crate::config::{CommitterSettings, ConsumerSettings};
use crate::coordinator::{
    AssignmentObserver, ConsumerCoordinator, CoordinatorHandle, DemandBuffer, OffsetsOnAssign,
    RevokeOutcome,
};
use crate::engine::partition_worker::{read_failure, FailureSlot};
use crate::error::{ConnectorError, ConnectorResult};
use crate::kafka::client::ConsumerClient;
use crate::kafka::types::{RebalanceEvent, Subscription, TopicPartition};
use crate::metrics_const::ACTIVE_PARTITION_WORKERS_GAUGE;

const REBALANCE_EVENTS_CAPACITY: usize = 64;

/// Consumes a subscription as one stream per partition
pub struct PartitionedStreamEngine {
    coordinator: CoordinatorHandle,
    committer: Committer,
    sources: mpsc::UnboundedReceiver<PartitionSource>,
    core: Arc<EngineCore>,
    settings: ConsumerSettings,
    shutdown: CancellationToken,
    coordinator_task: Option<JoinHandle<()>>,
    committer_task: Option<JoinHandle<()>>,
}

impl PartitionedStreamEngine {
    /// Start the coordinator and the commit aggregator, and subscribe.
    /// Must be called from within a multi-threaded tokio runtime.
    pub async fn start<C: ConsumerClient>(
        client: C,
        subscription: Subscription,
        settings: ConsumerSettings,
        committer_settings: CommitterSettings,
        resolver: Option<Arc<dyn OffsetsOnAssign>>,
    ) -> ConnectorResult<Self> {
        let (coordinator, inbox) = CoordinatorHandle::channel(settings.request_timeout);
        let (committer, committer_task) =
            Committer::spawn(coordinator.clone(), committer_settings, &settings.group_id);
        let (sources_tx, sources) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(REBALANCE_EVENTS_CAPACITY);
        let shutdown = CancellationToken::new();

        let core = Arc::new(EngineCore {
            workers: DashMap::new(),
            sources: Mutex::new(Some(sources_tx)),
            events,
            coordinator: coordinator.clone(),
            committer: committer.clone(),
            failure: Arc::new(Mutex::new(None)),
            worker_config: PartitionWorkerConfig {
                max_batch: settings.max_batch,
                channel_buffer_size: settings.sub_stream_buffer,
                request_timeout: settings.request_timeout,
            },
            settings: settings.clone(),
            runtime: Handle::current(),
        });

        let coordinator_task = ConsumerCoordinator::new(
            client,
            inbox,
            settings.clone(),
            core.clone(),
            resolver,
            shutdown.clone(),
        )
        .spawn();

        let engine = Self {
            coordinator,
            committer,
            sources,
            core,
            settings,
            shutdown,
            coordinator_task: Some(coordinator_task),
            committer_task: Some(committer_task),
        };

        engine
            .coordinator
            .assign(subscription, engine.settings.request_timeout)
            .await?;
        Ok(engine)
    }

    /// The next partition assigned to this member. `None` once the engine
    /// stopped or the consumer failed.
    pub async fn next_partition(&mut self) -> Option<PartitionSource> {
        self.sources.recv().await
    }

    /// Every partition assigned from now on, as a stream of streams
    pub fn partitions(&mut self) -> impl Stream<Item = PartitionSource> + '_ {
        futures::stream::poll_fn(move |cx| self.sources.poll_recv(cx))
    }

    pub fn rebalance_events(&self) -> broadcast::Receiver<RebalanceEvent> {
        self.core.events.subscribe()
    }

    pub fn committer(&self) -> &Committer {
        &self.committer
    }

    pub fn coordinator(&self) -> &CoordinatorHandle {
        &self.coordinator
    }

    /// Partitions with a running worker
    pub fn active_partitions(&self) -> BTreeSet<TopicPartition> {
        self.core
            .workers
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// The error that stopped the consumer, if any
    pub fn failure(&self) -> Option<ConnectorError> {
        read_failure(&self.core.failure)
    }

    /// Commit what is pending, stop every partition stream and leave the group
    pub async fn shutdown(mut self) -> ConnectorResult<()> {
        info!("Shutting down partitioned stream engine");

        if let Err(e) = self.committer.flush().await {
            warn!("Failed to flush offsets before shutdown: {}", e);
        }

        // revokes every partition, committing what the streams left behind
        let result = self.coordinator.shutdown(self.settings.stop_timeout).await;
        self.committer.shutdown();
        self.core.close_sources();

        if let Some(task) = self.committer_task.take() {
            if let Err(e) = task.await {
                error!("Commit aggregator task failed: {}", e);
            }
        }
        if let Some(task) = self.coordinator_task.take() {
            if result.is_ok() {
                if let Err(e) = task.await {
                    error!("Consumer coordinator task failed: {}", e);
                }
            }
        }

        match &result {
            Ok(()) => info!("Partitioned stream engine stopped"),
            Err(e) => error!("Partitioned stream engine stopped uncleanly: {}", e),
        }
        result
    }
}

impl Drop for PartitionedStreamEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Reacts to assignment changes on the coordinator thread
struct EngineCore {
    workers: DashMap<TopicPartition, PartitionWorker>,
    sources: Mutex<Option<mpsc::UnboundedSender<PartitionSource>>>,
    events: broadcast::Sender<RebalanceEvent>,
    coordinator: CoordinatorHandle,
    committer: Committer,
    failure: FailureSlot,
    worker_config: PartitionWorkerConfig,
    settings: ConsumerSettings,
    runtime: Handle,
}

impl EngineCore {
    fn offer(&self, source: PartitionSource) {
        let guard = match self.sources.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match guard.as_ref() {
            Some(tx) => {
                if let Err(rejected) = tx.send(source) {
                    debug!(
                        "Nobody takes partition streams any more, dropping {}",
                        rejected.0.partition()
                    );
                }
            }
            None => debug!("Engine stopped, dropping stream for {}", source.partition()),
        }
    }

    fn close_sources(&self) {
        let mut guard = match self.sources.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.take();
    }

    fn publish(&self, event: RebalanceEvent) {
        // no subscribers is fine
        let _unused = self.events.send(event);
    }

    fn update_gauge(&self) {
        metrics::gauge!(ACTIVE_PARTITION_WORKERS_GAUGE).set(self.workers.len() as f64);
    }
}

impl AssignmentObserver for EngineCore {
    fn partitions_assigned(&self, assigned: Vec<(TopicPartition, Arc<DemandBuffer>)>) {
        let partitions: BTreeSet<TopicPartition> =
            assigned.iter().map(|(tp, _)| tp.clone()).collect();

        for (tp, buffer) in assigned {
            let (worker, source) = PartitionWorker::spawn(
                &self.runtime,
                buffer,
                self.coordinator.clone(),
                self.committer.clone(),
                self.failure.clone(),
                &self.worker_config,
            );
            if let Some(previous) = self.workers.insert(tp.clone(), worker) {
                // cannot happen while the coordinator revokes before it reassigns
                warn!(
                    "Replacing running worker for {}:{}",
                    tp.topic(),
                    tp.partition()
                );
                previous.cancel();
            }
            self.offer(source);
        }

        self.update_gauge();
        self.publish(RebalanceEvent::Assigned(partitions));
    }

    fn partitions_revoked(&self, revoked: &BTreeSet<TopicPartition>) -> RevokeOutcome {
        let started = Instant::now();
        let drain_timeout = self.settings.revoke_drain_timeout;

        let workers: Vec<PartitionWorker> = revoked
            .iter()
            .filter_map(|tp| self.workers.remove(tp).map(|(_, worker)| worker))
            .collect();
        // stop all of them at once, waiting happens below
        for worker in &workers {
            worker.cancel();
        }
        self.update_gauge();

        let committer = self.committer.clone();
        let (resume_positions, pending) = self.runtime.block_on(async move {
            let deadline = tokio::time::Instant::now() + drain_timeout;
            let mut resume_positions = BTreeMap::new();
            let mut outstanding = Vec::with_capacity(workers.len());

            for worker in workers {
                let tp = worker.partition().clone();
                outstanding.push((tp.clone(), worker.outstanding().clone()));
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if let Some(next) = worker.stop(remaining).await.next_offset {
                    resume_positions.insert(tp, next);
                }
            }

            // let the application commit what it already received
            for (tp, offsets) in outstanding {
                if tokio::time::timeout_at(deadline, offsets.settled()).await.is_err() {
                    warn!(
                        topic = tp.topic(),
                        partition = tp.partition(),
                        outstanding = offsets.count(),
                        "Revoking partition with uncommitted records in flight"
                    );
                }
            }

            let pending = committer.revoke(revoked.clone()).await;
            (resume_positions, pending)
        });

        info!(
            "Stopped {} partition streams in {:?}",
            revoked.len(),
            started.elapsed()
        );
        self.publish(RebalanceEvent::Revoked(revoked.clone()));

        RevokeOutcome {
            resume_positions,
            pending_commits: Some(pending),
        }
    }

    fn consumer_failed(&self, error: &ConnectorError) {
        {
            let mut slot = match self.failure.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if slot.is_none() {
                *slot = Some(error.clone());
            }
        }
        error!("Consumer failed, failing every partition stream: {}", error);

        // workers see their buffer closed, deliver the error and finish on their own
        self.close_sources();
    }
}
