use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ConsumerSettings;
use crate::coordinator::partition_table::PartitionTable;
use crate::coordinator::rebalance::{AssignmentObserver, OffsetsOnAssign, RebalanceBridge};
use crate::coordinator::request::{
    validate_topic, MetadataQuery, MetadataResponse, PendingRequest, Reply, Request,
};
use crate::error::{ClientError, ConnectorError, ConnectorResult};
use crate::kafka::client::ConsumerClient;
use crate::kafka::types::{ConsumerRecord, PartitionState, Subscription, TopicPartition};
use crate::metrics_const::{
    COORDINATOR_POLLS_COUNTER, COORDINATOR_REQUESTS_COUNTER,
    COORDINATOR_REQUEST_DURATION_HISTOGRAM, KAFKA_CLIENT_ERRORS_COUNTER,
    PAUSED_PARTITIONS_GAUGE, POLL_RECORDS_HISTOGRAM, RECORDS_DROPPED_COUNTER,
};

enum Flow {
    Continue,
    Stop,
}

enum Wake {
    Request(PendingRequest),
    Elapsed,
    Closed,
    Cancelled,
}

/// Single owner of the consumer client.
///
/// Runs on a blocking thread. Each turn of the loop serves every queued request
/// first, then applies pause/resume for the current demand, then polls. When no
/// partition wants records it sleeps up to `poll_interval` waiting for a request
/// and then polls with everything paused, which keeps group membership alive and
/// lets rebalance callbacks fire.
pub struct ConsumerCoordinator<C: ConsumerClient> {
    client: C,
    inbox: mpsc::UnboundedReceiver<PendingRequest>,
    partitions: Arc<PartitionTable>,
    bridge: Arc<RebalanceBridge>,
    subscription: Option<Subscription>,
    settings: ConsumerSettings,
    runtime: Handle,
    shutdown: CancellationToken,
    failure: Option<ConnectorError>,
}

impl<C: ConsumerClient> ConsumerCoordinator<C> {
    /// Must be called from within a tokio runtime
    pub fn new(
        client: C,
        inbox: mpsc::UnboundedReceiver<PendingRequest>,
        settings: ConsumerSettings,
        observer: Arc<dyn AssignmentObserver>,
        resolver: Option<Arc<dyn OffsetsOnAssign>>,
        shutdown: CancellationToken,
    ) -> Self {
        let runtime = Handle::current();
        let partitions = Arc::new(PartitionTable::new());
        let bridge = Arc::new(RebalanceBridge::new(
            partitions.clone(),
            observer,
            resolver,
            settings.buffer_capacity,
            settings.offsets_on_assign_timeout,
            runtime.clone(),
        ));

        Self {
            client,
            inbox,
            partitions,
            bridge,
            subscription: None,
            settings,
            runtime,
            shutdown,
            failure: None,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::task::spawn_blocking(move || self.run())
    }

    fn run(mut self) {
        info!(group_id = %self.settings.group_id, "Consumer coordinator started");

        loop {
            if self.shutdown.is_cancelled() {
                if let Err(e) = self.stop(self.settings.stop_timeout) {
                    warn!("Consumer stopped uncleanly: {}", e);
                }
                break;
            }

            if let Flow::Stop = self.serve_queued_requests() {
                break;
            }

            // nothing to poll for: sleep until somebody asks for something
            if self.failure.is_some() || self.subscription.is_none() {
                match self.wait_for_request(None) {
                    Wake::Request(request) => {
                        if let Flow::Stop = self.handle(request) {
                            break;
                        }
                    }
                    Wake::Elapsed => {}
                    Wake::Closed | Wake::Cancelled => {
                        if let Err(e) = self.stop(self.settings.stop_timeout) {
                            warn!("Consumer stopped uncleanly: {}", e);
                        }
                        break;
                    }
                }
                continue;
            }

            if self.sync_pause_state() {
                self.poll_tick(self.settings.poll_timeout, "fetch");
                continue;
            }

            match self.wait_for_request(Some(self.settings.poll_interval)) {
                Wake::Request(request) => {
                    if let Flow::Stop = self.handle(request) {
                        break;
                    }
                }
                Wake::Elapsed => self.poll_tick(Duration::ZERO, "housekeeping"),
                Wake::Closed | Wake::Cancelled => {
                    if let Err(e) = self.stop(self.settings.stop_timeout) {
                        warn!("Consumer stopped uncleanly: {}", e);
                    }
                    break;
                }
            }
        }

        info!(group_id = %self.settings.group_id, "Consumer coordinator stopped");
    }

    /// Explicit requests always go before the next poll
    fn serve_queued_requests(&mut self) -> Flow {
        loop {
            match self.inbox.try_recv() {
                Ok(request) => {
                    if let Flow::Stop = self.handle(request) {
                        return Flow::Stop;
                    }
                }
                Err(TryRecvError::Empty) => return Flow::Continue,
                Err(TryRecvError::Disconnected) => {
                    debug!("All coordinator handles dropped");
                    if let Err(e) = self.stop(self.settings.stop_timeout) {
                        warn!("Consumer stopped uncleanly: {}", e);
                    }
                    return Flow::Stop;
                }
            }
        }
    }

    fn wait_for_request(&mut self, timeout: Option<Duration>) -> Wake {
        let inbox = &mut self.inbox;
        let shutdown = self.shutdown.clone();
        let idle = timeout.unwrap_or(Duration::from_secs(3600));

        self.runtime.block_on(async {
            tokio::select! {
                request = inbox.recv() => match request {
                    Some(request) => Wake::Request(request),
                    None => Wake::Closed,
                },
                _ = shutdown.cancelled() => Wake::Cancelled,
                _ = tokio::time::sleep(idle), if timeout.is_some() => Wake::Elapsed,
            }
        })
    }

    fn handle(&mut self, pending: PendingRequest) -> Flow {
        let kind = pending.kind();
        let received_at = pending.received_at;

        if let Some(failure) = &self.failure {
            if !matches!(pending.request, Request::Shutdown { .. }) {
                pending.fail(failure.clone());
                metrics::counter!(
                    COORDINATOR_REQUESTS_COUNTER,
                    "kind" => kind,
                    "outcome" => "failed"
                )
                .increment(1);
                return Flow::Continue;
            }
        }

        let mut flow = Flow::Continue;
        let ok = match pending.request {
            Request::Assign {
                subscription,
                reply,
            } => {
                let result = self.assign(subscription);
                respond(reply, result)
            }
            Request::RequestRecords {
                partitions,
                max_batch,
                reply,
            } => {
                self.request_records(&partitions, max_batch);
                respond(reply, Ok(()))
            }
            Request::Seek {
                partition,
                offset,
                reply,
            } => {
                let result = self.seek(&partition, offset);
                respond(reply, result)
            }
            Request::Commit { offsets, reply } => {
                let result = self.commit(offsets);
                respond(reply, result)
            }
            Request::Metadata { query, reply } => {
                let result = self.metadata(query);
                respond(reply, result)
            }
            Request::Shutdown {
                stop_timeout,
                reply,
            } => {
                flow = Flow::Stop;
                let result = self.stop(stop_timeout);
                respond(reply, result)
            }
        };

        let outcome = if ok { "ok" } else { "error" };
        metrics::counter!(COORDINATOR_REQUESTS_COUNTER, "kind" => kind, "outcome" => outcome)
            .increment(1);
        metrics::histogram!(COORDINATOR_REQUEST_DURATION_HISTOGRAM, "kind" => kind)
            .record(received_at.elapsed().as_secs_f64());
        flow
    }

    fn assign(&mut self, update: Subscription) -> ConnectorResult<()> {
        let merged = match &self.subscription {
            None => update.clone(),
            Some(current) => {
                current
                    .merge(&update)
                    .ok_or(ConnectorError::SubscriptionConflict {
                        current: current.kind(),
                        requested: update.kind(),
                    })?
            }
        };

        match &merged {
            Subscription::Topics(topics) => {
                for topic in topics {
                    validate_topic(topic)?;
                }
                self.client
                    .subscribe(&merged, self.bridge.clone())
                    .map_err(|e| self.client_failed(e))?;
            }
            Subscription::Pattern(_) => {
                self.client
                    .subscribe(&merged, self.bridge.clone())
                    .map_err(|e| self.client_failed(e))?;
            }
            Subscription::Assignment(_) | Subscription::AssignmentWithOffsets(_) => {
                self.assign_manually(&merged, &update.manual_offsets())?;
            }
        }

        info!(subscription = ?merged, "Subscription updated");
        self.subscription = Some(merged);
        Ok(())
    }

    /// Runs the same path a group assignment takes, without a rebalance
    fn assign_manually(
        &mut self,
        merged: &Subscription,
        explicit: &BTreeMap<TopicPartition, i64>,
    ) -> ConnectorResult<()> {
        let wanted = merged.manual_partitions();
        for tp in &wanted {
            validate_topic(tp.topic())?;
        }
        let fresh: BTreeSet<TopicPartition> = wanted
            .iter()
            .filter(|tp| !self.partitions.contains(tp))
            .cloned()
            .collect();

        let positions = self.bridge.assign(&fresh, explicit);

        // partitions that were already running keep their fetch position
        let assignment: BTreeMap<TopicPartition, Option<i64>> = wanted
            .iter()
            .map(|tp| {
                let position = positions.get(tp).copied().or_else(|| {
                    self.partitions
                        .buffer(tp)
                        .filter(|_| !fresh.contains(tp))
                        .and_then(|buffer| buffer.next_offset())
                });
                (tp.clone(), position)
            })
            .collect();

        if let Err(e) = self.client.assign(&assignment) {
            // undo, nothing was delivered yet
            self.bridge
                .revoke(&fresh, &mut |_: &BTreeMap<TopicPartition, i64>| Ok(()));
            return Err(self.client_failed(e));
        }

        // the client pauses the whole assignment again
        for (_, slot) in self.partitions.snapshot() {
            slot.buffer.set_paused(true);
        }
        Ok(())
    }

    fn request_records(&mut self, partitions: &BTreeSet<TopicPartition>, max_batch: usize) {
        for tp in partitions {
            match self.partitions.state(tp) {
                PartitionState::Active | PartitionState::Assigning => {
                    if let Some(buffer) = self.partitions.buffer(tp) {
                        buffer.request(max_batch);
                    }
                }
                state => {
                    debug!(
                        topic = tp.topic(),
                        partition = tp.partition(),
                        %state,
                        "Ignoring demand for partition not owned"
                    );
                }
            }
        }
    }

    fn seek(&mut self, partition: &TopicPartition, offset: i64) -> ConnectorResult<()> {
        let state = self.partitions.state(partition);
        if !matches!(state, PartitionState::Active | PartitionState::Assigning) {
            return Err(ConnectorError::InvalidPartitionState {
                partition: partition.clone(),
                state,
            });
        }

        self.client
            .seek(partition, offset)
            .map_err(|e| self.client_failed(e))?;
        if let Some(buffer) = self.partitions.buffer(partition) {
            buffer.reset(offset);
        }
        info!(
            topic = partition.topic(),
            partition = partition.partition(),
            offset,
            "Seeked partition"
        );
        Ok(())
    }

    fn commit(
        &mut self,
        offsets: BTreeMap<TopicPartition, i64>,
    ) -> ConnectorResult<BTreeMap<TopicPartition, i64>> {
        let (mut acknowledged, unowned): (BTreeMap<_, _>, BTreeMap<_, _>) = offsets
            .into_iter()
            .partition(|(tp, _)| self.partitions.contains(tp));

        let mut failed: BTreeSet<TopicPartition> = unowned.into_keys().collect();
        if !failed.is_empty() {
            debug!("Not committing {} partitions this member does not own", failed.len());
        }

        // a commit that lands late must not move a partition back
        let (positions, _covered) = self.bridge.split_committed(
            acknowledged
                .iter()
                .map(|(tp, offset)| (tp.clone(), offset + 1))
                .collect(),
        );

        if !positions.is_empty() {
            match self.client.commit(&positions) {
                Ok(()) => self.bridge.record_committed(&positions),
                Err(ClientError::CommitFailed { partitions, reason }) => {
                    warn!("Commit rejected for {} partitions: {}", partitions.len(), reason);
                    self.bridge.record_committed(
                        positions.iter().filter(|(tp, _)| !partitions.contains(*tp)),
                    );
                    for tp in partitions {
                        acknowledged.remove(&tp);
                        failed.insert(tp);
                    }
                }
                Err(ClientError::Fatal(msg)) => {
                    let err = ConnectorError::Fatal(msg);
                    self.fail(err.clone());
                    return Err(err);
                }
                Err(e) => {
                    warn!("Commit failed: {}", e);
                    failed.extend(acknowledged.into_keys());
                    return Err(ConnectorError::CommitFailed { partitions: failed });
                }
            }
        }

        if failed.is_empty() {
            Ok(acknowledged)
        } else {
            Err(ConnectorError::CommitFailed { partitions: failed })
        }
    }

    fn metadata(&mut self, query: MetadataQuery) -> ConnectorResult<MetadataResponse> {
        for topic in query.topics() {
            validate_topic(topic)?;
        }
        let timeout = self.settings.metadata_timeout;

        let response = match query {
            MetadataQuery::BeginningOffsets(partitions) => self
                .client
                .beginning_offsets(&partitions, timeout)
                .map(MetadataResponse::Offsets),
            MetadataQuery::EndOffsets(partitions) => self
                .client
                .end_offsets(&partitions, timeout)
                .map(MetadataResponse::Offsets),
            MetadataQuery::PartitionsFor(topic) => self
                .client
                .partitions_for(&topic, timeout)
                .map(MetadataResponse::Partitions),
            MetadataQuery::CommittedOffsets(partitions) => self
                .client
                .committed_offsets(&partitions, timeout)
                .map(MetadataResponse::CommittedOffsets),
            MetadataQuery::ListTopics => self
                .client
                .list_topics(timeout)
                .map(MetadataResponse::Topics),
            MetadataQuery::OffsetsForTimes(timestamps) => self
                .client
                .offsets_for_times(&timestamps, timeout)
                .map(MetadataResponse::OffsetsForTimes),
        };
        response.map_err(|e| self.client_failed(e))
    }

    /// Pause what cannot take more records, resume what can.
    /// Returns whether any partition wants records.
    fn sync_pause_state(&mut self) -> bool {
        let mut to_pause = BTreeSet::new();
        let mut to_resume = BTreeSet::new();
        let mut demanded = false;

        for (tp, slot) in self.partitions.snapshot() {
            let wants = slot.state == PartitionState::Active && slot.buffer.wants_records();
            demanded |= wants;
            match (wants, slot.buffer.is_paused()) {
                (true, true) => {
                    to_resume.insert(tp);
                }
                (false, false) => {
                    to_pause.insert(tp);
                }
                _ => {}
            }
        }

        if !to_pause.is_empty() {
            match self.client.pause(&to_pause) {
                Ok(()) => self.mark_paused(&to_pause, true),
                Err(e) => warn!("Failed to pause {} partitions: {}", to_pause.len(), e),
            }
        }
        if !to_resume.is_empty() {
            match self.client.resume(&to_resume) {
                Ok(()) => self.mark_paused(&to_resume, false),
                Err(e) => warn!("Failed to resume {} partitions: {}", to_resume.len(), e),
            }
        }

        demanded
    }

    fn mark_paused(&self, partitions: &BTreeSet<TopicPartition>, paused: bool) {
        for tp in partitions {
            if let Some(buffer) = self.partitions.buffer(tp) {
                buffer.set_paused(paused);
            }
        }
        let paused_count = self
            .partitions
            .snapshot()
            .iter()
            .filter(|(_, slot)| slot.buffer.is_paused())
            .count();
        metrics::gauge!(PAUSED_PARTITIONS_GAUGE).set(paused_count as f64);
    }

    fn poll_tick(&mut self, timeout: Duration, mode: &'static str) {
        metrics::counter!(COORDINATOR_POLLS_COUNTER, "mode" => mode).increment(1);

        match self.client.poll(timeout, self.settings.max_poll_records) {
            Ok(records) => {
                if !records.is_empty() {
                    metrics::histogram!(POLL_RECORDS_HISTOGRAM).record(records.len() as f64);
                }
                self.dispatch(records);
            }
            Err(ClientError::Fatal(msg)) => self.fail(ConnectorError::Fatal(msg)),
            Err(e) => {
                warn!("Poll failed: {}", e);
                metrics::counter!(KAFKA_CLIENT_ERRORS_COUNTER, "error" => "poll").increment(1);
            }
        }
    }

    fn dispatch(&self, records: Vec<ConsumerRecord>) {
        let mut by_partition: BTreeMap<TopicPartition, Vec<ConsumerRecord>> = BTreeMap::new();
        for record in records {
            by_partition
                .entry(record.topic_partition().clone())
                .or_default()
                .push(record);
        }

        for (tp, records) in by_partition {
            match self.partitions.active_buffer(&tp) {
                Some(buffer) => {
                    buffer.append(records);
                }
                None => {
                    debug!(
                        topic = tp.topic(),
                        partition = tp.partition(),
                        count = records.len(),
                        "Dropping records for partition that is not active"
                    );
                    metrics::counter!(RECORDS_DROPPED_COUNTER, "reason" => "not_active")
                        .increment(records.len() as u64);
                }
            }
        }
    }

    fn client_failed(&mut self, e: ClientError) -> ConnectorError {
        let err = ConnectorError::from(e);
        if let ConnectorError::Fatal(_) = err {
            self.fail(err.clone());
        }
        err
    }

    /// The client is unusable: fail every stream and every later request
    fn fail(&mut self, err: ConnectorError) {
        if self.failure.is_some() {
            return;
        }
        error!("Consumer failed, no longer serving requests: {}", err);
        self.failure = Some(err.clone());
        self.bridge.observer().consumer_failed(&err);

        for tp in self.partitions.owned() {
            if let Some(slot) = self.partitions.remove(&tp) {
                slot.buffer.close();
            }
        }
    }

    fn stop(&mut self, stop_timeout: Duration) -> ConnectorResult<()> {
        info!("Stopping consumer coordinator");
        let deadline = Instant::now() + stop_timeout;

        while let Ok(queued) = self.inbox.try_recv() {
            queued.fail(ConnectorError::Cancelled);
        }

        // hand the partitions back with whatever the streams left uncommitted
        if self.failure.is_none() {
            let owned = self.partitions.owned();
            let client = &mut self.client;
            let mut commit = |positions: &BTreeMap<TopicPartition, i64>| client.commit(positions);
            self.bridge.revoke(&owned, &mut commit);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let result = match self.client.close(remaining) {
            Ok(()) => Ok(()),
            Err(ClientError::CloseTimedOut(_)) => {
                error!("Consumer did not close within {:?}", stop_timeout);
                Err(ConnectorError::ShutdownTimeout(stop_timeout))
            }
            Err(e) => {
                warn!("Error while closing consumer: {}", e);
                Err(e.into())
            }
        };

        // late requests learn how the shutdown went
        self.inbox.close();
        let late_error = match &result {
            Err(ConnectorError::ShutdownTimeout(timeout)) => {
                ConnectorError::ShutdownTimeout(*timeout)
            }
            _ => ConnectorError::Cancelled,
        };
        while let Ok(late) = self.inbox.try_recv() {
            late.fail(late_error.clone());
        }

        result
    }
}

/// Send the result to a caller that may have given up already. Returns whether it was Ok.
fn respond<T>(reply: Reply<T>, result: ConnectorResult<T>) -> bool {
    let ok = result.is_ok();
    if reply.send(result).is_err() {
        debug!("Caller stopped waiting for the reply");
    }
    ok
}
