//! Partition Worker - moves records of one partition from its demand buffer
//! into the partition's stream
//!
//! The worker only asks the coordinator for more records when its buffer is
//! empty, and only hands records on as fast as the stream is polled, so a slow
//! partition never holds up the others.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::commit::{Committer, OutstandingOffsets};
use crate::coordinator::{CoordinatorHandle, DemandBuffer};
use crate::engine::partition_source::PartitionSource;
use crate::error::{ConnectorError, ConnectorResult};
use crate::kafka::types::{ConsumerRecord, TopicPartition};
use crate::metrics_const::{PARTITION_WORKER_STOPPED_COUNTER, RECORDS_DELIVERED_COUNTER};

/// Set once when the consumer fails for good; read by every worker
pub(crate) type FailureSlot = Arc<Mutex<Option<ConnectorError>>>;

pub(crate) fn read_failure(slot: &FailureSlot) -> Option<ConnectorError> {
    match slot.lock() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

/// Configuration for partition workers
#[derive(Debug, Clone)]
pub struct PartitionWorkerConfig {
    /// Records drained from the buffer and requested from the coordinator at a time
    pub max_batch: usize,
    /// Size of the channel between the worker and its stream
    pub channel_buffer_size: usize,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Cancelled,
    Closed,
    Failed,
    StreamDropped,
    CoordinatorStopped,
}

impl StopReason {
    fn as_str(&self) -> &'static str {
        match self {
            StopReason::Cancelled => "cancelled",
            StopReason::Closed => "closed",
            StopReason::Failed => "failed",
            StopReason::StreamDropped => "stream_dropped",
            StopReason::CoordinatorStopped => "coordinator_stopped",
        }
    }
}

#[derive(Debug, Default)]
struct Position {
    next: Option<i64>,
    closed: bool,
}

/// Offset after the last record the stream yielded.
///
/// Handing a record out and closing happen under one lock, so once `close`
/// returns the stream yields nothing more and the returned offset is final.
#[derive(Debug)]
pub(crate) struct NextOffset(Mutex<Position>);

impl NextOffset {
    pub(crate) fn new(start: Option<i64>) -> Arc<Self> {
        Arc::new(Self(Mutex::new(Position {
            next: start,
            closed: false,
        })))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Position> {
        match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record `offset` as yielded and run `deliver`, unless already closed
    pub(crate) fn deliver<T>(&self, offset: i64, deliver: impl FnOnce() -> T) -> Option<T> {
        let mut position = self.lock();
        if position.closed {
            return None;
        }
        position.next = Some(offset + 1);
        Some(deliver())
    }

    /// Stop accepting deliveries and return the offset to resume from
    pub(crate) fn close(&self) -> Option<i64> {
        let mut position = self.lock();
        position.closed = true;
        position.next
    }
}

/// Where a stopped worker left its partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    /// Offset after the last record the stream yielded, or the starting
    /// position when nothing was yielded
    pub next_offset: Option<i64>,
}

/// A worker feeding one partition's stream
pub struct PartitionWorker {
    partition: TopicPartition,
    token: CancellationToken,
    outstanding: Arc<OutstandingOffsets>,
    next_offset: Arc<NextOffset>,
    handle: Option<JoinHandle<()>>,
}

impl PartitionWorker {
    /// Start the worker on `runtime` and return the stream it feeds
    pub(crate) fn spawn(
        runtime: &Handle,
        buffer: Arc<DemandBuffer>,
        coordinator: CoordinatorHandle,
        committer: Committer,
        failure: FailureSlot,
        config: &PartitionWorkerConfig,
    ) -> (Self, PartitionSource) {
        let partition = buffer.partition().clone();
        let (sender, receiver) = mpsc::channel(config.channel_buffer_size.max(1));
        let token = CancellationToken::new();
        let outstanding = OutstandingOffsets::new();
        let next_offset = NextOffset::new(buffer.next_offset());

        let run = WorkerLoop {
            partition: partition.clone(),
            buffer,
            coordinator,
            sender,
            token: token.clone(),
            failure,
            config: config.clone(),
        };
        let handle = runtime.spawn(run.run());

        let source = PartitionSource::new(
            partition.clone(),
            receiver,
            token.clone(),
            committer,
            outstanding.clone(),
            next_offset.clone(),
        );
        (
            Self {
                partition,
                token,
                outstanding,
                next_offset,
                handle: Some(handle),
            },
            source,
        )
    }

    pub fn partition(&self) -> &TopicPartition {
        &self.partition
    }

    /// Delivered offsets of this partition not yet committed or dropped
    pub fn outstanding(&self) -> &Arc<OutstandingOffsets> {
        &self.outstanding
    }

    /// Signal the worker (and its stream) to stop. It requests nothing further.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Cancel and wait at most `timeout` for the worker to finish
    pub async fn stop(mut self, timeout: Duration) -> WorkerExit {
        self.token.cancel();
        let next_offset = self.next_offset.close();

        if let Some(handle) = self.handle.take() {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => {
                    debug!(
                        topic = self.partition.topic(),
                        partition = self.partition.partition(),
                        "Partition worker stopped"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        "Partition worker for {}:{} panicked during shutdown: {}",
                        self.partition.topic(),
                        self.partition.partition(),
                        e
                    );
                }
                Err(_) => {
                    warn!(
                        "Partition worker for {}:{} did not stop within {:?}",
                        self.partition.topic(),
                        self.partition.partition(),
                        timeout
                    );
                }
            }
        }
        WorkerExit { next_offset }
    }
}

impl Drop for PartitionWorker {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

struct WorkerLoop {
    partition: TopicPartition,
    buffer: Arc<DemandBuffer>,
    coordinator: CoordinatorHandle,
    sender: mpsc::Sender<ConnectorResult<ConsumerRecord>>,
    token: CancellationToken,
    failure: FailureSlot,
    config: PartitionWorkerConfig,
}

impl WorkerLoop {
    async fn run(self) {
        info!(
            "Starting partition worker for {}:{}",
            self.partition.topic(),
            self.partition.partition()
        );
        let demanded = BTreeSet::from([self.partition.clone()]);

        let reason = 'worker: loop {
            if self.token.is_cancelled() {
                break StopReason::Cancelled;
            }

            let batch = self.buffer.drain(self.config.max_batch);
            if batch.is_empty() {
                if self.buffer.is_closed() {
                    break self.closed().await;
                }

                let requested = tokio::select! {
                    _ = self.token.cancelled() => break StopReason::Cancelled,
                    requested = self.coordinator.request_records(
                        demanded.clone(),
                        self.config.max_batch,
                        self.config.request_timeout,
                    ) => requested,
                };
                match requested {
                    Ok(()) => {}
                    // the request is still queued; records arrive once it is served
                    Err(ConnectorError::TimedOut(timeout)) => {
                        debug!(
                            topic = self.partition.topic(),
                            partition = self.partition.partition(),
                            "Record request not answered within {:?}",
                            timeout
                        );
                    }
                    Err(ConnectorError::Cancelled) => break StopReason::CoordinatorStopped,
                    Err(e) => {
                        self.deliver_error(e).await;
                        break StopReason::Failed;
                    }
                }

                tokio::select! {
                    _ = self.token.cancelled() => break StopReason::Cancelled,
                    _ = self.buffer.records_available() => {}
                }
                continue;
            }

            let delivered = batch.len();
            for record in batch {
                let permit = tokio::select! {
                    _ = self.token.cancelled() => break 'worker StopReason::Cancelled,
                    permit = self.sender.reserve() => permit,
                };
                match permit {
                    Ok(permit) => permit.send(Ok(record)),
                    Err(_) => break 'worker StopReason::StreamDropped,
                }
            }
            metrics::counter!(RECORDS_DELIVERED_COUNTER).increment(delivered as u64);
        };

        metrics::counter!(PARTITION_WORKER_STOPPED_COUNTER, "reason" => reason.as_str())
            .increment(1);
        info!(
            topic = self.partition.topic(),
            partition = self.partition.partition(),
            reason = reason.as_str(),
            "Partition worker finished"
        );
    }

    /// The coordinator dropped the buffer: revoked, stopped or failed
    async fn closed(&self) -> StopReason {
        match read_failure(&self.failure) {
            Some(e) => {
                self.deliver_error(e).await;
                StopReason::Failed
            }
            None => StopReason::Closed,
        }
    }

    async fn deliver_error(&self, e: ConnectorError) {
        warn!(
            topic = self.partition.topic(),
            partition = self.partition.partition(),
            "Failing partition stream: {}",
            e
        );
        tokio::select! {
            _ = self.token.cancelled() => {}
            sent = self.sender.send(Err(e)) => {
                if sent.is_err() {
                    debug!("Partition stream already dropped");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::coordinator::request::{PendingRequest, Request};

    fn config() -> PartitionWorkerConfig {
        PartitionWorkerConfig {
            max_batch: 3,
            channel_buffer_size: 2,
            request_timeout: Duration::from_secs(1),
        }
    }

    fn record(offset: i64) -> ConsumerRecord {
        ConsumerRecord::new(TopicPartition::new("events", 0), offset, None, None, None)
    }

    /// Serves record requests by appending the next `max_batch` offsets to the buffer
    fn feeding_coordinator(buffer: Arc<DemandBuffer>, limit: i64) -> CoordinatorHandle {
        let (handle, mut inbox) = CoordinatorHandle::channel(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut next = 0;
            while let Some(PendingRequest { request, .. }) = inbox.recv().await {
                if let Request::RequestRecords {
                    max_batch, reply, ..
                } = request
                {
                    let end = (next + max_batch as i64).min(limit);
                    buffer.append((next..end).map(record));
                    next = end;
                    let _unused = reply.send(Ok(()));
                }
            }
        });
        handle
    }

    #[tokio::test]
    async fn test_records_flow_in_order_on_demand() {
        let buffer = Arc::new(DemandBuffer::new(TopicPartition::new("events", 0), 10));
        buffer.reset(0);
        let coordinator = feeding_coordinator(buffer.clone(), 10);
        let (worker, source) = PartitionWorker::spawn(
            &Handle::current(),
            buffer,
            coordinator,
            Committer::detached("group"),
            Arc::new(Mutex::new(None)),
            &config(),
        );

        let offsets: Vec<i64> = source
            .take(10)
            .map(|record| record.unwrap().offset().offset())
            .collect()
            .await;
        assert_eq!(offsets, (0..10).collect::<Vec<_>>());

        let exit = worker.stop(Duration::from_secs(1)).await;
        assert_eq!(exit.next_offset, Some(10));
    }

    #[tokio::test]
    async fn test_stop_reports_next_undelivered_offset() {
        let buffer = Arc::new(DemandBuffer::new(TopicPartition::new("events", 0), 10));
        buffer.reset(0);
        let coordinator = feeding_coordinator(buffer.clone(), 100);
        let (worker, mut source) = PartitionWorker::spawn(
            &Handle::current(),
            buffer,
            coordinator,
            Committer::detached("group"),
            Arc::new(Mutex::new(None)),
            &config(),
        );

        let first = source.next().await.unwrap().unwrap();
        assert_eq!(first.offset().offset(), 0);

        // records still queued in the channel were never yielded
        let exit = worker.stop(Duration::from_secs(1)).await;
        assert_eq!(exit.next_offset, Some(1));
        assert!(source.next().await.is_none());
    }

    #[tokio::test]
    async fn test_failure_is_delivered_to_stream() {
        let buffer = Arc::new(DemandBuffer::new(TopicPartition::new("events", 0), 10));
        let (coordinator, _inbox) = CoordinatorHandle::channel(Duration::from_secs(1));
        let failure: FailureSlot = Arc::new(Mutex::new(Some(ConnectorError::Fatal(
            "authorization failed".to_string(),
        ))));
        buffer.close();

        let (worker, mut source) = PartitionWorker::spawn(
            &Handle::current(),
            buffer,
            coordinator,
            Committer::detached("group"),
            failure,
            &config(),
        );

        let err = source.next().await.unwrap().unwrap_err();
        assert_eq!(err, ConnectorError::Fatal("authorization failed".to_string()));
        assert!(source.next().await.is_none());
        worker.stop(Duration::from_secs(1)).await;
    }
}
