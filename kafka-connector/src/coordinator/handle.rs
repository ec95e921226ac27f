use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::coordinator::request::{MetadataQuery, MetadataResponse, PendingRequest, Reply, Request};
use crate::error::{ConnectorError, ConnectorResult};
use crate::kafka::types::{Subscription, TopicPartition};

/// Cloneable access to the consumer coordinator.
///
/// Every call waits for the reply at most `timeout`. A [`ConnectorError::TimedOut`]
/// does not withdraw the request: it may still be executed.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<PendingRequest>,
    request_timeout: Duration,
}

impl CoordinatorHandle {
    pub(crate) fn channel(
        request_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<PendingRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                request_timeout,
            },
            rx,
        )
    }

    /// Default timeout from the consumer settings
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Whether the coordinator stopped serving requests
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn call<T>(
        &self,
        timeout: Duration,
        build: impl FnOnce(Reply<T>) -> Request,
    ) -> ConnectorResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest::new(build(reply_tx)))
            .map_err(|_| ConnectorError::Cancelled)?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            // the coordinator dropped the request while stopping
            Ok(Err(_)) => Err(ConnectorError::Cancelled),
            Err(_) => Err(ConnectorError::TimedOut(timeout)),
        }
    }

    pub async fn assign(
        &self,
        subscription: Subscription,
        timeout: Duration,
    ) -> ConnectorResult<()> {
        self.call(timeout, |reply| Request::Assign {
            subscription,
            reply,
        })
        .await
    }

    /// Ask for up to `max_batch` more records on each partition. Never polls by itself.
    pub async fn request_records(
        &self,
        partitions: BTreeSet<TopicPartition>,
        max_batch: usize,
        timeout: Duration,
    ) -> ConnectorResult<()> {
        self.call(timeout, |reply| Request::RequestRecords {
            partitions,
            max_batch,
            reply,
        })
        .await
    }

    pub async fn seek(
        &self,
        partition: TopicPartition,
        offset: i64,
        timeout: Duration,
    ) -> ConnectorResult<()> {
        self.call(timeout, |reply| Request::Seek {
            partition,
            offset,
            reply,
        })
        .await
    }

    /// Commit record offsets (the broker stores `offset + 1`). Returns the
    /// acknowledged offsets, or `CommitFailed` naming the partitions that were not.
    pub async fn commit(
        &self,
        offsets: BTreeMap<TopicPartition, i64>,
        timeout: Duration,
    ) -> ConnectorResult<BTreeMap<TopicPartition, i64>> {
        self.call(timeout, |reply| Request::Commit { offsets, reply })
            .await
    }

    pub async fn metadata(
        &self,
        query: MetadataQuery,
        timeout: Duration,
    ) -> ConnectorResult<MetadataResponse> {
        self.call(timeout, |reply| Request::Metadata { query, reply })
            .await
    }

    pub async fn beginning_offsets(
        &self,
        partitions: BTreeSet<TopicPartition>,
        timeout: Duration,
    ) -> ConnectorResult<BTreeMap<TopicPartition, i64>> {
        match self
            .metadata(MetadataQuery::BeginningOffsets(partitions), timeout)
            .await?
        {
            MetadataResponse::Offsets(offsets) => Ok(offsets),
            other => Err(unexpected(other)),
        }
    }

    pub async fn end_offsets(
        &self,
        partitions: BTreeSet<TopicPartition>,
        timeout: Duration,
    ) -> ConnectorResult<BTreeMap<TopicPartition, i64>> {
        match self
            .metadata(MetadataQuery::EndOffsets(partitions), timeout)
            .await?
        {
            MetadataResponse::Offsets(offsets) => Ok(offsets),
            other => Err(unexpected(other)),
        }
    }

    pub async fn beginning_offset_for_partition(
        &self,
        partition: TopicPartition,
        timeout: Duration,
    ) -> ConnectorResult<i64> {
        let offsets = self
            .beginning_offsets(BTreeSet::from([partition.clone()]), timeout)
            .await?;
        offsets
            .get(&partition)
            .copied()
            .ok_or_else(|| ConnectorError::TopicUnknown(partition.topic().to_string()))
    }

    pub async fn end_offset_for_partition(
        &self,
        partition: TopicPartition,
        timeout: Duration,
    ) -> ConnectorResult<i64> {
        let offsets = self
            .end_offsets(BTreeSet::from([partition.clone()]), timeout)
            .await?;
        offsets
            .get(&partition)
            .copied()
            .ok_or_else(|| ConnectorError::TopicUnknown(partition.topic().to_string()))
    }

    pub async fn partitions_for(
        &self,
        topic: impl Into<String>,
        timeout: Duration,
    ) -> ConnectorResult<Vec<TopicPartition>> {
        match self
            .metadata(MetadataQuery::PartitionsFor(topic.into()), timeout)
            .await?
        {
            MetadataResponse::Partitions(partitions) => Ok(partitions),
            other => Err(unexpected(other)),
        }
    }

    /// Last committed record position per partition, `None` when the group never committed
    pub async fn committed_offsets(
        &self,
        partitions: BTreeSet<TopicPartition>,
        timeout: Duration,
    ) -> ConnectorResult<BTreeMap<TopicPartition, Option<i64>>> {
        match self
            .metadata(MetadataQuery::CommittedOffsets(partitions), timeout)
            .await?
        {
            MetadataResponse::CommittedOffsets(offsets) => Ok(offsets),
            other => Err(unexpected(other)),
        }
    }

    pub async fn committed_offset(
        &self,
        partition: TopicPartition,
        timeout: Duration,
    ) -> ConnectorResult<Option<i64>> {
        let offsets = self
            .committed_offsets(BTreeSet::from([partition.clone()]), timeout)
            .await?;
        Ok(offsets.get(&partition).copied().flatten())
    }

    pub async fn list_topics(
        &self,
        timeout: Duration,
    ) -> ConnectorResult<BTreeMap<String, Vec<TopicPartition>>> {
        match self.metadata(MetadataQuery::ListTopics, timeout).await? {
            MetadataResponse::Topics(topics) => Ok(topics),
            other => Err(unexpected(other)),
        }
    }

    pub async fn offsets_for_times(
        &self,
        timestamps: BTreeMap<TopicPartition, i64>,
        timeout: Duration,
    ) -> ConnectorResult<BTreeMap<TopicPartition, Option<i64>>> {
        match self
            .metadata(MetadataQuery::OffsetsForTimes(timestamps), timeout)
            .await?
        {
            MetadataResponse::OffsetsForTimes(offsets) => Ok(offsets),
            other => Err(unexpected(other)),
        }
    }

    /// Leave the group and release the client, waiting at most `stop_timeout`
    /// for the coordinator to finish.
    pub async fn shutdown(&self, stop_timeout: Duration) -> ConnectorResult<()> {
        let wait = stop_timeout + self.request_timeout;
        match self
            .call(wait, |reply| Request::Shutdown {
                stop_timeout,
                reply,
            })
            .await
        {
            Err(ConnectorError::TimedOut(_)) => Err(ConnectorError::ShutdownTimeout(stop_timeout)),
            // already stopped
            Err(ConnectorError::Cancelled) if self.is_closed() => Ok(()),
            other => other,
        }
    }
}

fn unexpected(response: MetadataResponse) -> ConnectorError {
    ConnectorError::Client(format!("unexpected metadata response: {response:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unanswered_request_times_out() {
        let (handle, mut rx) = CoordinatorHandle::channel(Duration::from_millis(10));
        let result = handle
            .seek(TopicPartition::new("events", 0), 5, Duration::from_millis(20))
            .await;
        assert_eq!(result, Err(ConnectorError::TimedOut(Duration::from_millis(20))));

        // the request was still delivered
        let pending = rx.recv().await.unwrap();
        assert_eq!(pending.kind(), "seek");
    }

    #[tokio::test]
    async fn test_stopped_coordinator_cancels_requests() {
        let (handle, rx) = CoordinatorHandle::channel(Duration::from_millis(10));
        drop(rx);

        let result = handle
            .request_records(BTreeSet::new(), 10, Duration::from_secs(1))
            .await;
        assert_eq!(result, Err(ConnectorError::Cancelled));
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_dropped_reply_is_cancelled() {
        let (handle, mut rx) = CoordinatorHandle::channel(Duration::from_millis(10));
        let responder = tokio::spawn(async move {
            let pending = rx.recv().await.unwrap();
            drop(pending);
        });

        let result = handle.list_topics(Duration::from_secs(1)).await;
        assert_eq!(result, Err(ConnectorError::Cancelled));
        responder.await.unwrap();
    }
}
