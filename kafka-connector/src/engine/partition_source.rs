use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::commit::{CommittableOffset, Committer, OutstandingOffsets};
use crate::engine::partition_worker::NextOffset;
use crate::error::{ConnectorError, ConnectorResult};
use crate::kafka::types::{ConsumerRecord, TopicPartition};

/// A consumed record together with the offset that commits it
#[derive(Debug)]
pub struct CommittableRecord {
    record: ConsumerRecord,
    offset: CommittableOffset,
}

impl CommittableRecord {
    pub fn record(&self) -> &ConsumerRecord {
        &self.record
    }

    pub fn offset(&self) -> &CommittableOffset {
        &self.offset
    }

    pub fn into_offset(self) -> CommittableOffset {
        self.offset
    }

    pub fn into_parts(self) -> (ConsumerRecord, CommittableOffset) {
        (self.record, self.offset)
    }
}

/// Records of one partition for one assignment lifetime.
///
/// Ends when the partition is revoked, the source is cancelled or the engine
/// shuts down. Yields one `Err` and ends if the consumer failed. Records still
/// queued when the partition is revoked are never yielded.
pub struct PartitionSource {
    partition: TopicPartition,
    receiver: mpsc::Receiver<ConnectorResult<ConsumerRecord>>,
    token: CancellationToken,
    committer: Committer,
    outstanding: Arc<OutstandingOffsets>,
    next_offset: Arc<NextOffset>,
}

impl PartitionSource {
    pub(crate) fn new(
        partition: TopicPartition,
        receiver: mpsc::Receiver<ConnectorResult<ConsumerRecord>>,
        token: CancellationToken,
        committer: Committer,
        outstanding: Arc<OutstandingOffsets>,
        next_offset: Arc<NextOffset>,
    ) -> Self {
        Self {
            partition,
            receiver,
            token,
            committer,
            outstanding,
            next_offset,
        }
    }

    pub fn partition(&self) -> &TopicPartition {
        &self.partition
    }

    /// Stop this partition's stream. The partition stays assigned but nothing is
    /// fetched for it until it is reassigned.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Commits offsets of this partition's records
    pub fn committer(&self) -> &Committer {
        &self.committer
    }

    pub async fn next_record(&mut self) -> Option<ConnectorResult<CommittableRecord>> {
        futures::StreamExt::next(self).await
    }
}

impl Stream for PartitionSource {
    type Item = Result<CommittableRecord, ConnectorError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.token.is_cancelled() {
            this.receiver.close();
            return Poll::Ready(None);
        }

        match this.receiver.poll_recv(cx) {
            Poll::Ready(Some(Ok(record))) => {
                let (committer, outstanding) = (&this.committer, &this.outstanding);
                let delivered = this.next_offset.deliver(record.offset(), || {
                    committer.delivered_offset(
                        record.topic_partition().clone(),
                        record.offset(),
                        outstanding.track(),
                    )
                });
                match delivered {
                    Some(offset) => Poll::Ready(Some(Ok(CommittableRecord { record, offset }))),
                    // the worker was stopped after the check above; the record was never handed out
                    None => {
                        this.receiver.close();
                        Poll::Ready(None)
                    }
                }
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PartitionSource {
    fn drop(&mut self) {
        // a dropped source counts as drained
        self.token.cancel();
    }
}

impl std::fmt::Debug for PartitionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionSource")
            .field("partition", &self.partition)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    fn record(offset: i64) -> ConsumerRecord {
        ConsumerRecord::new(TopicPartition::new("events", 0), offset, None, None, None)
    }

    fn source_with_position(
        capacity: usize,
        position: Arc<NextOffset>,
    ) -> (
        PartitionSource,
        mpsc::Sender<ConnectorResult<ConsumerRecord>>,
        Arc<OutstandingOffsets>,
    ) {
        let (tx, rx) = mpsc::channel(capacity);
        let outstanding = OutstandingOffsets::new();
        let source = PartitionSource::new(
            TopicPartition::new("events", 0),
            rx,
            CancellationToken::new(),
            Committer::detached("group"),
            outstanding.clone(),
            position,
        );
        (source, tx, outstanding)
    }

    fn source(
        capacity: usize,
    ) -> (
        PartitionSource,
        mpsc::Sender<ConnectorResult<ConsumerRecord>>,
        Arc<OutstandingOffsets>,
    ) {
        source_with_position(capacity, NextOffset::new(None))
    }

    #[tokio::test]
    async fn test_delivered_records_are_tracked_until_dropped() {
        let (mut source, tx, outstanding) = source(4);
        tx.send(Ok(record(0))).await.unwrap();
        tx.send(Ok(record(1))).await.unwrap();

        let first = source.next().await.unwrap().unwrap();
        assert_eq!(first.offset().offset(), 0);
        assert_eq!(outstanding.count(), 1);

        let second = source.next().await.unwrap().unwrap();
        assert_eq!(outstanding.count(), 2);

        drop(first);
        let offset = second.into_offset();
        assert_eq!(outstanding.count(), 1);
        drop(offset);
        assert_eq!(outstanding.count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_source_drops_queued_records() {
        let (mut source, tx, outstanding) = source(4);
        tx.send(Ok(record(0))).await.unwrap();
        source.cancel();

        assert!(source.next().await.is_none());
        assert_eq!(outstanding.count(), 0);
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn test_nothing_is_yielded_once_position_is_closed() {
        let position = NextOffset::new(Some(4));
        let (mut source, tx, outstanding) = source_with_position(4, position.clone());
        tx.send(Ok(record(4))).await.unwrap();
        tx.send(Ok(record(5))).await.unwrap();

        let first = source.next().await.unwrap().unwrap();
        assert_eq!(first.offset().offset(), 4);

        // the token is still live: only the closed position stops delivery
        assert_eq!(position.close(), Some(5));
        assert!(!source.is_cancelled());
        assert!(source.next().await.is_none());

        drop(first);
        assert_eq!(outstanding.count(), 0);
        assert_eq!(position.close(), Some(5));
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn test_error_is_yielded_then_stream_ends() {
        let (mut source, tx, _outstanding) = source(4);
        tx.send(Err(ConnectorError::Fatal("broker gone".to_string())))
            .await
            .unwrap();
        drop(tx);

        assert_eq!(
            source.next().await.unwrap().unwrap_err(),
            ConnectorError::Fatal("broker gone".to_string())
        );
        assert!(source.next().await.is_none());
    }
}
