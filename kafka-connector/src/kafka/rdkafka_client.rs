use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::{ClientConfig, ClientContext, Offset, TopicPartitionList};
use tracing::{debug, error, info, warn};

use crate::error::{ClientError, ClientResult};
use crate::kafka::client::{ConsumerClient, RebalanceListener};
use crate::kafka::types::{ConsumerRecord, Subscription, TopicPartition};
use crate::metrics_const::{KAFKA_CLIENT_ERRORS_COUNTER, REBALANCE_EMPTY_SKIPPED};

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// rdkafka context that forwards rebalances to the registered [`RebalanceListener`].
///
/// Positions returned by the assign callback are queued and applied by the
/// adapter right after the callback, because librdkafka may refuse a seek on a
/// partition whose fetcher has not started yet.
#[derive(Default)]
pub struct ConnectorContext {
    listener: Mutex<Option<Arc<dyn RebalanceListener>>>,
    rebalanced: AtomicBool,
    pending_seeks: Mutex<BTreeMap<TopicPartition, i64>>,
}

impl ConnectorContext {
    fn listener(&self) -> Option<Arc<dyn RebalanceListener>> {
        match self.listener.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_listener(&self, listener: Arc<dyn RebalanceListener>) {
        match self.listener.lock() {
            Ok(mut guard) => *guard = Some(listener),
            Err(poisoned) => *poisoned.into_inner() = Some(listener),
        }
    }

    fn pending_seeks(&self) -> std::sync::MutexGuard<'_, BTreeMap<TopicPartition, i64>> {
        match self.pending_seeks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Set by a rebalance callback, cleared at the start of every poll
    fn take_rebalanced(&self) -> bool {
        self.rebalanced.swap(false, Ordering::SeqCst)
    }
}

impl ClientContext for ConnectorContext {}

impl ConsumerContext for ConnectorContext {
    fn pre_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(tpl) => {
                if tpl.count() == 0 {
                    debug!("Skipping empty revoke rebalance");
                    metrics::counter!(REBALANCE_EMPTY_SKIPPED, "event_type" => "revoke")
                        .increment(1);
                    return;
                }
                self.rebalanced.store(true, Ordering::SeqCst);

                let partitions = partition_set(tpl);
                info!("Revoking {} partitions", partitions.len());
                self.pending_seeks()
                    .retain(|tp, _| !partitions.contains(tp));

                let Some(listener) = self.listener() else {
                    return;
                };
                let mut commit = |positions: &BTreeMap<TopicPartition, i64>| {
                    commit_positions(base_consumer, positions)
                };
                listener.on_partitions_revoked(&partitions, &mut commit);
            }
            Rebalance::Assign(_) => {}
            Rebalance::Error(e) => {
                error!("Rebalance error: {}", e);
                metrics::counter!(KAFKA_CLIENT_ERRORS_COUNTER, "error" => "rebalance").increment(1);
            }
        }
    }

    fn post_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        let Rebalance::Assign(tpl) = rebalance else {
            return;
        };
        if tpl.count() == 0 {
            debug!("Skipping empty assign rebalance");
            metrics::counter!(REBALANCE_EMPTY_SKIPPED, "event_type" => "assign").increment(1);
            return;
        }
        self.rebalanced.store(true, Ordering::SeqCst);

        // partitions stay paused until the coordinator sees demand for them
        if let Err(e) = base_consumer.pause(tpl) {
            error!("Failed to pause newly assigned partitions: {}", e);
        }

        let partitions = partition_set(tpl);
        info!("Assigned {} partitions", partitions.len());

        if let Some(listener) = self.listener() {
            let positions = listener.on_partitions_assigned(&partitions);
            self.pending_seeks().extend(positions);
        }
    }

    fn commit_callback(
        &self,
        result: rdkafka::error::KafkaResult<()>,
        offsets: &TopicPartitionList,
    ) {
        if let Err(e) = result {
            warn!("Commit of {} partitions failed: {}", offsets.count(), e);
        }
    }
}

/// [`ConsumerClient`] backed by an rdkafka [`BaseConsumer`]
pub struct KafkaConsumerClient {
    consumer: Option<BaseConsumer<ConnectorContext>>,
}

impl KafkaConsumerClient {
    pub fn new(config: &ClientConfig) -> ClientResult<Self> {
        let consumer: BaseConsumer<ConnectorContext> = config
            .create_with_context(ConnectorContext::default())
            .map_err(client_error)?;
        Ok(Self {
            consumer: Some(consumer),
        })
    }

    fn consumer(&self) -> ClientResult<&BaseConsumer<ConnectorContext>> {
        self.consumer
            .as_ref()
            .ok_or_else(|| ClientError::Fatal("consumer is closed".to_string()))
    }

    fn apply_pending_seeks(consumer: &BaseConsumer<ConnectorContext>) {
        let mut pending = consumer.context().pending_seeks();
        pending.retain(|tp, offset| {
            match consumer.seek(tp.topic(), tp.partition(), Offset::Offset(*offset), SEEK_TIMEOUT) {
                Ok(()) => {
                    debug!(
                        topic = tp.topic(),
                        partition = tp.partition(),
                        offset = *offset,
                        "Applied initial position"
                    );
                    false
                }
                Err(e) => {
                    // retried on the next poll
                    debug!(
                        topic = tp.topic(),
                        partition = tp.partition(),
                        "Seek not applied yet: {}",
                        e
                    );
                    true
                }
            }
        });
    }

    fn watermarks(
        &self,
        partitions: &BTreeSet<TopicPartition>,
        timeout: Duration,
    ) -> ClientResult<BTreeMap<TopicPartition, (i64, i64)>> {
        let consumer = self.consumer()?;
        partitions
            .iter()
            .map(|tp| {
                consumer
                    .fetch_watermarks(tp.topic(), tp.partition(), timeout)
                    .map(|marks| (tp.clone(), marks))
                    .map_err(|e| topic_error(tp.topic(), e))
            })
            .collect()
    }
}

impl ConsumerClient for KafkaConsumerClient {
    fn subscribe(
        &mut self,
        subscription: &Subscription,
        listener: Arc<dyn RebalanceListener>,
    ) -> ClientResult<()> {
        let consumer = self.consumer()?;
        consumer.context().set_listener(listener);

        let topics: Vec<String> = match subscription {
            Subscription::Topics(topics) => topics.iter().cloned().collect(),
            // librdkafka treats names starting with ^ as regular expressions
            Subscription::Pattern(pattern) if pattern.starts_with('^') => vec![pattern.clone()],
            Subscription::Pattern(pattern) => vec![format!("^{pattern}")],
            Subscription::Assignment(_) | Subscription::AssignmentWithOffsets(_) => {
                return Err(ClientError::Other(
                    "manual assignments go through assign".to_string(),
                ))
            }
        };
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topics).map_err(client_error)?;
        info!("Subscribed to {:?}", topics);
        Ok(())
    }

    fn assign(&mut self, assignment: &BTreeMap<TopicPartition, Option<i64>>) -> ClientResult<()> {
        let consumer = self.consumer()?;
        let mut tpl = TopicPartitionList::new();
        for (tp, position) in assignment {
            let offset = position.map(Offset::Offset).unwrap_or(Offset::Stored);
            tpl.add_partition_offset(tp.topic(), tp.partition(), offset)
                .map_err(client_error)?;
        }
        consumer.assign(&tpl).map_err(client_error)?;

        let mut paused = TopicPartitionList::new();
        for tp in assignment.keys() {
            paused.add_partition(tp.topic(), tp.partition());
        }
        consumer.pause(&paused).map_err(client_error)
    }

    fn poll(&mut self, timeout: Duration, max_records: usize) -> ClientResult<Vec<ConsumerRecord>> {
        let consumer = self.consumer()?;
        Self::apply_pending_seeks(consumer);
        consumer.context().take_rebalanced();

        let deadline = Instant::now() + timeout;
        let mut records = Vec::new();

        while records.len() < max_records {
            // block only until the first record arrives, then take what is already fetched
            let wait = if records.is_empty() {
                deadline.saturating_duration_since(Instant::now())
            } else {
                Duration::ZERO
            };

            match consumer.poll(wait) {
                None => break,
                Some(Ok(message)) => {
                    let record = to_record(&message);
                    if consumer
                        .context()
                        .pending_seeks()
                        .contains_key(record.topic_partition())
                    {
                        // fetched before the initial position was applied
                        continue;
                    }
                    records.push(record);
                }
                Some(Err(e)) => {
                    let err = client_error(e);
                    if matches!(err, ClientError::Fatal(_)) || records.is_empty() {
                        return Err(err);
                    }
                    warn!("Poll error after {} records: {}", records.len(), err);
                    break;
                }
            }

            // hand back so the coordinator can resync pause state for the new assignment
            if consumer.context().take_rebalanced() {
                break;
            }
        }

        Self::apply_pending_seeks(consumer);
        Ok(records)
    }

    fn pause(&mut self, partitions: &BTreeSet<TopicPartition>) -> ClientResult<()> {
        self.consumer()?
            .pause(&to_tpl(partitions))
            .map_err(client_error)
    }

    fn resume(&mut self, partitions: &BTreeSet<TopicPartition>) -> ClientResult<()> {
        self.consumer()?
            .resume(&to_tpl(partitions))
            .map_err(client_error)
    }

    fn seek(&mut self, partition: &TopicPartition, offset: i64) -> ClientResult<()> {
        let consumer = self.consumer()?;
        consumer.context().pending_seeks().remove(partition);
        consumer
            .seek(
                partition.topic(),
                partition.partition(),
                Offset::Offset(offset),
                SEEK_TIMEOUT,
            )
            .map_err(client_error)
    }

    fn commit(&mut self, positions: &BTreeMap<TopicPartition, i64>) -> ClientResult<()> {
        commit_positions(self.consumer()?, positions)
    }

    fn beginning_offsets(
        &mut self,
        partitions: &BTreeSet<TopicPartition>,
        timeout: Duration,
    ) -> ClientResult<BTreeMap<TopicPartition, i64>> {
        Ok(self
            .watermarks(partitions, timeout)?
            .into_iter()
            .map(|(tp, (low, _))| (tp, low))
            .collect())
    }

    fn end_offsets(
        &mut self,
        partitions: &BTreeSet<TopicPartition>,
        timeout: Duration,
    ) -> ClientResult<BTreeMap<TopicPartition, i64>> {
        Ok(self
            .watermarks(partitions, timeout)?
            .into_iter()
            .map(|(tp, (_, high))| (tp, high))
            .collect())
    }

    fn committed_offsets(
        &mut self,
        partitions: &BTreeSet<TopicPartition>,
        timeout: Duration,
    ) -> ClientResult<BTreeMap<TopicPartition, Option<i64>>> {
        let committed = self
            .consumer()?
            .committed_offsets(to_tpl(partitions), timeout)
            .map_err(client_error)?;
        Ok(committed
            .elements()
            .into_iter()
            .map(|elem| {
                let offset = match elem.offset() {
                    Offset::Offset(offset) => Some(offset),
                    _ => None,
                };
                (TopicPartition::from(elem), offset)
            })
            .collect())
    }

    fn partitions_for(
        &mut self,
        topic: &str,
        timeout: Duration,
    ) -> ClientResult<Vec<TopicPartition>> {
        let metadata = self
            .consumer()?
            .fetch_metadata(Some(topic), timeout)
            .map_err(|e| topic_error(topic, e))?;

        let Some(found) = metadata.topics().iter().find(|t| t.name() == topic) else {
            return Err(ClientError::UnknownTopic(topic.to_string()));
        };
        if let Some(err) = found.error() {
            let code = RDKafkaErrorCode::from(err);
            return Err(match code {
                RDKafkaErrorCode::InvalidTopic => ClientError::InvalidTopic(topic.to_string()),
                RDKafkaErrorCode::UnknownTopicOrPartition | RDKafkaErrorCode::UnknownTopic => {
                    ClientError::UnknownTopic(topic.to_string())
                }
                other => ClientError::Other(format!("metadata for {topic}: {other}")),
            });
        }
        Ok(found
            .partitions()
            .iter()
            .map(|p| TopicPartition::new(topic, p.id()))
            .collect())
    }

    fn list_topics(
        &mut self,
        timeout: Duration,
    ) -> ClientResult<BTreeMap<String, Vec<TopicPartition>>> {
        let metadata = self
            .consumer()?
            .fetch_metadata(None, timeout)
            .map_err(client_error)?;
        Ok(metadata
            .topics()
            .iter()
            .filter(|t| t.error().is_none())
            .map(|t| {
                let partitions = t
                    .partitions()
                    .iter()
                    .map(|p| TopicPartition::new(t.name(), p.id()))
                    .collect();
                (t.name().to_string(), partitions)
            })
            .collect())
    }

    fn offsets_for_times(
        &mut self,
        timestamps: &BTreeMap<TopicPartition, i64>,
        timeout: Duration,
    ) -> ClientResult<BTreeMap<TopicPartition, Option<i64>>> {
        let mut tpl = TopicPartitionList::new();
        for (tp, ts) in timestamps {
            tpl.add_partition_offset(tp.topic(), tp.partition(), Offset::Offset(*ts))
                .map_err(client_error)?;
        }
        let found = self
            .consumer()?
            .offsets_for_times(tpl, timeout)
            .map_err(client_error)?;
        Ok(found
            .elements()
            .into_iter()
            .map(|elem| {
                let offset = match elem.offset() {
                    Offset::Offset(offset) => Some(offset),
                    _ => None,
                };
                (TopicPartition::from(elem), offset)
            })
            .collect())
    }

    fn close(&mut self, timeout: Duration) -> ClientResult<()> {
        let Some(consumer) = self.consumer.take() else {
            return Ok(());
        };
        let deadline = Instant::now() + timeout;

        consumer.unsubscribe();
        // keep serving callbacks until the revocation went through
        loop {
            let owned = consumer.assignment().map(|a| a.count()).unwrap_or(0);
            if owned == 0 {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("Consumer still owned {} partitions at close deadline", owned);
                drop(consumer);
                return Err(ClientError::CloseTimedOut(timeout));
            }
            if let Some(Err(e)) = consumer.poll(remaining.min(Duration::from_millis(100))) {
                debug!("Poll error while closing: {}", e);
            }
        }

        drop(consumer);
        info!("Kafka consumer closed");
        Ok(())
    }
}

fn partition_set(tpl: &TopicPartitionList) -> BTreeSet<TopicPartition> {
    tpl.elements().into_iter().map(TopicPartition::from).collect()
}

fn to_tpl(partitions: &BTreeSet<TopicPartition>) -> TopicPartitionList {
    let mut tpl = TopicPartitionList::new();
    for tp in partitions {
        tpl.add_partition(tp.topic(), tp.partition());
    }
    tpl
}

fn to_record(message: &BorrowedMessage<'_>) -> ConsumerRecord {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|h| (h.key.to_string(), h.value.map(Bytes::copy_from_slice)))
                .collect()
        })
        .unwrap_or_default();

    ConsumerRecord::new(
        TopicPartition::new(message.topic(), message.partition()),
        message.offset(),
        message.key().map(Bytes::copy_from_slice),
        message.payload().map(Bytes::copy_from_slice),
        message.timestamp().to_millis(),
    )
    .with_headers(headers)
}

fn commit_positions(
    consumer: &BaseConsumer<ConnectorContext>,
    positions: &BTreeMap<TopicPartition, i64>,
) -> ClientResult<()> {
    if positions.is_empty() {
        return Ok(());
    }
    let mut tpl = TopicPartitionList::new();
    for (tp, position) in positions {
        tpl.add_partition_offset(tp.topic(), tp.partition(), Offset::Offset(*position))
            .map_err(client_error)?;
    }

    match consumer.commit(&tpl, CommitMode::Sync) {
        Ok(()) => Ok(()),
        Err(e) => {
            // librdkafka flags the rejected partitions in the list it was given
            let mut failed: BTreeSet<TopicPartition> = tpl
                .elements()
                .into_iter()
                .filter(|elem| elem.error().is_err())
                .map(TopicPartition::from)
                .collect();
            if failed.is_empty() {
                failed = positions.keys().cloned().collect();
            }
            metrics::counter!(KAFKA_CLIENT_ERRORS_COUNTER, "error" => "commit").increment(1);
            Err(ClientError::CommitFailed {
                partitions: failed,
                reason: e.to_string(),
            })
        }
    }
}

fn topic_error(topic: &str, e: KafkaError) -> ClientError {
    match e.rdkafka_error_code() {
        Some(RDKafkaErrorCode::UnknownTopicOrPartition)
        | Some(RDKafkaErrorCode::UnknownTopic)
        | Some(RDKafkaErrorCode::UnknownPartition) => ClientError::UnknownTopic(topic.to_string()),
        Some(RDKafkaErrorCode::InvalidTopic) => ClientError::InvalidTopic(topic.to_string()),
        _ => client_error(e),
    }
}

/// Sort rdkafka errors into the ones the coordinator can live with and the ones it cannot
pub fn client_error(e: KafkaError) -> ClientError {
    if let KafkaError::MessageConsumptionFatal(_) | KafkaError::Canceled = e {
        metrics::counter!(KAFKA_CLIENT_ERRORS_COUNTER, "error" => "fatal").increment(1);
        return ClientError::Fatal(e.to_string());
    }

    match e.rdkafka_error_code() {
        Some(RDKafkaErrorCode::UnknownTopicOrPartition) | Some(RDKafkaErrorCode::UnknownTopic) => {
            ClientError::UnknownTopic(e.to_string())
        }
        Some(RDKafkaErrorCode::InvalidTopic) => ClientError::InvalidTopic(e.to_string()),
        Some(RDKafkaErrorCode::Authentication)
        | Some(RDKafkaErrorCode::SaslAuthenticationFailed)
        | Some(RDKafkaErrorCode::TopicAuthorizationFailed)
        | Some(RDKafkaErrorCode::GroupAuthorizationFailed)
        | Some(RDKafkaErrorCode::Fatal) => {
            metrics::counter!(KAFKA_CLIENT_ERRORS_COUNTER, "error" => "fatal").increment(1);
            ClientError::Fatal(e.to_string())
        }
        Some(RDKafkaErrorCode::BrokerTransportFailure)
        | Some(RDKafkaErrorCode::AllBrokersDown)
        | Some(RDKafkaErrorCode::OperationTimedOut)
        | Some(RDKafkaErrorCode::RequestTimedOut) => {
            metrics::counter!(KAFKA_CLIENT_ERRORS_COUNTER, "error" => "transient").increment(1);
            ClientError::Transient(e.to_string())
        }
        _ => ClientError::Other(e.to_string()),
    }
}
