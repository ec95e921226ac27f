use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use tracing::{debug, error, info};

use crate::error::{ConnectorError, ConnectorResult};
use crate::kafka::rdkafka_client::client_error;

/// A record to publish. Without a partition the producer's partitioner picks one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRecord {
    pub topic: String,
    pub partition: Option<i32>,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<(String, Option<Bytes>)>,
    pub timestamp: Option<i64>,
}

impl ProducerRecord {
    pub fn new(topic: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            key: None,
            value: Some(value.into()),
            headers: Vec::new(),
            timestamp: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: Option<Bytes>) -> Self {
        self.headers.push((key.into(), value));
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Where a published record ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Publishing side of the client boundary
#[async_trait]
pub trait ProducerClient: Send + Sync + 'static {
    /// Resolves once the broker acknowledged the record or the send failed
    async fn send(&self, record: ProducerRecord) -> ConnectorResult<RecordMetadata>;
}

/// `ProducerClient` backed by an rdkafka `FutureProducer`
pub struct KafkaProducerClient {
    producer: FutureProducer,
    queue_timeout: Duration,
}

impl KafkaProducerClient {
    /// Create the producer and check the brokers are reachable
    pub async fn new(config: &ClientConfig, metadata_timeout: Duration) -> ConnectorResult<Self> {
        debug!("rdkafka producer configuration: {:?}", config);
        let producer: FutureProducer = config.create().map_err(client_error)?;

        // "Ping" the Kafka brokers by requesting metadata
        match producer.client().fetch_metadata(None, metadata_timeout) {
            Ok(metadata) => {
                info!(
                    "Successfully connected to Kafka brokers. Found {} topics.",
                    metadata.topics().len()
                );
            }
            Err(e) => {
                error!("Failed to fetch metadata from Kafka brokers: {:?}", e);
                return Err(client_error(e).into());
            }
        }

        Ok(Self {
            producer,
            queue_timeout: metadata_timeout,
        })
    }

    /// Wait for everything queued to be delivered
    pub fn flush(&self, timeout: Duration) -> ConnectorResult<()> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|e| ConnectorError::Produce(e.to_string()))
    }
}

#[async_trait]
impl ProducerClient for KafkaProducerClient {
    async fn send(&self, record: ProducerRecord) -> ConnectorResult<RecordMetadata> {
        let mut headers = OwnedHeaders::new();
        for (key, value) in &record.headers {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: value.as_deref(),
            });
        }

        let mut future_record: FutureRecord<'_, [u8], [u8]> =
            FutureRecord::to(&record.topic).headers(headers);
        if let Some(key) = record.key.as_deref() {
            future_record = future_record.key(key);
        }
        if let Some(value) = record.value.as_deref() {
            future_record = future_record.payload(value);
        }
        if let Some(partition) = record.partition {
            future_record = future_record.partition(partition);
        }
        if let Some(timestamp) = record.timestamp {
            future_record = future_record.timestamp(timestamp);
        }

        match self
            .producer
            .send(future_record, Timeout::After(self.queue_timeout))
            .await
        {
            Ok((partition, offset)) => Ok(RecordMetadata {
                topic: record.topic.clone(),
                partition,
                offset,
            }),
            Err((e, _)) => Err(ConnectorError::Produce(e.to_string())),
        }
    }
}
