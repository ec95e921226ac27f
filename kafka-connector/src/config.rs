use std::time::Duration;

use envconfig::Envconfig;
use rdkafka::ClientConfig;

use crate::kafka::{ConsumerConfigBuilder, ProducerConfigBuilder};

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka configuration
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "kafka-connector")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "events")]
    pub kafka_consumer_topic: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(default = "cooperative-sticky")]
    pub kafka_partition_assignment_strategy: String,

    // Kafka Producer configuration
    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32,

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32,

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32,

    #[envconfig(default = "snappy")]
    pub kafka_compression_codec: String,

    // Records are re-published here; when unset they are only consumed and committed
    pub output_topic: Option<String>,

    // Consumer coordinator
    #[envconfig(default = "50")]
    pub poll_interval_ms: u64,

    #[envconfig(default = "50")]
    pub poll_timeout_ms: u64,

    #[envconfig(default = "500")]
    pub max_poll_records: usize,

    #[envconfig(default = "100")]
    pub max_batch: usize,

    #[envconfig(default = "1000")]
    pub buffer_capacity: usize,

    #[envconfig(default = "100")]
    pub sub_stream_buffer: usize,

    #[envconfig(default = "5000")]
    pub request_timeout_ms: u64,

    #[envconfig(default = "30")]
    pub stop_timeout_secs: u64,

    #[envconfig(default = "10000")]
    pub revoke_drain_timeout_ms: u64,

    #[envconfig(default = "10000")]
    pub offsets_on_assign_timeout_ms: u64,

    // Commit aggregator
    #[envconfig(default = "1000")]
    pub commit_max_batch: usize,

    #[envconfig(default = "5000")]
    pub commit_max_interval_ms: u64,

    #[envconfig(default = "3")]
    pub commit_max_attempts: u32,

    // Producer flow
    #[envconfig(default = "100")]
    pub producer_parallelism: usize,

    #[envconfig(default = "true")]
    pub producer_fail_fast: bool,

    // HTTP server configuration
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    /// Get server bind address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn consumer_settings(&self) -> ConsumerSettings {
        ConsumerSettings {
            group_id: self.kafka_consumer_group.clone(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            max_poll_records: self.max_poll_records,
            max_batch: self.max_batch,
            buffer_capacity: self.buffer_capacity,
            sub_stream_buffer: self.sub_stream_buffer,
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
            revoke_drain_timeout: Duration::from_millis(self.revoke_drain_timeout_ms),
            offsets_on_assign_timeout: Duration::from_millis(self.offsets_on_assign_timeout_ms),
            metadata_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }

    pub fn committer_settings(&self) -> CommitterSettings {
        CommitterSettings {
            max_batch: self.commit_max_batch,
            max_interval: Duration::from_millis(self.commit_max_interval_ms),
            max_attempts: self.commit_max_attempts,
            commit_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }

    pub fn producer_settings(&self) -> ProducerSettings {
        ProducerSettings {
            parallelism: self.producer_parallelism,
            failure_policy: if self.producer_fail_fast {
                FailurePolicy::FailFast
            } else {
                FailurePolicy::PerElement
            },
        }
    }

    pub fn consumer_client_config(&self) -> ClientConfig {
        ConsumerConfigBuilder::for_group_consumer(&self.kafka_hosts, &self.kafka_consumer_group)
            .with_tls(self.kafka_tls)
            .with_offset_reset(&self.kafka_consumer_offset_reset)
            .with_assignment_strategy(&self.kafka_partition_assignment_strategy)
            .build()
    }

    pub fn producer_client_config(&self) -> ClientConfig {
        ProducerConfigBuilder::new(&self.kafka_hosts)
            .with_tls(self.kafka_tls)
            .with_linger_ms(self.kafka_producer_linger_ms)
            .with_message_timeout_ms(self.kafka_message_timeout_ms)
            .with_compression_codec(&self.kafka_compression_codec)
            .with_queue_mib(self.kafka_producer_queue_mib)
            .build()
    }
}

/// Coordinator and partition stream settings
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub group_id: String,
    /// Idle wait between housekeeping polls when no partition wants records
    pub poll_interval: Duration,
    /// How long a poll may block when some partition wants records
    pub poll_timeout: Duration,
    pub max_poll_records: usize,
    /// Records requested per partition at a time
    pub max_batch: usize,
    /// Records held per partition before it is paused
    pub buffer_capacity: usize,
    /// Records handed to a partition stream ahead of the application pulling them
    pub sub_stream_buffer: usize,
    pub request_timeout: Duration,
    pub stop_timeout: Duration,
    pub revoke_drain_timeout: Duration,
    pub offsets_on_assign_timeout: Duration,
    pub metadata_timeout: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            group_id: "kafka-connector".to_string(),
            poll_interval: Duration::from_millis(50),
            poll_timeout: Duration::from_millis(50),
            max_poll_records: 500,
            max_batch: 100,
            buffer_capacity: 1000,
            sub_stream_buffer: 100,
            request_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(30),
            revoke_drain_timeout: Duration::from_secs(10),
            offsets_on_assign_timeout: Duration::from_secs(10),
            metadata_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommitterSettings {
    /// Distinct partitions pending before a commit is issued
    pub max_batch: usize,
    /// Oldest pending offset age before a commit is issued
    pub max_interval: Duration,
    pub max_attempts: u32,
    pub commit_timeout: Duration,
}

impl Default for CommitterSettings {
    fn default() -> Self {
        Self {
            max_batch: 1000,
            max_interval: Duration::from_secs(5),
            max_attempts: 3,
            commit_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// The first failed envelope fails the whole flow
    FailFast,
    /// Failures are emitted as elements and the flow continues
    PerElement,
}

#[derive(Debug, Clone)]
pub struct ProducerSettings {
    /// Records in flight at once
    pub parallelism: usize,
    pub failure_policy: FailurePolicy,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            parallelism: 100,
            failure_policy: FailurePolicy::FailFast,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_defaults_from_empty_environment() {
        let config = Config::init_from_hashmap(&HashMap::new()).unwrap();

        assert_eq!(config.kafka_hosts, "localhost:9092");
        assert_eq!(config.output_topic, None);
        assert_eq!(config.bind_address(), "0.0.0.0:8080");

        let consumer = config.consumer_settings();
        assert_eq!(consumer.group_id, "kafka-connector");
        assert_eq!(consumer.stop_timeout, Duration::from_secs(30));
        assert_eq!(
            config.producer_settings().failure_policy,
            FailurePolicy::FailFast
        );
    }

    #[test]
    fn test_settings_follow_environment() {
        let env = HashMap::from([
            ("KAFKA_CONSUMER_GROUP".to_string(), "orders".to_string()),
            ("MAX_BATCH".to_string(), "10".to_string()),
            ("COMMIT_MAX_INTERVAL_MS".to_string(), "250".to_string()),
            ("PRODUCER_FAIL_FAST".to_string(), "false".to_string()),
            ("OUTPUT_TOPIC".to_string(), "orders-copy".to_string()),
        ]);
        let config = Config::init_from_hashmap(&env).unwrap();

        assert_eq!(config.consumer_settings().max_batch, 10);
        assert_eq!(
            config.committer_settings().max_interval,
            Duration::from_millis(250)
        );
        assert_eq!(
            config.producer_settings().failure_policy,
            FailurePolicy::PerElement
        );
        assert_eq!(config.output_topic.as_deref(), Some("orders-copy"));
        assert_eq!(
            config.consumer_client_config().get("group.id"),
            Some("orders")
        );
    }
}
