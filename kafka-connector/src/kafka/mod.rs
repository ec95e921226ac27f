// Kafka client boundary - traits the coordinator drives and the rdkafka implementation
pub mod client;
pub mod config;
pub mod rdkafka_client;
pub mod types;

pub use client::{ConsumerClient, RebalanceListener};
pub use config::{ConsumerConfigBuilder, ProducerConfigBuilder};
pub use rdkafka_client::KafkaConsumerClient;
pub use types::{ConsumerRecord, PartitionState, RebalanceEvent, Subscription, TopicPartition};
