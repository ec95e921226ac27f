//! Kafka consumer and producer connector.
//!
//! A single coordinator thread owns the consumer client and serves every other
//! component through request/reply messages. On top of it the partitioned
//! stream engine hands out one backpressured stream per assigned partition,
//! the commit aggregator batches offset commits, and the producer flow publishes
//! records in order with bounded parallelism.
//!
//! ## Error logging
//!
//! Log errors with `{e:#}` or `error = ?e` so the whole cause chain is visible,
//! and add context with `.context()` rather than formatting the source into a
//! new message.

pub mod commit;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod kafka;
pub mod metrics_const;
pub mod metrics_server;
pub mod producer;
pub mod service;
pub mod test_utils;

pub use commit::{CommittableOffset, CommittableOffsetBatch, Committer};
pub use coordinator::CoordinatorHandle;
pub use engine::{CommittableRecord, PartitionSource, PartitionedStreamEngine};
pub use error::{ConnectorError, ConnectorResult};
pub use kafka::types::{ConsumerRecord, Subscription, TopicPartition};
pub use producer::{Envelope, ProducerFlow, ProducerRecord, ProducerResult};
