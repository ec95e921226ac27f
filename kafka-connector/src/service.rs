use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::commit::CommittableOffset;
use crate::config::Config;
use crate::engine::{CommittableRecord, PartitionSource, PartitionedStreamEngine};
use crate::error::ConnectorResult;
use crate::kafka::client::ConsumerClient;
use crate::kafka::types::Subscription;
use crate::metrics_server::ServiceHealth;
use crate::producer::{Envelope, ProducerClient, ProducerFlow, ProducerRecord};

/// Consumes the configured topics partition by partition. Every record is
/// republished to the output topic when one is configured, and its offset is
/// committed once that succeeded.
pub struct ConnectorService<C: ConsumerClient, P: ProducerClient> {
    config: Config,
    consumer: C,
    producer: Option<ProducerFlow<P>>,
    health: ServiceHealth,
}

impl<C: ConsumerClient, P: ProducerClient> ConnectorService<C, P> {
    pub fn new(config: Config, consumer: C, producer: Option<Arc<P>>) -> Self {
        let producer = producer.map(|client| ProducerFlow::new(client, config.producer_settings()));
        Self {
            config,
            consumer,
            producer,
            health: ServiceHealth::default(),
        }
    }

    /// Report readiness through `health` while the connector is consuming
    pub fn with_health(mut self, health: ServiceHealth) -> Self {
        self.health = health;
        self
    }

    fn subscription(&self) -> Subscription {
        Subscription::topics(
            self.config
                .kafka_consumer_topic
                .split(',')
                .map(str::trim)
                .filter(|topic| !topic.is_empty()),
        )
    }

    /// Run until ctrl+c
    pub async fn run(self) -> Result<()> {
        self.run_with_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for ctrl+c signal: {e:#}");
            }
        })
        .await
    }

    /// Run until `shutdown_signal` resolves or the consumer fails
    pub async fn run_with_shutdown(self, shutdown_signal: impl Future<Output = ()>) -> Result<()> {
        let subscription = self.subscription();
        let output_topic = self.config.output_topic.clone();
        info!(
            "Starting connector for {:?}, publishing to {:?}",
            subscription, output_topic
        );

        let mut engine = PartitionedStreamEngine::start(
            self.consumer,
            subscription,
            self.config.consumer_settings(),
            self.config.committer_settings(),
            None,
        )
        .await
        .with_context(|| {
            format!(
                "Failed to subscribe to '{}' with group '{}'",
                self.config.kafka_consumer_topic, self.config.kafka_consumer_group
            )
        })?;

        self.health.set_ready(true);
        let mut partitions = JoinSet::new();
        tokio::pin!(shutdown_signal);

        loop {
            tokio::select! {
                _ = &mut shutdown_signal => {
                    info!("Received shutdown signal, shutting down gracefully...");
                    break;
                }
                source = engine.next_partition() => match source {
                    Some(source) => {
                        let producer = self.producer.clone();
                        let output_topic = output_topic.clone();
                        partitions.spawn(async move {
                            match (producer, output_topic) {
                                (Some(producer), Some(topic)) => {
                                    republish(source, producer, topic).await
                                }
                                _ => consume(source).await,
                            }
                        });
                    }
                    None => {
                        warn!("No more partition streams, stopping");
                        break;
                    }
                },
                Some(finished) = partitions.join_next(), if !partitions.is_empty() => {
                    match finished {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => error!("Partition stream failed: {e:#}"),
                        Err(e) => error!("Partition task panicked: {e:#}"),
                    }
                }
            }
        }

        self.health.set_ready(false);
        let failure = engine.failure();
        let stopped = engine.shutdown().await;
        while let Some(finished) = partitions.join_next().await {
            if let Ok(Err(e)) = finished {
                warn!("Partition stream ended with error during shutdown: {e:#}");
            }
        }

        if let Some(failure) = failure {
            return Err(failure).context("Consumer failed");
        }
        stopped.context("Consumer did not shut down cleanly")?;
        info!("Connector stopped");
        Ok(())
    }
}

/// Commit each record as soon as it was seen
async fn consume(mut source: PartitionSource) -> ConnectorResult<()> {
    while let Some(record) = source.next().await {
        record?.into_offset().submit();
    }
    Ok(())
}

async fn republish<P: ProducerClient>(
    source: PartitionSource,
    producer: ProducerFlow<P>,
    topic: String,
) -> ConnectorResult<()> {
    let committer = source.committer().clone();
    let envelopes = source
        .take_while(|record| {
            if let Err(e) = record {
                error!("Partition stream failed, not publishing further records: {e:#}");
            }
            futures::future::ready(record.is_ok())
        })
        .filter_map(move |record| {
            let envelope = record.ok().map(|record| to_envelope(&topic, record));
            futures::future::ready(envelope)
        });
    producer.committable_sink(envelopes, &committer).await
}

fn to_envelope(topic: &str, record: CommittableRecord) -> Envelope<CommittableOffset> {
    let (record, offset) = record.into_parts();
    let out = ProducerRecord {
        topic: topic.to_string(),
        partition: None,
        key: record.key().cloned(),
        value: record.value().cloned(),
        headers: record.headers().to_vec(),
        timestamp: record.timestamp(),
    };
    Envelope::single(out, offset)
}
