use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use kafka_connector::config::Config;
use kafka_connector::kafka::KafkaConsumerClient;
use kafka_connector::metrics_server::{admin_router, serve, ServiceHealth};
use kafka_connector::producer::KafkaProducerClient;
use kafka_connector::service::ConnectorService;

fn start_server(config: &Config, health: ServiceHealth) -> Result<JoinHandle<()>> {
    let router = admin_router(health)?;

    let bind = config.bind_address();

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("Failed to serve metrics on {bind}: {e:#}");
        }
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    info!("Starting Kafka connector");

    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables")?;
    info!("Configuration loaded: {:?}", config);

    let health = ServiceHealth::default();
    let server_handle = start_server(&config, health.clone())?;
    info!("Started metrics server on {}", config.bind_address());

    let consumer = KafkaConsumerClient::new(&config.consumer_client_config())
        .context("Failed to create Kafka consumer")?;

    let producer = match &config.output_topic {
        Some(topic) => {
            let client = KafkaProducerClient::new(
                &config.producer_client_config(),
                Duration::from_millis(config.request_timeout_ms),
            )
            .await
            .with_context(|| {
                format!("Failed to create Kafka producer for output topic '{topic}'")
            })?;
            Some(Arc::new(client))
        }
        None => None,
    };

    ConnectorService::new(config, consumer, producer)
        .with_health(health)
        .run()
        .await?;

    server_handle.abort();
    Ok(())
}
