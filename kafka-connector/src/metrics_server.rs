use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{MatchedPath, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::IntoResponse,
    routing::get,
    Router,
};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

use crate::metrics_const::{
    COMMIT_BATCH_SIZE_HISTOGRAM, COMMIT_DURATION_HISTOGRAM, COORDINATOR_REQUEST_DURATION_HISTOGRAM,
    POLL_RECORDS_HISTOGRAM, PRODUCER_SEND_DURATION_HISTOGRAM, REVOKE_DURATION_HISTOGRAM,
};

const ADMIN_REQUESTS_COUNTER: &str = "connector_admin_requests_total";
const ADMIN_REQUEST_DURATION_HISTOGRAM: &str = "connector_admin_request_duration_seconds";

/// Coordinator round trips and broker commits, from sub-millisecond up to a stuck broker
const LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Revocation waits for in-flight commits and the drain timeout
const REVOKE_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

/// Counts of records per poll or partitions per commit batch
const COUNT_BUCKETS: &[f64] = &[0.0, 1.0, 5.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0];

/// Whether the connector is currently consuming. Readiness reports 503 until
/// the service marks it ready and again once the service stops.
#[derive(Clone, Default)]
pub struct ServiceHealth {
    ready: Arc<AtomicBool>,
}

impl ServiceHealth {
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

/// Bind a listener on `bind` and serve `router` until the task is aborted
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Index, health and prometheus routes of the connector. Installs the global
/// recorder, so it may only be called once per process.
pub fn admin_router(health: ServiceHealth) -> Result<Router> {
    let recorder_handle = setup_metrics_recorder()?;

    Ok(Router::new()
        .route("/", get(index))
        .route("/_readiness", get(readiness))
        .route("/_liveness", get(|| std::future::ready("ok")))
        .with_state(health)
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_metrics)))
}

async fn index() -> &'static str {
    "kafka connector"
}

async fn readiness(State(health): State<ServiceHealth>) -> (StatusCode, &'static str) {
    if health.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not consuming")
    }
}

fn connector_buckets() -> [(&'static str, &'static [f64]); 6] {
    [
        (COORDINATOR_REQUEST_DURATION_HISTOGRAM, LATENCY_BUCKETS),
        (COMMIT_DURATION_HISTOGRAM, LATENCY_BUCKETS),
        (PRODUCER_SEND_DURATION_HISTOGRAM, LATENCY_BUCKETS),
        (REVOKE_DURATION_HISTOGRAM, REVOKE_BUCKETS),
        (POLL_RECORDS_HISTOGRAM, COUNT_BUCKETS),
        (COMMIT_BATCH_SIZE_HISTOGRAM, COUNT_BUCKETS),
    ]
}

fn setup_metrics_recorder() -> Result<PrometheusHandle> {
    let mut builder = PrometheusBuilder::new()
        .set_buckets(LATENCY_BUCKETS)
        .context("Invalid default histogram buckets")?;
    for (name, buckets) in connector_buckets() {
        builder = builder
            .set_buckets_for_metric(Matcher::Full(name.to_string()), buckets)
            .with_context(|| format!("Invalid histogram buckets for {name}"))?;
    }

    builder
        .install_recorder()
        .context("Failed to install the prometheus recorder")
}

/// Only routed paths are used as labels, anything else is reported as "unmatched"
async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map_or("unmatched", |matched| matched.as_str())
        .to_owned();

    let response = next.run(req).await;

    let labels = [
        ("path", path),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!(ADMIN_REQUESTS_COUNTER, &labels).increment(1);
    metrics::histogram!(ADMIN_REQUEST_DURATION_HISTOGRAM, &labels)
        .record(start.elapsed().as_secs_f64());

    response
}
