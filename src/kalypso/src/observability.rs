//! Prometheus exposition of the inference metrics the dispatcher records.

use axum::{routing::get, Router};
use dispatcher::observability::{INFERENCE_DURATION, LATENCY_BUCKETS};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use std::io;
use tokio::net::TcpListener;

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(INFERENCE_DURATION.to_string()), &LATENCY_BUCKETS)
}

/// Install the process wide recorder. Fails if one is already installed.
pub fn install() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// `GET /metrics` in the Prometheus text format.
pub fn router(handle: PrometheusHandle) -> Router {
    Router::new().route("/metrics", get(move || async move { handle.render() }))
}

/// Serve the metrics endpoint until the listener fails.
pub async fn serve(listener: TcpListener, handle: PrometheusHandle) -> io::Result<()> {
    log::info!("Metrics service listening on {}", listener.local_addr()?);
    axum::serve(listener, router(handle)).await
}
