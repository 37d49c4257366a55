use anyhow::Result;
use axum::http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode};
use axum::{extract::Extension, routing::get, AddExtensionLayer, Json, Router};
use futures::prelude::*;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::get_metrics_recorder;
use hadron_batch::batch::{ManagerStatus, StatusHandle};
use hadron_batch::config::Config;

/// Spawns the metrics & status server.
///
/// Metrics are served from the global prometheus registry, and the batch manager status is
/// served from the given handle.
pub fn spawn_server(config: &Config, status: StatusHandle, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<Result<()>> {
    let prom = get_metrics_recorder(config).handle();
    let app = Router::new()
        .route("/metrics", get(prometheus_scrape))
        .route("/status", get(batch_status))
        .layer(AddExtensionLayer::new(prom))
        .layer(AddExtensionLayer::new(status));
    let server = axum::Server::bind(&([0, 0, 0, 0], config.metrics_port).into())
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move {
            let _res = shutdown.recv().await;
        });
    tracing::info!("metrics & status server is listening at 0.0.0.0:{}", config.metrics_port);
    tokio::spawn(server.map_err(anyhow::Error::from))
}

/// Handle Prometheus metrics scraping.
async fn prometheus_scrape(Extension(state): Extension<PrometheusHandle>) -> (StatusCode, HeaderMap, String) {
    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static("content-type"), HeaderValue::from_static("text/plain; version=0.0.4"));
    (StatusCode::OK, headers, state.render())
}

/// Handle batch manager status requests.
async fn batch_status(Extension(status): Extension<StatusHandle>) -> Json<ManagerStatus> {
    Json(status.status())
}
