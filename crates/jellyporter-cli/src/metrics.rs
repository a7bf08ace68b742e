use anyhow::{anyhow, Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use metrics::gauge;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

const METRIC_VERSION: &str = "jellyporter_version";
const METRIC_HEARTBEAT: &str = "jellyporter_heartbeat_timestamp";

const DUMP_FILE_NAME: &str = "jellyporter.prom";

/// Install the process-wide Prometheus recorder. Every `metrics` macro in
/// any crate records into the returned handle from here on.
pub fn install_recorder() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow!("could not install metrics recorder: {e}"))
}

pub fn record_startup() {
    gauge!(METRIC_VERSION, "version" => env!("CARGO_PKG_VERSION")).set(1.0);
    touch_heartbeat();
}

fn touch_heartbeat() {
    gauge!(METRIC_HEARTBEAT).set(Utc::now().timestamp() as f64);
}

/// Serve the Prometheus text endpoint until cancellation, touching the
/// heartbeat gauge once a minute.
pub async fn serve(
    addr: String,
    handle: PrometheusHandle,
    shutdown: CancellationToken,
) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(render_metrics))
        .with_state(handle);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("can not start metrics server on {addr}"))?;

    info!(address = %addr, "Starting metrics server");

    let heartbeat = async {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            touch_heartbeat();
        }
    };

    let server = async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("Stopping metrics server");
            })
            .await
    };

    // The heartbeat loop never completes; the select ends with the server.
    tokio::select! {
        result = server => result.context("metrics server failed"),
        _ = heartbeat => unreachable!("heartbeat loop ended"),
    }
}

async fn render_metrics(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        handle.render(),
    )
}

/// One-shot mode: dump the current metric families in Prometheus text format
/// under `dir`.
pub fn write_metrics(dir: &Path, handle: &PrometheusHandle) -> Result<()> {
    let path = dir.join(DUMP_FILE_NAME);
    info!(path = %path.display(), "Dumping metrics");
    std::fs::write(&path, handle.render())
        .with_context(|| format!("could not write metrics to {}", path.display()))
}
