//! Prometheus exporter for live run metrics.
//!
//! `MetricsAggregator` records through the `metrics` facade macros; this
//! module owns the metric names, the histogram buckets and the HTTP server
//! that renders them on `/metrics`. Without an installed recorder the
//! macros are no-ops, so library users and tests pay nothing.

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const TOTAL_WORKERS: &str = "stomp_load_test_total_workers";
pub const MESSAGES_SENT: &str = "stomp_load_test_messages_sent_total";
pub const MESSAGES_RECEIVED: &str = "stomp_load_test_messages_received_total";
pub const ERRORS: &str = "stomp_load_test_errors_total";
pub const SUCCESS: &str = "stomp_load_test_success_total";
pub const LOST: &str = "stomp_load_test_lost_total";
pub const CONNECTION_RETRIES: &str = "stomp_load_test_connection_retries_total";
pub const FAILED_RECONNECTIONS: &str = "stomp_load_test_failed_reconnections_total";
pub const SUCCESSFUL_RECONNECTIONS: &str = "stomp_load_test_successful_reconnections_total";

pub const ACTIVE_CONNECTIONS: &str = "stomp_load_test_active_connections";
pub const SESSIONS_BY_TIER: &str = "stomp_load_test_sessions_by_tier";
pub const CURRENT_STAGE: &str = "stomp_load_test_current_stage";
pub const ACTIVE_RECONNECTIONS: &str = "stomp_load_test_active_reconnections";

pub const MESSAGE_LATENCY_MS: &str = "stomp_load_test_message_latency_ms";
pub const WEBSOCKET_CONNECT_MS: &str = "stomp_load_test_websocket_connect_ms";
pub const STOMP_CONNECT_MS: &str = "stomp_load_test_stomp_connect_ms";
pub const RECONNECTION_TIME_MS: &str = "stomp_load_test_reconnection_time_ms";

pub const DEFAULT_PORT: u16 = 2112;

/// Bucket upper bounds (milliseconds) for every histogram.
const HISTOGRAM_BUCKETS: [(&str, &[f64]); 4] = [
    (
        MESSAGE_LATENCY_MS,
        &[10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0],
    ),
    (WEBSOCKET_CONNECT_MS, &[50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0]),
    (STOMP_CONNECT_MS, &[10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0]),
    (
        RECONNECTION_TIME_MS,
        &[100.0, 500.0, 1000.0, 2000.0, 5000.0, 10000.0, 30000.0],
    ),
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    let mut builder = PrometheusBuilder::new();
    for (name, buckets) in HISTOGRAM_BUCKETS {
        builder = builder.set_buckets_for_metric(Matcher::Full(name.to_string()), buckets)?;
    }
    Ok(builder)
}

/// Recorder with the run's histogram buckets, not installed anywhere.
pub fn build_recorder() -> Result<PrometheusRecorder, BuildError> {
    Ok(builder()?.build_recorder())
}

/// Install the recorder process-wide. Fails if one is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Serve `/metrics` on an already bound listener until `cancel` fires.
pub async fn serve_metrics(
    handle: PrometheusHandle,
    listener: TcpListener,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let app = axum::Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    );
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
}

/// Bind `addr` and serve in the background. Returns the bound address so
/// port 0 can be used.
pub async fn spawn_metrics_server(
    handle: PrometheusHandle,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> std::io::Result<(SocketAddr, JoinHandle<std::io::Result<()>>)> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    info!(addr = %local, "serving Prometheus metrics on /metrics");
    let task = tokio::spawn(serve_metrics(handle, listener, cancel));
    Ok((local, task))
}
