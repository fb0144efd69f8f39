//! Prometheus metrics for the gateway.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides an axum middleware for HTTP RED
//! metrics, and exposes the `/metrics` endpoint handler.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

use crate::wire::op;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "storegate_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "storegate_http_request_duration_seconds";

/// Total RPC operations (counter). Labels: operation, code.
pub const RPC_OPERATIONS_TOTAL: &str = "storegate_rpc_operations_total";

/// Total bytes received in `SaveFile` bodies (counter).
pub const BYTES_RECEIVED_TOTAL: &str = "storegate_bytes_received_total";

/// Total bytes sent in `GetFile` bodies (counter).
pub const BYTES_SENT_TOTAL: &str = "storegate_bytes_sent_total";

const KNOWN_OPERATIONS: &[&str] = &[
    op::SAVE_FILE,
    op::GET_FILE,
    op::DELETE,
    op::EXIST,
    op::LIST,
    op::IS_PUBLIC,
    op::GET_DOWNLOAD_URL,
    op::GET_SIGNED_URL,
    op::GET_ACCESS_TOKEN,
];

// -- Global recorder installation ---------------------------------------------

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent, so tests
/// may call it repeatedly.
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder")
    })
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(RPC_OPERATIONS_TOTAL, "Total RPC operations by outcome");
    describe_counter!(BYTES_RECEIVED_TOTAL, "Total object bytes received");
    describe_counter!(BYTES_SENT_TOTAL, "Total object bytes sent");
}

/// Count one finished RPC.  `code` is `OK` or the error class code.
pub fn record_operation(operation: &'static str, code: &'static str) {
    counter!(RPC_OPERATIONS_TOTAL, "operation" => operation, "code" => code).increment(1);
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware that records HTTP RED metrics for every request.
///
/// Excludes `/metrics` from self-instrumentation.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }

    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

// -- Path normalization -------------------------------------------------------

/// Map a request path to a bounded label value.
///
/// - `/health` -> `/health`
/// - `/rpc/GetFile` -> `/rpc/GetFile`
/// - `/rpc/Whatever` -> `/rpc/{unknown}`
/// - anything else -> `/{other}`
fn normalize_path(path: &str) -> String {
    match path {
        "/health" | "/metrics" => path.to_string(),
        _ => match path.strip_prefix("/rpc/") {
            Some(name) if KNOWN_OPERATIONS.contains(&name) => path.to_string(),
            Some(_) => "/rpc/{unknown}".to_string(),
            None => "/{other}".to_string(),
        },
    }
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics`: Prometheus exposition format text.
pub async fn metrics_handler() -> Response {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

// -- Tests --------------------------------------------------------------------
