//! Prometheus accounting for the gateway's public API.
//!
//! Requests are labeled by the OGC operation they address instead of the
//! raw path: job and process ids are high-cardinality, and a per-id label
//! set would drown the exporter. Anything that is not one of the known
//! operations (probes, the metrics route itself, typos) lands in `other`.

use std::time::Instant;

use axum::body::Body;
use axum::http::{Method, Request};
use axum::middleware::Next;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

// Execute calls block on the upstream forward (with retries), so the tail
// stretches far beyond typical API latencies.
const DURATION_BUCKETS: &[f64] = &[0.025, 0.1, 0.5, 2.0, 10.0, 30.0, 120.0];

pub fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("gateway_api_request_duration_seconds".to_owned()),
            DURATION_BUCKETS,
        )
        .expect("no duration buckets configured")
        .install_recorder()
        .expect("failed to install the prometheus recorder")
}

/// The OGC operation a request addresses, derived from the method and path
/// with the version mount stripped.
fn operation_label(method: &Method, path: &str) -> &'static str {
    let segments: Vec<&str> = path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect();
    let segments = match segments.split_first() {
        Some((mount, rest))
            if mount.starts_with('v') && mount[1..].starts_with(|c: char| c.is_ascii_digit()) =>
        {
            rest
        }
        _ => &segments[..],
    };

    match segments {
        ["processes"] if *method == Method::GET => "list-processes",
        ["processes", _] if *method == Method::GET => "describe-process",
        ["processes", _, "execution"] if *method == Method::POST => "execute-process",
        ["jobs"] if *method == Method::GET => "list-jobs",
        ["jobs", _] if *method == Method::GET => "job-status",
        ["jobs", _] if *method == Method::DELETE => "dismiss-job",
        ["jobs", _, "results"] if *method == Method::GET => "job-results",
        _ => "other",
    }
}

/// Middleware recording one counter increment and one duration sample per
/// request, labeled by operation and status class.
pub async fn record_api_request(req: Request<Body>, next: Next) -> impl IntoResponse {
    let operation = operation_label(req.method(), req.uri().path());
    let timer = Instant::now();

    let response = next.run(req).await;

    let class = match response.status().as_u16() / 100 {
        1 => "1xx",
        2 => "2xx",
        3 => "3xx",
        4 => "4xx",
        _ => "5xx",
    };
    metrics::counter!(
        "gateway_api_requests_total",
        "operation" => operation,
        "class" => class
    )
    .increment(1);
    metrics::histogram!(
        "gateway_api_request_duration_seconds",
        "operation" => operation
    )
    .record(timer.elapsed().as_secs_f64());

    response
}
