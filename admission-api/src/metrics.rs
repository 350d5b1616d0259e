use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::Response,
};
use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

const HTTP_REQUESTS_COUNTER: &str = "http_requests_total";
const HTTP_DURATION_HISTOGRAM: &str = "http_requests_duration_seconds";

/// Admission and wait latencies sit well under a second; `/wait` is capped by `MAX_WAIT_MS`.
const LATENCY_BUCKETS_SECONDS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

pub fn setup_metrics_recorder() -> eyre::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .set_buckets(LATENCY_BUCKETS_SECONDS)?
        .install_recorder()?;
    Ok(handle)
}

/// Counts and times every request by route template, so per-namespace paths share a series.
pub async fn track_metrics(req: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_owned())
        .unwrap_or_else(|| req.uri().path().to_owned());
    let method = req.method().to_string();

    let response = next.run(req).await;

    let labels = [
        ("method", method),
        ("path", route),
        ("status", response.status().as_u16().to_string()),
    ];
    counter!(HTTP_REQUESTS_COUNTER, &labels).increment(1);
    histogram!(HTTP_DURATION_HISTOGRAM, &labels).record(start.elapsed().as_secs_f64());

    response
}
