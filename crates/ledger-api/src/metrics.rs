//! Prometheus metrics for the API server.

use std::sync::LazyLock;
use std::time::Instant;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::middleware::Next;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use regex_lite::Regex;

/// Initialize the Prometheus metrics recorder.
/// Returns a handle that can be used to render metrics.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Metric names as constants for consistency.
pub mod names {
    pub const HTTP_REQUESTS_TOTAL: &str = "ledger_http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "ledger_http_request_duration_seconds";
    pub const HTTP_REQUESTS_IN_FLIGHT: &str = "ledger_http_requests_in_flight";

    pub const RATE_LIMIT_HITS_TOTAL: &str = "ledger_rate_limit_hits_total";
    pub const AUTH_FAILURES_TOTAL: &str = "ledger_auth_failures_total";
    pub const COUNTER_INCREMENTS_TOTAL: &str = "ledger_counter_increments_total";
}

// Path segments that name a coupon or affiliate code
static CODE_SEGMENT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"/(coupons|affiliates)/[^/]+").ok());

/// Record an HTTP request.
pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    let labels = [
        ("method", method.to_string()),
        ("path", sanitize_path(path)),
        ("status", status.to_string()),
    ];

    counter!(names::HTTP_REQUESTS_TOTAL, &labels).increment(1);
    histogram!(names::HTTP_REQUEST_DURATION_SECONDS, &labels).record(duration_secs);
}

/// Record rate limit hit.
pub fn record_rate_limit_hit(endpoint: &str) {
    let labels = [("endpoint", sanitize_path(endpoint))];
    counter!(names::RATE_LIMIT_HITS_TOTAL, &labels).increment(1);
}

/// Record a rejected service token.
pub fn record_auth_failure() {
    counter!(names::AUTH_FAILURES_TOTAL).increment(1);
}

/// Record a guarded counter increment by outcome.
pub fn record_counter_increment(outcome: &'static str) {
    counter!(names::COUNTER_INCREMENTS_TOTAL, "outcome" => outcome).increment(1);
}

/// Collapse codes in paths so label cardinality stays bounded.
fn sanitize_path(path: &str) -> String {
    let Some(re) = CODE_SEGMENT.as_ref() else {
        return path.to_string();
    };
    re.replace_all(path, |caps: &regex_lite::Captures<'_>| {
        match &caps[1] {
            // Literal sub-routes under /coupons
            "coupons" if matches!(&caps[0], "/coupons/apply" | "/coupons/apply-batch") => {
                caps[0].to_string()
            }
            kind => format!("/{}/:code", kind),
        }
    })
    .into_owned()
}

/// Metrics middleware for HTTP requests.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).increment(1.0);

    let response = next.run(request).await;

    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).decrement(1.0);

    let status = response.status().as_u16();
    let duration = start.elapsed().as_secs_f64();

    record_http_request(&method, &path, status, duration);

    response
}
