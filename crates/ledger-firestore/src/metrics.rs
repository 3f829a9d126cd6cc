//! Firestore and ledger metrics collection.
//!
//! Provides standardized metrics for monitoring:
//! - Request counters and latency by operation and status
//! - Read retries
//! - Token refreshes
//! - Non-atomic transform fallbacks and unguarded applies (possible drift)

use metrics::{counter, histogram};

// =============================================================================
// Metric Names
// =============================================================================

/// Metric name constants for consistency.
pub mod names {
    /// Total Firestore requests by operation and status.
    pub const REQUESTS_TOTAL: &str = "firestore_requests_total";

    /// Total retry attempts by operation.
    pub const RETRIES_TOTAL: &str = "firestore_retries_total";

    /// Request latency in seconds by operation.
    pub const LATENCY_SECONDS: &str = "firestore_latency_seconds";

    /// Access token refreshes by outcome.
    pub const TOKEN_REFRESHES_TOTAL: &str = "firestore_token_refreshes_total";

    /// Increments that fell back to read-modify-write, by collection.
    pub const TRANSFORM_FALLBACK_TOTAL: &str = "ledger_transform_fallback_total";

    /// Duplicate applications rejected by an existing guard.
    pub const GUARD_CONFLICTS_TOTAL: &str = "ledger_guard_conflicts_total";

    /// Mutations applied whose guard could not be written.
    pub const UNGUARDED_APPLY_TOTAL: &str = "ledger_unguarded_apply_total";

    /// Coupon applications by outcome.
    pub const COUPON_APPLIES_TOTAL: &str = "ledger_coupon_applies_total";
}

// =============================================================================
// Recording Functions
// =============================================================================

/// Record metrics for a completed Firestore request.
pub fn record_request(operation: &str, status: u16, latency_ms: f64) {
    let status_str = status.to_string();

    counter!(
        names::REQUESTS_TOTAL,
        "operation" => operation.to_string(),
        "status" => status_str
    )
    .increment(1);

    histogram!(
        names::LATENCY_SECONDS,
        "operation" => operation.to_string()
    )
    .record(latency_ms / 1000.0);
}

/// Record a retry attempt.
pub fn record_retry(operation: &str) {
    counter!(
        names::RETRIES_TOTAL,
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record an access token refresh.
pub fn record_token_refresh(outcome: &'static str) {
    counter!(names::TOKEN_REFRESHES_TOTAL, "outcome" => outcome).increment(1);
}

/// Record a non-atomic increment fallback.
pub fn record_transform_fallback(collection: &str) {
    counter!(
        names::TRANSFORM_FALLBACK_TOTAL,
        "collection" => collection.to_string()
    )
    .increment(1);
}

/// Record a duplicate application caught by a guard.
pub fn record_guard_conflict() {
    counter!(names::GUARD_CONFLICTS_TOTAL).increment(1);
}

/// Record a mutation applied without its guard.
pub fn record_unguarded_apply() {
    counter!(names::UNGUARDED_APPLY_TOTAL).increment(1);
}

/// Record a coupon application outcome.
pub fn record_coupon_apply(outcome: &'static str) {
    counter!(names::COUPON_APPLIES_TOTAL, "outcome" => outcome).increment(1);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names() {
        assert!(names::REQUESTS_TOTAL.contains("requests"));
        assert!(names::RETRIES_TOTAL.contains("retries"));
        assert!(names::LATENCY_SECONDS.contains("latency"));
        assert!(names::TRANSFORM_FALLBACK_TOTAL.starts_with("ledger_"));
    }
}
