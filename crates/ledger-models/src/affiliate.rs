//! Affiliate commission audit trail.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One affiliate commission credited for a coupon used on an order.
///
/// Stored under the same idempotency key as the order's guard document, so
/// at most one entry exists per (order, coupon code, transaction key).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AffiliateUsageEntry {
    pub order_id: String,
    pub coupon_code: String,
    pub affiliate_code: String,
    /// Order amount the coupon was applied to
    pub amount: f64,
    /// Commission credited to the affiliate
    pub commission: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_email: Option<String>,
    pub created_at: DateTime<Utc>,
}
