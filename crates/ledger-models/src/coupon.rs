//! Coupon records and eligibility checks.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Normalize a user-entered coupon code (trim + uppercase).
///
/// All lookups, guard keys and audit entries use the normalized form, so
/// `" save10 "` and `"SAVE10"` refer to the same coupon.
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// A coupon stored in the `coupons` collection.
///
/// Counters (`usage_count`, `payout_usage`) are only ever changed through
/// server-side increments once the record exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CouponRecord {
    /// Normalized coupon code
    pub code: String,

    /// Number of orders that used this coupon
    #[serde(default)]
    pub usage_count: i64,

    /// Accumulated payout units (commission amount for affiliate coupons, 1 per use otherwise)
    #[serde(default)]
    pub payout_usage: f64,

    /// Whether the coupon can currently be redeemed
    #[serde(default = "default_true")]
    pub is_active: bool,

    /// Whether uses of this coupon earn an affiliate commission
    #[serde(default)]
    pub is_affiliate: bool,

    /// Referring partner code (defaults to the coupon code itself)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affiliate_code: Option<String>,

    /// Minimum order amount required
    #[serde(default)]
    pub min_amount: f64,

    /// Maximum discount granted, if capped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_discount: Option<f64>,

    /// Expiry instant, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,

    /// Maximum number of uses (0 = unlimited)
    #[serde(default)]
    pub usage_limit: i64,

    /// When the coupon was created
    pub created_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl CouponRecord {
    /// Create a new active coupon with zeroed counters.
    pub fn new(code: &str) -> Self {
        Self {
            code: normalize_code(code),
            usage_count: 0,
            payout_usage: 0.0,
            is_active: true,
            is_affiliate: false,
            affiliate_code: None,
            min_amount: 0.0,
            max_discount: None,
            valid_until: None,
            usage_limit: 0,
            created_at: Utc::now(),
        }
    }

    /// Mark the coupon as an affiliate coupon owned by `affiliate_code`.
    pub fn with_affiliate(mut self, affiliate_code: impl Into<String>) -> Self {
        self.is_affiliate = true;
        self.affiliate_code = Some(affiliate_code.into());
        self
    }

    /// Set the usage limit.
    pub fn with_usage_limit(mut self, limit: i64) -> Self {
        self.usage_limit = limit;
        self
    }

    /// Set the expiry instant.
    pub fn with_valid_until(mut self, valid_until: DateTime<Utc>) -> Self {
        self.valid_until = Some(valid_until);
        self
    }

    /// Set the minimum order amount.
    pub fn with_min_amount(mut self, min_amount: f64) -> Self {
        self.min_amount = min_amount;
        self
    }

    /// Affiliate code credited for uses of this coupon.
    pub fn effective_affiliate_code(&self) -> &str {
        self.affiliate_code.as_deref().unwrap_or(&self.code)
    }

    /// Check whether this coupon can be redeemed for an order.
    ///
    /// Checks run in a fixed order and the first failure wins.
    pub fn check_eligibility(
        &self,
        order_amount: f64,
        now: DateTime<Utc>,
    ) -> Result<(), EligibilityError> {
        if !self.is_active {
            return Err(EligibilityError::Inactive);
        }
        if let Some(valid_until) = self.valid_until {
            if now >= valid_until {
                return Err(EligibilityError::Expired(valid_until));
            }
        }
        if self.usage_limit > 0 && self.usage_count >= self.usage_limit {
            return Err(EligibilityError::UsageLimitReached(self.usage_limit));
        }
        if order_amount < self.min_amount {
            return Err(EligibilityError::BelowMinimum(self.min_amount));
        }
        Ok(())
    }
}

/// Reasons a coupon cannot be redeemed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EligibilityError {
    #[error("Coupon is not active")]
    Inactive,

    #[error("Coupon expired at {0}")]
    Expired(DateTime<Utc>),

    #[error("Coupon usage limit of {0} reached")]
    UsageLimitReached(i64),

    #[error("Order amount is below the coupon minimum of {0}")]
    BelowMinimum(f64),
}

impl EligibilityError {
    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Inactive => "COUPON_INACTIVE",
            Self::Expired(_) => "COUPON_EXPIRED",
            Self::UsageLimitReached(_) => "COUPON_USAGE_LIMIT_REACHED",
            Self::BelowMinimum(_) => "ORDER_BELOW_MINIMUM",
        }
    }
}

/// Result of validating a coupon against an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CouponEligibility {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coupon_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_discount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CouponEligibility {
    pub fn eligible(coupon_id: impl Into<String>, max_discount: Option<f64>) -> Self {
        Self {
            valid: true,
            coupon_id: Some(coupon_id.into()),
            max_discount,
            error_code: None,
            error: None,
        }
    }

    pub fn rejected(code: &str, error: impl Into<String>) -> Self {
        Self {
            valid: false,
            coupon_id: None,
            max_discount: None,
            error_code: Some(code.to_string()),
            error: Some(error.into()),
        }
    }
}
