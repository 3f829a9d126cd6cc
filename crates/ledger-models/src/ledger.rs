//! Coupon ledger request and result types.
//!
//! Expected business outcomes (coupon not found, already applied, bad input)
//! are carried in these result values rather than as errors.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Machine-readable failure reason for a coupon application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerErrorCode {
    /// No coupon with the normalized code exists
    CouponNotFound,
    /// Empty code, order id or transaction key
    InvalidInput,
    /// The database could not be reached or rejected the request
    StoreFailure,
}

impl LedgerErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CouponNotFound => "COUPON_NOT_FOUND",
            Self::InvalidInput => "INVALID_INPUT",
            Self::StoreFailure => "STORE_FAILURE",
        }
    }
}

/// Outcome of applying one coupon to one order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplyCouponResult {
    pub success: bool,
    /// True if the coupon had already been applied for this transaction key
    pub idempotent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coupon_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<LedgerErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApplyCouponResult {
    /// Freshly applied.
    pub fn applied(coupon_id: impl Into<String>) -> Self {
        Self {
            success: true,
            idempotent: false,
            coupon_id: Some(coupon_id.into()),
            error_code: None,
            error: None,
        }
    }

    /// Already applied earlier under the same transaction key.
    pub fn already_applied() -> Self {
        Self {
            success: true,
            idempotent: true,
            coupon_id: None,
            error_code: None,
            error: None,
        }
    }

    pub fn failed(code: LedgerErrorCode, error: impl Into<String>) -> Self {
        Self {
            success: false,
            idempotent: false,
            coupon_id: None,
            error_code: Some(code),
            error: Some(error.into()),
        }
    }
}

/// Order details recorded in the affiliate audit trail.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OrderMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_email: Option<String>,
}

/// One coupon in a batch application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BatchCouponInput {
    pub code: String,
    /// Overrides the coupon record's own affiliate flag when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_affiliate: Option<bool>,
}

impl BatchCouponInput {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            is_affiliate: None,
        }
    }
}

/// Per-code entry in a batch result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemResult {
    /// Normalized code
    pub code: String,
    #[serde(flatten)]
    pub result: ApplyCouponResult,
}

/// Outcome of applying several coupons to one order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BatchApplyResult {
    /// True if at least one code applied (freshly or idempotently)
    pub success: bool,
    pub success_count: usize,
    pub total_count: usize,
    pub results: Vec<BatchItemResult>,
}

impl BatchApplyResult {
    pub fn from_results(results: Vec<BatchItemResult>) -> Self {
        let success_count = results.iter().filter(|r| r.result.success).count();
        Self {
            success: success_count > 0,
            success_count,
            total_count: results.len(),
            results,
        }
    }

    /// True if some, but not all, codes applied.
    pub fn is_partial(&self) -> bool {
        self.success_count > 0 && self.success_count < self.total_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_result_counts() {
        let results = vec![
            BatchItemResult {
                code: "BAD".to_string(),
                result: ApplyCouponResult::failed(LedgerErrorCode::CouponNotFound, "not found"),
            },
            BatchItemResult {
                code: "SAVE10".to_string(),
                result: ApplyCouponResult::applied("SAVE10"),
            },
        ];
        let batch = BatchApplyResult::from_results(results);
        assert!(batch.success);
        assert!(batch.is_partial());
        assert_eq!(batch.success_count, 1);
        assert_eq!(batch.total_count, 2);
    }

    #[test]
    fn test_empty_batch_is_not_success() {
        let batch = BatchApplyResult::from_results(vec![]);
        assert!(!batch.success);
        assert!(!batch.is_partial());
    }

    #[test]
    fn test_item_result_flattens() {
        let item = BatchItemResult {
            code: "BAD".to_string(),
            result: ApplyCouponResult::failed(LedgerErrorCode::CouponNotFound, "Coupon BAD not found"),
        };
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["code"], "BAD");
        assert_eq!(json["success"], false);
        assert_eq!(json["errorCode"], "COUPON_NOT_FOUND");
        assert_eq!(json["error"], "Coupon BAD not found");
    }

    #[test]
    fn test_error_code_as_str_matches_serde() {
        for code in [
            LedgerErrorCode::CouponNotFound,
            LedgerErrorCode::InvalidInput,
            LedgerErrorCode::StoreFailure,
        ] {
            let json = serde_json::to_value(code).unwrap();
            assert_eq!(json, code.as_str());
        }
    }
}
