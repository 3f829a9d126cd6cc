//! Shared data models for the coupon usage ledger.
//!
//! This crate provides Serde-serializable types for:
//! - Coupon records and eligibility results
//! - Affiliate commission audit entries
//! - Idempotency guard records
//! - Ledger request/result values

pub mod affiliate;
pub mod coupon;
pub mod guard;
pub mod ledger;

// Re-export common types
pub use affiliate::AffiliateUsageEntry;
pub use coupon::{normalize_code, CouponEligibility, CouponRecord, EligibilityError};
pub use guard::{ApplyPath, GuardRecord};
pub use ledger::{
    ApplyCouponResult, BatchApplyResult, BatchCouponInput, BatchItemResult, LedgerErrorCode,
    OrderMeta,
};
