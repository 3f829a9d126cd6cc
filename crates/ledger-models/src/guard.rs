//! Idempotency guard records.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// How a guarded mutation reached the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ApplyPath {
    /// Counters and guard were committed together in one atomic commit.
    Atomic,
    /// Counters were updated by read-modify-write after the commit failed;
    /// the guard was written afterwards.
    Fallback,
    /// Counters were updated by read-modify-write but the guard write failed.
    /// Needs external reconciliation.
    FallbackUnguarded,
}

impl ApplyPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Atomic => "atomic",
            Self::Fallback => "fallback",
            Self::FallbackUnguarded => "fallback_unguarded",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "atomic" => Some(Self::Atomic),
            "fallback" => Some(Self::Fallback),
            "fallback_unguarded" => Some(Self::FallbackUnguarded),
            _ => None,
        }
    }

    /// True if the counters were mutated without the server-side transform.
    pub fn is_fallback(&self) -> bool {
        !matches!(self, Self::Atomic)
    }
}

/// Marker proving a guarded operation already executed for a key.
///
/// Append-only: created at most once per key and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GuardRecord {
    /// Hash of `transaction_key + "|" + subject_id`; also the document id
    pub key: String,
    /// Owning document path, e.g. `orders/order-42`
    pub scope: String,
    /// What was applied (coupon code, field path, ...)
    pub subject_id: String,
    /// Caller-supplied idempotency key (payment id, webhook event id, ...)
    pub transaction_key: String,
    pub applied_at: DateTime<Utc>,
    pub apply_path: ApplyPath,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_path_roundtrip() {
        for path in [ApplyPath::Atomic, ApplyPath::Fallback, ApplyPath::FallbackUnguarded] {
            assert_eq!(ApplyPath::from_str(path.as_str()), Some(path));
        }
        assert_eq!(ApplyPath::from_str("unknown"), None);
    }

    #[test]
    fn test_apply_path_is_fallback() {
        assert!(!ApplyPath::Atomic.is_fallback());
        assert!(ApplyPath::Fallback.is_fallback());
        assert!(ApplyPath::FallbackUnguarded.is_fallback());
    }
}
