//! Firestore REST access layer and idempotent coupon ledger.
//!
//! This crate provides:
//! - Service account loading and JWT-bearer access tokens with single-flight refresh
//! - A `FieldValue` model and codec for Firestore's typed wire values
//! - A REST client implementing the `DocumentStore` trait (get/write/update/query/commit)
//! - Server-side increments with a read-modify-write fallback
//! - Hash-keyed idempotency guards committed atomically with their mutation
//! - The coupon usage ledger with its affiliate audit trail

pub mod client;
pub mod codec;
pub mod coupon_ledger;
pub mod credentials;
pub mod error;
pub mod field_path;
pub mod guard;
pub mod metrics;
pub mod retry;
pub mod store;
pub mod token_cache;
pub mod transform;
pub mod types;
pub mod value;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use client::{FirestoreClient, FirestoreConfig};
pub use codec::{decode, encode, encode_with, StringPolicy};
pub use coupon_ledger::{CouponLedger, LedgerConfig};
pub use credentials::ServiceAccountCredential;
pub use error::{FirestoreError, FirestoreResult};
pub use field_path::FieldPath;
pub use guard::{guard_key, GuardOutcome, GuardScope, IdempotencyGuard, GUARDS_SUBCOLLECTION};
pub use retry::RetryConfig;
pub use store::{
    CommitResult, Delta, Direction, DocumentQuery, DocumentStore, FieldTransform, FieldUpdate,
    FilterOp, QueryFilter, StoredDocument, WriteOp,
};
pub use token_cache::{AccessToken, StaticToken, TokenManager, TokenSource};
pub use transform::{FallbackPolicy, FieldIncrementer, IncrementOutcome};
pub use value::{FieldValue, Fields, FieldsExt};
