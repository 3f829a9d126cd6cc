//! Atomic server-side increments with a read-modify-write fallback.
//!
//! Increments go out as a `:commit` with `transform` writes. When that commit
//! fails transiently and the fallback is enabled, the new values are computed
//! client-side and written with an `updateTime` precondition, retrying on
//! contention. Fallback writes also bump `transformFallbackCount` and set
//! `transformFallbackAt` on the document so drift can be audited.

use std::sync::Arc;

use chrono::Utc;
use ledger_models::ApplyPath;
use tracing::{debug, warn};

use crate::error::{FirestoreError, FirestoreResult};
use crate::field_path::FieldPath;
use crate::metrics::record_transform_fallback;
use crate::store::{Delta, DocumentStore, FieldTransform, FieldUpdate, WriteOp};
use crate::value::{FieldValue, FieldsExt};

/// Maximum read-modify-write attempts under contention.
pub const MAX_FALLBACK_ATTEMPTS: u32 = 5;

/// Audit marker: number of fallback writes applied to the document.
pub const FALLBACK_COUNT_FIELD: &str = "transformFallbackCount";

/// Audit marker: time of the last fallback write.
pub const FALLBACK_AT_FIELD: &str = "transformFallbackAt";

/// Whether a transient transform failure may degrade to read-modify-write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FallbackPolicy {
    #[default]
    Enabled,
    Disabled,
}

impl FallbackPolicy {
    /// `LEDGER_TRANSFORM_FALLBACK`, enabled unless set to a false value.
    pub fn from_env() -> Self {
        match std::env::var("LEDGER_TRANSFORM_FALLBACK")
            .map(|v| v.trim().to_ascii_lowercase())
            .as_deref()
        {
            Ok("false") | Ok("0") | Ok("no") | Ok("off") => Self::Disabled,
            _ => Self::Enabled,
        }
    }

    pub fn is_enabled(self) -> bool {
        self == Self::Enabled
    }
}

/// How an increment reached the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncrementOutcome {
    Atomic,
    Fallback,
}

impl IncrementOutcome {
    pub fn apply_path(self) -> ApplyPath {
        match self {
            Self::Atomic => ApplyPath::Atomic,
            Self::Fallback => ApplyPath::Fallback,
        }
    }
}

/// Applies numeric increments to documents.
#[derive(Clone)]
pub struct FieldIncrementer {
    store: Arc<dyn DocumentStore>,
    fallback: FallbackPolicy,
    max_attempts: u32,
}

impl FieldIncrementer {
    pub fn new(store: Arc<dyn DocumentStore>, fallback: FallbackPolicy) -> Self {
        Self {
            store,
            fallback,
            max_attempts: MAX_FALLBACK_ATTEMPTS,
        }
    }

    pub fn fallback_policy(&self) -> FallbackPolicy {
        self.fallback
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Increment a single field.
    pub async fn increment_field(
        &self,
        collection: &str,
        doc_id: &str,
        field_path: &str,
        delta: impl Into<Delta>,
    ) -> FirestoreResult<IncrementOutcome> {
        self.increment_fields(
            collection,
            doc_id,
            &[FieldTransform::increment(field_path, delta)],
        )
        .await
    }

    /// Increment several fields of one document in one atomic commit.
    pub async fn increment_fields(
        &self,
        collection: &str,
        doc_id: &str,
        transforms: &[FieldTransform],
    ) -> FirestoreResult<IncrementOutcome> {
        let write = WriteOp::transform(collection, doc_id, transforms.to_vec());

        match self.store.commit(std::slice::from_ref(&write)).await {
            Ok(_) => Ok(IncrementOutcome::Atomic),
            Err(e) if e.is_transient() && self.fallback.is_enabled() => {
                warn!(
                    collection = %collection,
                    doc_id = %doc_id,
                    error = %e,
                    "Atomic transform failed, falling back to read-modify-write"
                );
                self.read_modify_write(collection, doc_id, transforms).await?;
                Ok(IncrementOutcome::Fallback)
            }
            Err(e) => Err(e),
        }
    }

    /// Apply increments with optimistic locking on the document's update time.
    ///
    /// Retries on precondition failure up to `MAX_FALLBACK_ATTEMPTS`; other
    /// errors are returned as-is. The document must exist.
    pub async fn read_modify_write(
        &self,
        collection: &str,
        doc_id: &str,
        transforms: &[FieldTransform],
    ) -> FirestoreResult<()> {
        let paths = transforms
            .iter()
            .map(|t| FieldPath::parse(&t.field_path))
            .collect::<FirestoreResult<Vec<_>>>()?;

        for attempt in 1..=self.max_attempts {
            let doc = self
                .store
                .get_document(collection, doc_id)
                .await?
                .ok_or_else(|| FirestoreError::not_found(format!("{}/{}", collection, doc_id)))?;

            let update_time = doc.update_time.clone().ok_or_else(|| {
                FirestoreError::InvalidResponse(format!(
                    "{}/{} has no update time",
                    collection, doc_id
                ))
            })?;

            let mut updates: Vec<FieldUpdate> = transforms
                .iter()
                .zip(&paths)
                .map(|(t, path)| {
                    FieldUpdate::new(path.to_string(), t.delta.apply_to(path.get_in(&doc.fields)))
                })
                .collect();

            let fallback_count = doc.fields.get_i64(FALLBACK_COUNT_FIELD).unwrap_or(0);
            updates.push(FieldUpdate::new(
                FALLBACK_COUNT_FIELD,
                FieldValue::Int(fallback_count + 1),
            ));
            updates.push(FieldUpdate::new(
                FALLBACK_AT_FIELD,
                FieldValue::Timestamp(Utc::now()),
            ));

            match self
                .store
                .update_document_if_unchanged(collection, doc_id, &updates, &update_time)
                .await
            {
                Ok(_) => {
                    record_transform_fallback(collection);
                    return Ok(());
                }
                Err(e) if e.is_precondition_failed() => {
                    debug!(
                        collection = %collection,
                        doc_id = %doc_id,
                        attempt,
                        "Concurrent update during fallback, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Err(FirestoreError::AtomicTransform(format!(
            "{}/{}: gave up after {} read-modify-write attempts",
            collection, doc_id, self.max_attempts
        )))
    }

    /// Apply a batch of writes one by one, transforms via read-modify-write.
    ///
    /// Used when an atomic commit of the batch failed transiently and was
    /// confirmed not to have landed. Creates that hit an existing document are
    /// skipped since they are keyed by the same idempotency key.
    pub async fn apply_writes_fallback(&self, writes: &[WriteOp]) -> FirestoreResult<()> {
        for write in writes {
            match write {
                WriteOp::Transform {
                    collection,
                    id,
                    transforms,
                } => self.read_modify_write(collection, id, transforms).await?,
                other => match self.store.commit(std::slice::from_ref(other)).await {
                    Ok(_) => {}
                    Err(e) if e.is_already_exists() && matches!(other, WriteOp::Create { .. }) => {
                        debug!(path = %other.path(), "Fallback create already present, skipping");
                    }
                    Err(e) => return Err(e),
                },
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;
    use crate::value::Fields;
    use serial_test::serial;

    fn counter_doc(count: i64) -> Fields {
        let mut fields = Fields::new();
        fields.insert("usageCount".into(), FieldValue::Int(count));
        fields.insert("payoutUsage".into(), FieldValue::Double(0.0));
        fields
    }

    async fn seeded(count: i64) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .create_document("coupons", "SAVE10", &counter_doc(count))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_increment_is_atomic_by_default() {
        let store = seeded(5).await;
        let incrementer = FieldIncrementer::new(store.clone(), FallbackPolicy::Enabled);

        let outcome = incrementer
            .increment_field("coupons", "SAVE10", "usageCount", 1i64)
            .await
            .unwrap();

        assert_eq!(outcome, IncrementOutcome::Atomic);
        let doc = store.get_document("coupons", "SAVE10").await.unwrap().unwrap();
        assert_eq!(doc.fields["usageCount"], FieldValue::Int(6));
        assert!(!doc.fields.contains_key(FALLBACK_COUNT_FIELD));
    }

    #[tokio::test]
    async fn test_transient_failure_falls_back_and_marks_document() {
        let store = seeded(5).await;
        store.fail_next_commits(1);
        let incrementer = FieldIncrementer::new(store.clone(), FallbackPolicy::Enabled);

        let outcome = incrementer
            .increment_fields(
                "coupons",
                "SAVE10",
                &[
                    FieldTransform::increment("usageCount", 1i64),
                    FieldTransform::increment("payoutUsage", 12.5),
                ],
            )
            .await
            .unwrap();

        assert_eq!(outcome, IncrementOutcome::Fallback);
        assert_eq!(outcome.apply_path(), ApplyPath::Fallback);
        let doc = store.get_document("coupons", "SAVE10").await.unwrap().unwrap();
        assert_eq!(doc.fields["usageCount"], FieldValue::Int(6));
        assert_eq!(doc.fields["payoutUsage"], FieldValue::Double(12.5));
        assert_eq!(doc.fields[FALLBACK_COUNT_FIELD], FieldValue::Int(1));
        assert!(doc.fields.get_timestamp(FALLBACK_AT_FIELD).is_some());
    }

    #[tokio::test]
    async fn test_fallback_disabled_returns_error() {
        let store = seeded(5).await;
        store.fail_next_commits(1);
        let incrementer = FieldIncrementer::new(store.clone(), FallbackPolicy::Disabled);

        let err = incrementer
            .increment_field("coupons", "SAVE10", "usageCount", 1i64)
            .await
            .unwrap_err();

        assert!(err.is_transient());
        let doc = store.get_document("coupons", "SAVE10").await.unwrap().unwrap();
        assert_eq!(doc.fields["usageCount"], FieldValue::Int(5));
    }

    #[tokio::test]
    async fn test_missing_document_is_not_found_without_fallback() {
        let store = Arc::new(MemoryStore::new());
        let incrementer = FieldIncrementer::new(store.clone(), FallbackPolicy::Enabled);

        let err = incrementer
            .increment_field("coupons", "NOPE", "usageCount", 1i64)
            .await
            .unwrap_err();
        assert!(matches!(err, FirestoreError::NotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_converge() {
        let store = seeded(0).await;
        let incrementer = Arc::new(FieldIncrementer::new(store.clone(), FallbackPolicy::Enabled));

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let incrementer = incrementer.clone();
                tokio::spawn(async move {
                    incrementer
                        .increment_field("coupons", "SAVE10", "usageCount", 1i64)
                        .await
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let doc = store.get_document("coupons", "SAVE10").await.unwrap().unwrap();
        assert_eq!(doc.fields["usageCount"], FieldValue::Int(50));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_fallbacks_converge() {
        let store = seeded(10).await;
        store.fail_next_commits(5);
        let incrementer = Arc::new(FieldIncrementer::new(store.clone(), FallbackPolicy::Enabled));

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let incrementer = incrementer.clone();
                tokio::spawn(async move {
                    incrementer
                        .increment_field("coupons", "SAVE10", "usageCount", 2i64)
                        .await
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), IncrementOutcome::Fallback);
        }

        let doc = store.get_document("coupons", "SAVE10").await.unwrap().unwrap();
        assert_eq!(doc.fields["usageCount"], FieldValue::Int(20));
        assert_eq!(doc.fields[FALLBACK_COUNT_FIELD], FieldValue::Int(5));
    }

    #[tokio::test]
    async fn test_nested_field_fallback() {
        let store = seeded(0).await;
        store.fail_next_commits(1);
        let incrementer = FieldIncrementer::new(store.clone(), FallbackPolicy::Enabled);

        incrementer
            .increment_field("coupons", "SAVE10", "stats.daily", 3i64)
            .await
            .unwrap();

        let doc = store.get_document("coupons", "SAVE10").await.unwrap().unwrap();
        let path = FieldPath::parse("stats.daily").unwrap();
        assert_eq!(path.get_in(&doc.fields), Some(&FieldValue::Int(3)));
    }

    #[test]
    #[serial]
    fn test_fallback_policy_from_env() {
        std::env::set_var("LEDGER_TRANSFORM_FALLBACK", "false");
        assert_eq!(FallbackPolicy::from_env(), FallbackPolicy::Disabled);
        std::env::set_var("LEDGER_TRANSFORM_FALLBACK", "true");
        assert_eq!(FallbackPolicy::from_env(), FallbackPolicy::Enabled);
        std::env::remove_var("LEDGER_TRANSFORM_FALLBACK");
        assert_eq!(FallbackPolicy::from_env(), FallbackPolicy::Enabled);
    }
}
