//! Idempotency guards.
//!
//! A guard is a marker document at
//! `{scopeCollection}/{scopeId}/guards/{sha1(transactionKey|subjectId)}`.
//! Its presence means the guarded mutation has been applied for that key.
//!
//! The mutation writes and the guard create (`exists=false`) go out in one
//! atomic commit, so a guard never exists without its mutation and a
//! concurrent duplicate is rejected by the create precondition. Only the
//! transient-failure fallback can leave a mutation without its guard; that
//! case is logged and reported as `ApplyPath::FallbackUnguarded`.

use std::sync::Arc;

use chrono::Utc;
use ledger_models::{ApplyPath, GuardRecord};
use sha1::{Digest, Sha1};
use tracing::{error, info, warn};

use crate::error::{FirestoreError, FirestoreResult};
use crate::metrics::{record_guard_conflict, record_unguarded_apply};
use crate::store::{DocumentStore, WriteOp};
use crate::transform::{FallbackPolicy, FieldIncrementer};
use crate::value::{FieldValue, Fields, FieldsExt};

/// Subcollection holding guard documents under their scope.
pub const GUARDS_SUBCOLLECTION: &str = "guards";

/// Guard document id: lowercase hex SHA-1 of `transaction_key|subject_id`.
pub fn guard_key(transaction_key: &str, subject_id: &str) -> String {
    let digest = Sha1::digest(format!("{}|{}", transaction_key, subject_id).as_bytes());
    format!("{:x}", digest)
}

/// Document that owns a set of guards, e.g. `orders/order-42`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardScope {
    pub collection: String,
    pub id: String,
}

impl GuardScope {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }

    /// `collection/id`
    pub fn path(&self) -> String {
        format!("{}/{}", self.collection, self.id)
    }

    /// `collection/id/guards`
    pub fn guard_collection(&self) -> String {
        format!("{}/{}", self.path(), GUARDS_SUBCOLLECTION)
    }
}

/// Result of a guarded apply. A duplicate is an outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardOutcome {
    Applied(ApplyPath),
    AlreadyApplied,
}

impl GuardOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    pub fn apply_path(&self) -> Option<ApplyPath> {
        match self {
            Self::Applied(path) => Some(*path),
            Self::AlreadyApplied => None,
        }
    }
}

pub fn guard_to_fields(record: &GuardRecord) -> Fields {
    let mut fields = Fields::new();
    fields.insert("key".into(), FieldValue::from(record.key.as_str()));
    fields.insert("scope".into(), FieldValue::from(record.scope.as_str()));
    fields.insert("subjectId".into(), FieldValue::from(record.subject_id.as_str()));
    fields.insert(
        "transactionKey".into(),
        FieldValue::from(record.transaction_key.as_str()),
    );
    fields.insert("appliedAt".into(), FieldValue::Timestamp(record.applied_at));
    fields.insert("applyPath".into(), FieldValue::from(record.apply_path.as_str()));
    fields
}

pub fn guard_from_fields(key: &str, fields: &Fields) -> FirestoreResult<GuardRecord> {
    let text = |name: &str| {
        fields
            .get_str(name)
            .map(str::to_string)
            .ok_or_else(|| FirestoreError::codec(format!("guard {} is missing {}", key, name)))
    };

    Ok(GuardRecord {
        key: key.to_string(),
        scope: text("scope")?,
        subject_id: text("subjectId")?,
        transaction_key: text("transactionKey")?,
        applied_at: fields
            .get_timestamp("appliedAt")
            .ok_or_else(|| FirestoreError::codec(format!("guard {} is missing appliedAt", key)))?,
        apply_path: fields
            .get_str("applyPath")
            .and_then(ApplyPath::from_str)
            .unwrap_or(ApplyPath::Atomic),
    })
}

/// Runs mutations at most once per (scope, subject, transaction key).
#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn DocumentStore>,
    incrementer: FieldIncrementer,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn DocumentStore>, fallback: FallbackPolicy) -> Self {
        let incrementer = FieldIncrementer::new(store.clone(), fallback);
        Self { store, incrementer }
    }

    pub fn incrementer(&self) -> &FieldIncrementer {
        &self.incrementer
    }

    /// Look up the guard for a subject and transaction key.
    pub async fn find(
        &self,
        scope: &GuardScope,
        subject_id: &str,
        transaction_key: &str,
    ) -> FirestoreResult<Option<GuardRecord>> {
        self.find_by_key(scope, &guard_key(transaction_key, subject_id))
            .await
    }

    async fn find_by_key(&self, scope: &GuardScope, key: &str) -> FirestoreResult<Option<GuardRecord>> {
        match self
            .store
            .get_document(&scope.guard_collection(), key)
            .await?
        {
            Some(doc) => Ok(Some(guard_from_fields(key, &doc.fields)?)),
            None => Ok(None),
        }
    }

    /// Apply `writes` unless the guard already exists.
    pub async fn apply(
        &self,
        scope: &GuardScope,
        subject_id: &str,
        transaction_key: &str,
        writes: Vec<WriteOp>,
    ) -> FirestoreResult<GuardOutcome> {
        let key = guard_key(transaction_key, subject_id);
        if self.find_by_key(scope, &key).await?.is_some() {
            info!(scope = %scope.path(), subject = %subject_id, "Guard present, already applied");
            record_guard_conflict();
            return Ok(GuardOutcome::AlreadyApplied);
        }

        self.commit_guarded(scope, subject_id, transaction_key, writes)
            .await
    }

    /// Commit `writes` together with the guard create, without the pre-read.
    ///
    /// Callers that have already checked the guard use this directly.
    pub async fn commit_guarded(
        &self,
        scope: &GuardScope,
        subject_id: &str,
        transaction_key: &str,
        writes: Vec<WriteOp>,
    ) -> FirestoreResult<GuardOutcome> {
        let key = guard_key(transaction_key, subject_id);
        let record = GuardRecord {
            key: key.clone(),
            scope: scope.path(),
            subject_id: subject_id.to_string(),
            transaction_key: transaction_key.to_string(),
            applied_at: Utc::now(),
            apply_path: ApplyPath::Atomic,
        };

        let mut batch = writes.clone();
        batch.push(WriteOp::create(
            scope.guard_collection(),
            key.as_str(),
            guard_to_fields(&record),
        ));

        let err = match self.store.commit(&batch).await {
            Ok(_) => return Ok(GuardOutcome::Applied(ApplyPath::Atomic)),
            Err(e) => e,
        };

        if err.is_already_exists() {
            // Only a concurrent duplicate if it was the guard that collided
            if self.find_by_key(scope, &key).await?.is_some() {
                info!(scope = %scope.path(), subject = %subject_id, "Concurrent duplicate rejected by guard");
                record_guard_conflict();
                return Ok(GuardOutcome::AlreadyApplied);
            }
            return Err(err);
        }

        if !err.is_transient() {
            return Err(err);
        }

        warn!(
            scope = %scope.path(),
            subject = %subject_id,
            error = %err,
            "Guarded commit failed transiently, re-checking guard"
        );

        // The commit may have landed before the connection dropped.
        match self.find_by_key(scope, &key).await {
            Ok(Some(_)) => return Ok(GuardOutcome::Applied(ApplyPath::Atomic)),
            Ok(None) => {}
            Err(check_err) => {
                warn!(error = %check_err, "Guard re-check failed");
                return Err(err);
            }
        }

        if !self.incrementer.fallback_policy().is_enabled() {
            return Err(err);
        }

        self.incrementer.apply_writes_fallback(&writes).await?;

        let record = GuardRecord {
            apply_path: ApplyPath::Fallback,
            applied_at: Utc::now(),
            ..record
        };
        match self
            .store
            .create_document(&scope.guard_collection(), &key, &guard_to_fields(&record))
            .await
        {
            Ok(_) => {
                warn!(scope = %scope.path(), subject = %subject_id, "Applied via non-atomic fallback");
                Ok(GuardOutcome::Applied(ApplyPath::Fallback))
            }
            Err(e) if e.is_already_exists() => {
                error!(
                    scope = %scope.path(),
                    subject = %subject_id,
                    transaction_key = %transaction_key,
                    "Guard appeared during fallback; mutation may have been applied twice"
                );
                Ok(GuardOutcome::Applied(ApplyPath::Fallback))
            }
            Err(e) => {
                error!(
                    scope = %scope.path(),
                    subject = %subject_id,
                    transaction_key = %transaction_key,
                    guard_key = %key,
                    error = %e,
                    "Applied but unguarded: guard write failed after fallback"
                );
                record_unguarded_apply();
                Ok(GuardOutcome::Applied(ApplyPath::FallbackUnguarded))
            }
        }
    }
}
