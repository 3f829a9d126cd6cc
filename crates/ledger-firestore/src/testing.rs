//! Test support: an in-memory `DocumentStore` and fixture credentials.
//!
//! Available to this crate's tests and, with the `test-util` feature, to
//! dependent crates.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::codec::{format_timestamp, parse_timestamp};
use crate::credentials::ServiceAccountCredential;
use crate::error::{FirestoreError, FirestoreResult};
use crate::field_path::{check_collection, check_document_id, FieldPath};
use crate::store::{
    CommitResult, Direction, DocumentQuery, DocumentStore, FieldUpdate, FilterOp, StoredDocument,
    WriteOp,
};
use crate::value::{FieldValue, Fields};

/// RSA private key (PKCS#8) used to sign test assertions.
pub const TEST_PRIVATE_KEY_PEM: &str = include_str!("../tests/fixtures/test_key.pem");

/// Public half of `TEST_PRIVATE_KEY_PEM`.
pub const TEST_PUBLIC_KEY_PEM: &str = include_str!("../tests/fixtures/test_key.pub.pem");

/// Service account credential pointing at `token_uri`.
pub fn test_credential(token_uri: &str) -> ServiceAccountCredential {
    let json = serde_json::json!({
        "type": "service_account",
        "project_id": "test-project",
        "private_key_id": "test-key-id",
        "private_key": TEST_PRIVATE_KEY_PEM,
        "client_email": "ledger-test@test-project.iam.gserviceaccount.com",
        "token_uri": token_uri,
    });
    ServiceAccountCredential::from_json(&json.to_string()).expect("fixture credential is valid")
}

type Collections = BTreeMap<String, BTreeMap<String, StoredDocument>>;

#[derive(Default)]
struct Inner {
    docs: Collections,
    last_write: Option<DateTime<Utc>>,
    next_auto_id: u64,
    fail_commits: u32,
    fail_after_commits: u32,
    failing_creates: HashSet<String>,
}

impl Inner {
    /// Strictly increasing write time, so update-time preconditions are exact.
    fn tick(&mut self) -> String {
        let now = Utc::now();
        let next = match self.last_write {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_write = Some(next);
        format_timestamp(&next)
    }
}

/// Serializable in-memory document store.
///
/// Every operation runs under one lock, so commits are atomic and
/// preconditions behave like the real database. Failure injection:
/// - `fail_next_commits(n)`: the next `n` commits fail with a 503 and change nothing
/// - `fail_after_next_commits(n)`: the next `n` commits apply, then report a 503
/// - `fail_creates_in(collection)`: creates in that collection fail with a 503
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn fail_next_commits(&self, n: u32) {
        self.lock().fail_commits = n;
    }

    pub fn fail_after_next_commits(&self, n: u32) {
        self.lock().fail_after_commits = n;
    }

    pub fn fail_creates_in(&self, collection: impl Into<String>) {
        self.lock().failing_creates.insert(collection.into());
    }

    /// Number of documents in a collection.
    pub fn count(&self, collection: &str) -> usize {
        self.lock().docs.get(collection).map_or(0, BTreeMap::len)
    }

    /// Ids of the documents in a collection, sorted.
    pub fn ids(&self, collection: &str) -> Vec<String> {
        self.lock()
            .docs
            .get(collection)
            .map(|docs| docs.keys().cloned().collect())
            .unwrap_or_default()
    }
}

fn injected_failure(what: &str) -> FirestoreError {
    FirestoreError::ServerError(503, format!("injected failure: {}", what))
}

fn apply_updates(fields: &mut Fields, updates: &[FieldUpdate]) -> FirestoreResult<()> {
    for update in updates {
        FieldPath::parse(&update.path)?.set_in(fields, update.value.clone());
    }
    Ok(())
}

/// Apply one write to `docs`. Nothing is partially applied on error.
fn apply_write(inner: &mut Inner, docs: &mut Collections, op: &WriteOp) -> FirestoreResult<StoredDocument> {
    check_collection(op.collection())?;
    check_document_id(op.id())?;
    let path = op.path();
    let existing = docs.get(op.collection()).and_then(|c| c.get(op.id())).cloned();

    let (fields, create_time) = match (op, existing) {
        (WriteOp::Create { .. }, Some(_)) => return Err(FirestoreError::AlreadyExists(path)),
        (WriteOp::Create { collection, fields, .. }, None) => {
            if inner.failing_creates.contains(collection) {
                return Err(injected_failure("create"));
            }
            (fields.clone(), None)
        }
        (WriteOp::Set { fields, .. }, existing) => {
            (fields.clone(), existing.and_then(|d| d.create_time))
        }
        (WriteOp::Update { .. }, None) | (WriteOp::Transform { .. }, None) => {
            return Err(FirestoreError::not_found(path))
        }
        (
            WriteOp::Update {
                updates,
                if_update_time,
                ..
            },
            Some(doc),
        ) => {
            if let Some(expected) = if_update_time {
                if doc.update_time.as_deref() != Some(expected.as_str()) {
                    return Err(FirestoreError::PreconditionFailed(format!(
                        "{} was modified since {}",
                        path, expected
                    )));
                }
            }
            let mut fields = doc.fields;
            apply_updates(&mut fields, updates)?;
            (fields, doc.create_time)
        }
        (WriteOp::Transform { transforms, .. }, Some(doc)) => {
            let mut fields = doc.fields;
            for transform in transforms {
                let field = FieldPath::parse(&transform.field_path)?;
                let next = transform.delta.apply_to(field.get_in(&fields));
                field.set_in(&mut fields, next);
            }
            (fields, doc.create_time)
        }
        (WriteOp::Delete { collection, id }, _) => {
            if let Some(c) = docs.get_mut(collection) {
                c.remove(id);
            }
            return Ok(StoredDocument {
                collection: collection.clone(),
                id: id.clone(),
                fields: Fields::new(),
                create_time: None,
                update_time: None,
            });
        }
    };

    let now = inner.tick();
    let doc = StoredDocument {
        collection: op.collection().to_string(),
        id: op.id().to_string(),
        fields,
        create_time: create_time.or_else(|| Some(now.clone())),
        update_time: Some(now),
    };
    docs.entry(op.collection().to_string())
        .or_default()
        .insert(op.id().to_string(), doc.clone());
    Ok(doc)
}

/// Write a single document directly against the live map.
fn apply_direct(inner: &mut Inner, op: &WriteOp) -> FirestoreResult<StoredDocument> {
    let mut docs = std::mem::take(&mut inner.docs);
    let result = apply_write(inner, &mut docs, op);
    inner.docs = docs;
    result
}

fn compare(a: &FieldValue, b: &FieldValue) -> Option<Ordering> {
    match (a, b) {
        (FieldValue::Null, FieldValue::Null) => Some(Ordering::Equal),
        (FieldValue::Bool(x), FieldValue::Bool(y)) => Some(x.cmp(y)),
        (FieldValue::Int(x), FieldValue::Int(y)) => Some(x.cmp(y)),
        (FieldValue::Int(_) | FieldValue::Double(_), FieldValue::Int(_) | FieldValue::Double(_)) => {
            a.as_f64()?.partial_cmp(&b.as_f64()?)
        }
        (FieldValue::Str(x), FieldValue::Str(y)) => Some(x.cmp(y)),
        (FieldValue::Timestamp(x), FieldValue::Timestamp(y)) => Some(x.cmp(y)),
        // Query values are encoded with timestamp promotion
        (FieldValue::Timestamp(x), FieldValue::Str(y)) => Some(x.cmp(&parse_timestamp(y)?)),
        (FieldValue::Str(x), FieldValue::Timestamp(y)) => Some(parse_timestamp(x)?.cmp(y)),
        _ => None,
    }
}

fn matches_filter(fields: &Fields, field: &FieldPath, op: FilterOp, value: &FieldValue) -> bool {
    let Some(actual) = field.get_in(fields) else {
        return false;
    };
    let ord = compare(actual, value);
    match op {
        FilterOp::Equal => ord == Some(Ordering::Equal),
        FilterOp::NotEqual => ord != Some(Ordering::Equal) && !actual.is_null(),
        FilterOp::LessThan => ord == Some(Ordering::Less),
        FilterOp::LessThanOrEqual => matches!(ord, Some(Ordering::Less | Ordering::Equal)),
        FilterOp::GreaterThan => ord == Some(Ordering::Greater),
        FilterOp::GreaterThanOrEqual => matches!(ord, Some(Ordering::Greater | Ordering::Equal)),
        FilterOp::ArrayContains => actual
            .as_list()
            .is_some_and(|items| items.iter().any(|i| compare(i, value) == Some(Ordering::Equal))),
        FilterOp::In => value
            .as_list()
            .is_some_and(|items| items.iter().any(|i| compare(actual, i) == Some(Ordering::Equal))),
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get_document(&self, collection: &str, id: &str) -> FirestoreResult<Option<StoredDocument>> {
        check_collection(collection)?;
        check_document_id(id)?;
        Ok(self
            .lock()
            .docs
            .get(collection)
            .and_then(|c| c.get(id))
            .cloned())
    }

    async fn write_document(
        &self,
        collection: &str,
        fields: &Fields,
        id: Option<&str>,
    ) -> FirestoreResult<StoredDocument> {
        let mut inner = self.lock();
        let id = match id {
            Some(id) => id.to_string(),
            None => {
                inner.next_auto_id += 1;
                format!("auto-{:06}", inner.next_auto_id)
            }
        };
        apply_direct(&mut inner, &WriteOp::set(collection, id, fields.clone()))
    }

    async fn create_document(&self, collection: &str, id: &str, fields: &Fields) -> FirestoreResult<StoredDocument> {
        apply_direct(&mut self.lock(), &WriteOp::create(collection, id, fields.clone()))
    }

    async fn update_document(
        &self,
        collection: &str,
        id: &str,
        updates: &[FieldUpdate],
    ) -> FirestoreResult<StoredDocument> {
        apply_direct(&mut self.lock(), &WriteOp::update(collection, id, updates.to_vec()))
    }

    async fn update_document_if_unchanged(
        &self,
        collection: &str,
        id: &str,
        updates: &[FieldUpdate],
        update_time: &str,
    ) -> FirestoreResult<StoredDocument> {
        let op = WriteOp::Update {
            collection: collection.to_string(),
            id: id.to_string(),
            updates: updates.to_vec(),
            if_update_time: Some(update_time.to_string()),
        };
        apply_direct(&mut self.lock(), &op)
    }

    async fn delete_document(&self, collection: &str, id: &str) -> FirestoreResult<()> {
        apply_direct(&mut self.lock(), &WriteOp::delete(collection, id)).map(|_| ())
    }

    async fn query_documents(&self, collection: &str, query: &DocumentQuery) -> FirestoreResult<Vec<StoredDocument>> {
        check_collection(collection)?;
        let filters = query
            .filters
            .iter()
            .map(|f| Ok((FieldPath::parse(&f.field)?, f.op, &f.value)))
            .collect::<FirestoreResult<Vec<_>>>()?;
        let order = query.order_by.as_deref().map(FieldPath::parse).transpose()?;

        let inner = self.lock();
        let mut docs: Vec<StoredDocument> = inner
            .docs
            .get(collection)
            .into_iter()
            .flat_map(|c| c.values())
            .filter(|doc| {
                filters
                    .iter()
                    .all(|(field, op, value)| matches_filter(&doc.fields, field, *op, value))
            })
            .filter(|doc| order.as_ref().map_or(true, |o| o.get_in(&doc.fields).is_some()))
            .cloned()
            .collect();
        drop(inner);

        if let Some(order) = &order {
            docs.sort_by(|a, b| {
                let ord = match (order.get_in(&a.fields), order.get_in(&b.fields)) {
                    (Some(x), Some(y)) => compare(x, y).unwrap_or(Ordering::Equal),
                    _ => Ordering::Equal,
                };
                match query.direction {
                    Direction::Ascending => ord,
                    Direction::Descending => ord.reverse(),
                }
            });
        }
        if let Some(limit) = query.limit {
            docs.truncate(limit as usize);
        }
        Ok(docs)
    }

    async fn commit(&self, writes: &[WriteOp]) -> FirestoreResult<CommitResult> {
        let mut inner = self.lock();
        if inner.fail_commits > 0 {
            inner.fail_commits -= 1;
            return Err(injected_failure("commit"));
        }

        let mut staged = inner.docs.clone();
        let mut update_times = Vec::with_capacity(writes.len());
        for op in writes {
            let doc = apply_write(&mut inner, &mut staged, op)?;
            update_times.push(doc.update_time);
        }
        inner.docs = staged;
        let commit_time = inner.last_write.map(|t| format_timestamp(&t));

        if inner.fail_after_commits > 0 {
            inner.fail_after_commits -= 1;
            return Err(injected_failure("commit response lost"));
        }

        Ok(CommitResult {
            commit_time,
            update_times,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, FieldValue)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_commit_is_all_or_nothing() {
        let store = MemoryStore::new();
        store.create_document("c", "a", &Fields::new()).await.unwrap();

        let result = store
            .commit(&[
                WriteOp::create("c", "b", Fields::new()),
                WriteOp::create("c", "a", Fields::new()),
            ])
            .await;

        assert!(matches!(result, Err(FirestoreError::AlreadyExists(_))));
        assert_eq!(store.ids("c"), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_update_times_strictly_increase() {
        let store = MemoryStore::new();
        let first = store.create_document("c", "a", &Fields::new()).await.unwrap();
        let second = store
            .update_document("c", "a", &[FieldUpdate::new("x", 1i64)])
            .await
            .unwrap();

        let t1 = parse_timestamp(first.update_time.as_deref().unwrap()).unwrap();
        let t2 = parse_timestamp(second.update_time.as_deref().unwrap()).unwrap();
        assert!(t2 > t1);
        assert_eq!(second.create_time, first.create_time);
    }

    #[tokio::test]
    async fn test_stale_update_time_rejected() {
        let store = MemoryStore::new();
        let doc = store.create_document("c", "a", &Fields::new()).await.unwrap();
        store
            .update_document("c", "a", &[FieldUpdate::new("x", 1i64)])
            .await
            .unwrap();

        let result = store
            .update_document_if_unchanged(
                "c",
                "a",
                &[FieldUpdate::new("x", 2i64)],
                doc.update_time.as_deref().unwrap(),
            )
            .await;
        assert!(matches!(result, Err(FirestoreError::PreconditionFailed(_))));
    }

    #[tokio::test]
    async fn test_query_filters_order_and_limit() {
        let store = MemoryStore::new();
        for (id, partner, n) in [("1", "A", 3i64), ("2", "B", 1), ("3", "A", 2), ("4", "A", 5)] {
            store
                .create_document(
                    "usage",
                    id,
                    &fields(&[("partner", FieldValue::from(partner)), ("n", FieldValue::Int(n))]),
                )
                .await
                .unwrap();
        }

        let query = DocumentQuery::new()
            .eq("partner", "A")
            .filter("n", FilterOp::GreaterThan, 2i64)
            .order_by("n", Direction::Descending)
            .limit(5);
        let ids: Vec<String> = store
            .query_documents("usage", &query)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();

        assert_eq!(ids, vec!["4".to_string(), "1".to_string()]);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = MemoryStore::new();
        store.fail_next_commits(1);
        let err = store
            .commit(&[WriteOp::create("c", "a", Fields::new())])
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.count("c"), 0);

        store.fail_after_next_commits(1);
        let err = store
            .commit(&[WriteOp::create("c", "a", Fields::new())])
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.count("c"), 1);
    }

    #[tokio::test]
    async fn test_write_document_generates_ids() {
        let store = MemoryStore::new();
        let a = store.write_document("c", &Fields::new(), None).await.unwrap();
        let b = store.write_document("c", &Fields::new(), None).await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(store.count("c"), 2);
    }
}
