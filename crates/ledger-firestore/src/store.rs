//! Document store abstraction.
//!
//! `DocumentStore` is the seam between the ledger and the database. The
//! REST client implements it for Firestore; `testing::MemoryStore` implements
//! it in memory.

use async_trait::async_trait;

use crate::error::FirestoreResult;
use crate::value::{FieldValue, Fields};

pub use crate::types::{Direction, FilterOp};

/// A document as read from or written to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    /// Collection path, possibly nested (`orders/o1/guards`).
    pub collection: String,
    pub id: String,
    pub fields: Fields,
    /// Server create time (RFC 3339).
    pub create_time: Option<String>,
    /// Server update time (RFC 3339); the optimistic-lock token.
    pub update_time: Option<String>,
}

impl StoredDocument {
    /// `collection/id`.
    pub fn path(&self) -> String {
        format!("{}/{}", self.collection, self.id)
    }
}

/// One dotted-path update in a patch.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldUpdate {
    pub path: String,
    pub value: FieldValue,
}

impl FieldUpdate {
    pub fn new(path: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Self {
            path: path.into(),
            value: value.into(),
        }
    }
}

/// A single field comparison in a query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryFilter {
    pub field: String,
    pub op: FilterOp,
    pub value: FieldValue,
}

/// Structured query over one collection. Filters are AND-ed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentQuery {
    pub filters: Vec<QueryFilter>,
    pub limit: Option<u32>,
    pub order_by: Option<String>,
    pub direction: Direction,
}

impl DocumentQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, field: impl Into<String>, op: FilterOp, value: impl Into<FieldValue>) -> Self {
        self.filters.push(QueryFilter {
            field: field.into(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn eq(self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.filter(field, FilterOp::Equal, value)
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some(field.into());
        self.direction = direction;
        self
    }
}

/// Increment amount for a field transform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Delta {
    Int(i64),
    Double(f64),
}

impl Delta {
    /// Whole amounts become integer deltas, anything else a double.
    pub fn from_amount(amount: f64) -> Self {
        if amount.is_finite() && amount.fract() == 0.0 && amount.abs() < i64::MAX as f64 {
            Self::Int(amount as i64)
        } else {
            Self::Double(amount)
        }
    }

    pub fn to_field_value(self) -> FieldValue {
        match self {
            Self::Int(i) => FieldValue::Int(i),
            Self::Double(f) => FieldValue::Double(f),
        }
    }

    /// Value after applying this delta to `current`, with server increment semantics.
    ///
    /// Integer plus integer saturates; any double makes the result a double;
    /// a missing or non-numeric current value is replaced by the delta.
    pub fn apply_to(self, current: Option<&FieldValue>) -> FieldValue {
        match (current, self) {
            (Some(FieldValue::Int(a)), Self::Int(b)) => FieldValue::Int(a.saturating_add(b)),
            (Some(FieldValue::Int(a)), Self::Double(b)) => FieldValue::Double(*a as f64 + b),
            (Some(FieldValue::Double(a)), Self::Int(b)) => FieldValue::Double(a + b as f64),
            (Some(FieldValue::Double(a)), Self::Double(b)) => FieldValue::Double(a + b),
            (_, delta) => delta.to_field_value(),
        }
    }
}

impl From<i64> for Delta {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Delta {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

/// Server-side increment of one field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldTransform {
    pub field_path: String,
    pub delta: Delta,
}

impl FieldTransform {
    pub fn increment(field_path: impl Into<String>, delta: impl Into<Delta>) -> Self {
        Self {
            field_path: field_path.into(),
            delta: delta.into(),
        }
    }
}

/// A write inside an atomic commit.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Create-only; fails with `AlreadyExists` if the document exists.
    Create {
        collection: String,
        id: String,
        fields: Fields,
    },
    /// Full-replace set.
    Set {
        collection: String,
        id: String,
        fields: Fields,
    },
    /// Masked patch of an existing document, optionally pinned to an update time.
    Update {
        collection: String,
        id: String,
        updates: Vec<FieldUpdate>,
        if_update_time: Option<String>,
    },
    /// Server-side increments on an existing document.
    Transform {
        collection: String,
        id: String,
        transforms: Vec<FieldTransform>,
    },
    Delete {
        collection: String,
        id: String,
    },
}

impl WriteOp {
    pub fn create(collection: impl Into<String>, id: impl Into<String>, fields: Fields) -> Self {
        Self::Create {
            collection: collection.into(),
            id: id.into(),
            fields,
        }
    }

    pub fn set(collection: impl Into<String>, id: impl Into<String>, fields: Fields) -> Self {
        Self::Set {
            collection: collection.into(),
            id: id.into(),
            fields,
        }
    }

    pub fn update(
        collection: impl Into<String>,
        id: impl Into<String>,
        updates: Vec<FieldUpdate>,
    ) -> Self {
        Self::Update {
            collection: collection.into(),
            id: id.into(),
            updates,
            if_update_time: None,
        }
    }

    pub fn transform(
        collection: impl Into<String>,
        id: impl Into<String>,
        transforms: Vec<FieldTransform>,
    ) -> Self {
        Self::Transform {
            collection: collection.into(),
            id: id.into(),
            transforms,
        }
    }

    pub fn delete(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self::Delete {
            collection: collection.into(),
            id: id.into(),
        }
    }

    pub fn collection(&self) -> &str {
        match self {
            Self::Create { collection, .. }
            | Self::Set { collection, .. }
            | Self::Update { collection, .. }
            | Self::Transform { collection, .. }
            | Self::Delete { collection, .. } => collection,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Create { id, .. }
            | Self::Set { id, .. }
            | Self::Update { id, .. }
            | Self::Transform { id, .. }
            | Self::Delete { id, .. } => id,
        }
    }

    /// `collection/id` of the target document.
    pub fn path(&self) -> String {
        format!("{}/{}", self.collection(), self.id())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Set { .. } => "set",
            Self::Update { .. } => "update",
            Self::Transform { .. } => "transform",
            Self::Delete { .. } => "delete",
        }
    }
}

/// Outcome of a successful commit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitResult {
    pub commit_time: Option<String>,
    /// Per-write update times, in request order.
    pub update_times: Vec<Option<String>>,
}

/// Document database operations used by the ledger.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch a document; absent is `Ok(None)`.
    async fn get_document(&self, collection: &str, id: &str)
        -> FirestoreResult<Option<StoredDocument>>;

    /// Full-replace set. The store generates an id when `id` is `None`.
    async fn write_document(
        &self,
        collection: &str,
        fields: &Fields,
        id: Option<&str>,
    ) -> FirestoreResult<StoredDocument>;

    /// Create-only write; an existing document is `AlreadyExists`.
    async fn create_document(
        &self,
        collection: &str,
        id: &str,
        fields: &Fields,
    ) -> FirestoreResult<StoredDocument>;

    /// Masked patch of an existing document; absent is `NotFound`.
    async fn update_document(
        &self,
        collection: &str,
        id: &str,
        updates: &[FieldUpdate],
    ) -> FirestoreResult<StoredDocument>;

    /// Masked patch that fails with `PreconditionFailed` unless the document's
    /// update time still equals `update_time`.
    async fn update_document_if_unchanged(
        &self,
        collection: &str,
        id: &str,
        updates: &[FieldUpdate],
        update_time: &str,
    ) -> FirestoreResult<StoredDocument>;

    /// Delete; deleting an absent document succeeds.
    async fn delete_document(&self, collection: &str, id: &str) -> FirestoreResult<()>;

    async fn query_documents(
        &self,
        collection: &str,
        query: &DocumentQuery,
    ) -> FirestoreResult<Vec<StoredDocument>>;

    /// Apply all writes atomically or none of them.
    async fn commit(&self, writes: &[WriteOp]) -> FirestoreResult<CommitResult>;
}
