//! Domain Ports (Port/Adapter Pattern)
//!
//! Value objects shared by every component and the traits the governor
//! depends on. Adapters in [`crate::adapters`] implement these traits.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Governor Core                           │
//! │   Cache │ Quota │ Batcher │ Invalidation │ Synchronizer      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │             Ports: DocumentBackend │ EventPublisher          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  InMemoryDocumentBackend │ HttpDocumentBackend │ Publishers  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::DEFAULT_MAX_BATCH_OPS;
use crate::domain::events::DomainEvent;
use crate::error::Result;

// =============================================================================
// Value Objects
// =============================================================================

/// Opaque document payload
pub type Payload = Map<String, Value>;

/// Equality filters keyed by field name. Ordered so fingerprints are stable.
pub type Filters = BTreeMap<String, Value>;

/// A document fetched from (or destined for) the store.
///
/// The payload is schemaless; the envelope carries what the cache and the
/// invalidation router need without looking at business fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub collection: String,
    pub id: String,
    pub data: Payload,
    pub fetched_at: DateTime<Utc>,
}

impl Document {
    pub fn new(collection: impl Into<String>, id: impl Into<String>, data: Payload) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
            data,
            fetched_at: Utc::now(),
        }
    }

    /// Build a document from a JSON value; non-object values are rejected.
    pub fn from_value(
        collection: impl Into<String>,
        id: impl Into<String>,
        value: Value,
    ) -> Option<Self> {
        match value {
            Value::Object(data) => Some(Self::new(collection, id, data)),
            _ => None,
        }
    }

    /// Read a top-level field
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }

    /// Whether two documents carry the same identity and payload,
    /// ignoring when they were fetched.
    pub fn same_content(&self, other: &Document) -> bool {
        self.collection == other.collection && self.id == other.id && self.data == other.data
    }
}

impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        self.same_content(other)
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

/// Ordering clause
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

impl OrderBy {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Desc,
        }
    }
}

/// Query shaping options
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryOptions {
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl QueryOptions {
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn ordered_by(mut self, order: OrderBy) -> Self {
        self.order_by = Some(order);
        self
    }
}

/// Kind of mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteKind {
    /// Replace the whole document
    Set,
    /// Merge fields into an existing document
    Update,
    /// Remove the document
    Delete,
}

impl WriteKind {
    /// Whether the operation is billed against the delete quota
    pub fn is_delete(&self) -> bool {
        matches!(self, WriteKind::Delete)
    }
}

impl std::fmt::Display for WriteKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteKind::Set => write!(f, "set"),
            WriteKind::Update => write!(f, "update"),
            WriteKind::Delete => write!(f, "delete"),
        }
    }
}

/// A single mutation as sent to the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteOp {
    pub collection: String,
    pub id: String,
    pub kind: WriteKind,
    pub payload: Payload,
}

impl WriteOp {
    pub fn new(
        collection: impl Into<String>,
        id: impl Into<String>,
        kind: WriteKind,
        payload: Payload,
    ) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
            kind,
            payload,
        }
    }
}

/// What a listener watches
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    /// A single document by id
    Document(String),
    /// The result set of a query
    Query {
        filters: Filters,
        options: QueryOptions,
    },
}

/// Value delivered to a listener callback
#[derive(Debug, Clone, PartialEq)]
pub enum Snapshot {
    /// Current state of a watched document (`None` when it does not exist)
    Document(Option<Document>),
    /// Current result set of a watched query
    Query(Vec<Document>),
}

// =============================================================================
// Document Backend Port
// =============================================================================

/// Port to the remote, metered document store.
///
/// The governor never talks to the store except through this trait. Every
/// method is one billed round-trip (queries are billed per returned document
/// by most stores; the governor accounts for that itself).
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    /// Fetch one document
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>>;

    /// Run an equality-filter query
    async fn query(
        &self,
        collection: &str,
        filters: &Filters,
        options: &QueryOptions,
    ) -> Result<Vec<Document>>;

    /// Count documents matching the filters
    async fn count(&self, collection: &str, filters: &Filters) -> Result<u64>;

    /// Replace a document
    async fn set(&self, collection: &str, id: &str, data: &Payload) -> Result<()>;

    /// Merge fields into a document
    async fn update(&self, collection: &str, id: &str, data: &Payload) -> Result<()>;

    /// Delete a document
    async fn delete(&self, collection: &str, id: &str) -> Result<()>;

    /// Atomically commit a batch of mutations
    async fn batch_commit(&self, ops: &[WriteOp]) -> Result<()>;

    /// Hard ceiling on operations per batch commit
    fn max_batch_ops(&self) -> usize {
        DEFAULT_MAX_BATCH_OPS
    }

    /// Backend name for logs
    fn name(&self) -> &str;
}

// =============================================================================
// Event Publisher Port
// =============================================================================

/// Port for publishing domain events.
///
/// Publishing is synchronous: sinks are in-process (logs, collectors) and the
/// governor raises events from lock-free hot paths.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: DomainEvent);

    fn publish_all(&self, events: Vec<DomainEvent>) {
        for event in events {
            self.publish(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_document_from_value() {
        let doc = Document::from_value("users", "42", json!({"name": "A"})).unwrap();
        assert_eq!(doc.field("name"), Some(&json!("A")));
        assert!(Document::from_value("users", "42", Value::Null).is_none());
        assert!(Document::from_value("users", "42", json!([1, 2])).is_none());
    }

    #[test]
    fn test_document_equality_ignores_fetch_time() {
        let a = Document::from_value("users", "1", json!({"x": 1})).unwrap();
        let mut b = a.clone();
        b.fetched_at = a.fetched_at + chrono::Duration::seconds(30);
        assert_eq!(a, b);

        b.data.insert("x".into(), json!(2));
        assert_ne!(a, b);
    }

    #[test]
    fn test_write_kind_delete_scope() {
        assert!(WriteKind::Delete.is_delete());
        assert!(!WriteKind::Update.is_delete());
        assert_eq!(WriteKind::Set.to_string(), "set");
    }

    #[test]
    fn test_query_options_builder() {
        let opts = QueryOptions::default()
            .ordered_by(OrderBy::desc("price"))
            .with_limit(10)
            .with_offset(5);
        assert_eq!(opts.limit, Some(10));
        assert_eq!(opts.offset, Some(5));
        assert_eq!(opts.order_by.unwrap().direction, Direction::Desc);
    }
}
