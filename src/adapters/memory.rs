//! In-Memory Document Backend
//!
//! Implements the `DocumentBackend` port over a `DashMap` of collections.
//! Used by tests and the `--backend memory` mode of the binary. It evaluates
//! equality filters, ordering and paging itself, records every batch commit
//! and can be told to fail or stall so retry and timeout paths get exercised.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;

use crate::config::DEFAULT_MAX_BATCH_OPS;
use crate::domain::ports::{
    Direction, Document, DocumentBackend, Filters, Payload, QueryOptions, WriteKind, WriteOp,
};
use crate::error::{Error, Result};

/// Operation counters for the in-memory backend
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendStats {
    pub gets: u64,
    pub queries: u64,
    pub counts: u64,
    pub writes: u64,
    pub deletes: u64,
    pub commits: u64,
}

/// In-memory backend (collection -> id -> payload)
pub struct InMemoryDocumentBackend {
    storage: DashMap<String, DashMap<String, Payload>>,
    max_batch_ops: usize,
    /// Number of upcoming mutating calls that fail with `BackendUnavailable`
    fail_next: AtomicU32,
    /// Artificial latency applied to every call
    latency: Mutex<Option<Duration>>,
    /// Size of every successful batch commit, in call order
    commit_log: Mutex<Vec<usize>>,
    gets: AtomicU64,
    queries: AtomicU64,
    counts: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    commits: AtomicU64,
}

impl Default for InMemoryDocumentBackend {
    fn default() -> Self {
        Self::with_max_batch_ops(DEFAULT_MAX_BATCH_OPS)
    }
}

impl InMemoryDocumentBackend {
    /// Create a new in-memory backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend with a custom per-commit ceiling
    pub fn with_max_batch_ops(max_batch_ops: usize) -> Self {
        Self {
            storage: DashMap::new(),
            max_batch_ops,
            fail_next: AtomicU32::new(0),
            latency: Mutex::new(None),
            commit_log: Mutex::new(Vec::new()),
            gets: AtomicU64::new(0),
            queries: AtomicU64::new(0),
            counts: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            commits: AtomicU64::new(0),
        }
    }

    /// Seed a document without touching the operation counters
    pub fn insert(&self, collection: &str, id: &str, data: Payload) {
        self.storage
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), data);
    }

    /// Read a document without touching the operation counters
    pub fn peek(&self, collection: &str, id: &str) -> Option<Payload> {
        let docs = self.storage.get(collection)?;
        let doc = docs.get(id)?;
        Some(doc.value().clone())
    }

    /// Make the next `n` mutating calls fail
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Sizes of all successful batch commits
    pub fn commit_log(&self) -> Vec<usize> {
        self.commit_log.lock().clone()
    }

    pub fn stats(&self) -> BackendStats {
        BackendStats {
            gets: self.gets.load(Ordering::Relaxed),
            queries: self.queries.load(Ordering::Relaxed),
            counts: self.counts.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
        }
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_injected_failure(&self) -> Result<()> {
        let consumed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if consumed.is_ok() {
            return Err(Error::BackendUnavailable("injected failure".into()));
        }
        Ok(())
    }

    fn apply(&self, op: &WriteOp) {
        let collection = self.storage.entry(op.collection.clone()).or_default();
        match op.kind {
            WriteKind::Set => {
                collection.insert(op.id.clone(), op.payload.clone());
                self.writes.fetch_add(1, Ordering::Relaxed);
            }
            WriteKind::Update => {
                let mut doc = collection.entry(op.id.clone()).or_default();
                for (k, v) in &op.payload {
                    doc.insert(k.clone(), v.clone());
                }
                self.writes.fetch_add(1, Ordering::Relaxed);
            }
            WriteKind::Delete => {
                collection.remove(&op.id);
                self.deletes.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn matching(&self, collection: &str, filters: &Filters) -> Vec<Document> {
        let Some(docs) = self.storage.get(collection) else {
            return Vec::new();
        };
        docs.iter()
            .filter(|entry| {
                filters
                    .iter()
                    .all(|(field, expected)| entry.value().get(field) == Some(expected))
            })
            .map(|entry| Document::new(collection, entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

/// Order JSON values: null < bool < number < string, others compare equal
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> CmpOrdering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(_) => 4,
        }
    }
    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(CmpOrdering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

#[async_trait]
impl DocumentBackend for InMemoryDocumentBackend {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        self.simulate_latency().await;
        self.gets.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .peek(collection, id)
            .map(|data| Document::new(collection, id, data)))
    }

    async fn query(
        &self,
        collection: &str,
        filters: &Filters,
        options: &QueryOptions,
    ) -> Result<Vec<Document>> {
        self.simulate_latency().await;
        self.queries.fetch_add(1, Ordering::Relaxed);

        let mut docs = self.matching(collection, filters);
        // Stable base order so paging is deterministic
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        if let Some(order) = &options.order_by {
            docs.sort_by(|a, b| {
                let ord = compare_values(a.field(&order.field), b.field(&order.field));
                match order.direction {
                    Direction::Asc => ord,
                    Direction::Desc => ord.reverse(),
                }
            });
        }

        let offset = options.offset.unwrap_or(0);
        let limit = options.limit.unwrap_or(usize::MAX);
        Ok(docs.into_iter().skip(offset).take(limit).collect())
    }

    async fn count(&self, collection: &str, filters: &Filters) -> Result<u64> {
        self.simulate_latency().await;
        self.counts.fetch_add(1, Ordering::Relaxed);
        Ok(self.matching(collection, filters).len() as u64)
    }

    async fn set(&self, collection: &str, id: &str, data: &Payload) -> Result<()> {
        self.simulate_latency().await;
        self.check_injected_failure()?;
        self.apply(&WriteOp::new(collection, id, WriteKind::Set, data.clone()));
        Ok(())
    }

    async fn update(&self, collection: &str, id: &str, data: &Payload) -> Result<()> {
        self.simulate_latency().await;
        self.check_injected_failure()?;
        self.apply(&WriteOp::new(collection, id, WriteKind::Update, data.clone()));
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        self.simulate_latency().await;
        self.check_injected_failure()?;
        self.apply(&WriteOp::new(collection, id, WriteKind::Delete, Payload::new()));
        Ok(())
    }

    async fn batch_commit(&self, ops: &[WriteOp]) -> Result<()> {
        self.simulate_latency().await;
        if ops.len() > self.max_batch_ops {
            return Err(Error::Internal(format!(
                "batch of {} ops exceeds backend ceiling {}",
                ops.len(),
                self.max_batch_ops
            )));
        }
        self.check_injected_failure()?;

        for op in ops {
            self.apply(op);
        }
        self.commits.fetch_add(1, Ordering::Relaxed);
        self.commit_log.lock().push(ops.len());
        Ok(())
    }

    fn max_batch_ops(&self) -> usize {
        self.max_batch_ops
    }

    fn name(&self) -> &str {
        "memory"
    }
}
