//! Smart Store Façade
//!
//! The only surface applications call. Reads go cache first and only reach
//! the backend when admission allows; writes commit directly while the
//! safety budget lasts and are deferred to the batcher after that.
//!
//! ```text
//!  smart_get / smart_query / smart_count
//!        │
//!        ▼
//!   CacheStore ──fresh──▶ return
//!        │ miss/stale
//!        ▼
//!   QuotaGovernor::can_read ──no──▶ stale value or empty answer
//!        │ yes
//!        ▼
//!   DocumentBackend (timeout) ──▶ bill reads ──▶ populate_if_current
//!
//!  smart_write
//!        │
//!        ▼
//!   QuotaGovernor::admits ──yes──▶ backend write ──▶ write_through
//!        │ no (or retryable failure)
//!        ▼
//!   WriteBatcher::enqueue_with_ticket ──▶ write_through overlay
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::adapters::LoggingEventPublisher;
use crate::batcher::{BatcherConfig, FlushReport, WriteBatcher, WriteTicket};
use crate::cache::{
    count_fingerprint, query_fingerprint, CacheConfig, CacheKey, CacheStore, CachedValue, Lookup,
};
use crate::clock::{Clock, SystemClock};
use crate::config::GovernorConfig;
use crate::domain::ports::{
    Document, DocumentBackend, EventPublisher, Filters, Payload, QueryOptions, Snapshot, Target,
    WriteKind, WriteOp,
};
use crate::error::{Error, Result};
use crate::invalidation::InvalidationRouter;
use crate::monitoring::{GovernorStats, HealthReport, PrometheusExporter, ReadPathMetrics};
use crate::quota::{GovernorMode, QuotaGovernor, QuotaScope};
use crate::sync::{ListenerRegistry, SnapshotSource, Subscription, SyncConfig};

/// Documents a single billed count read covers
const COUNT_DOCS_PER_READ: u64 = 1000;

/// Backend fetches one document read may make while writes land under it
const MAX_DOCUMENT_FETCHES: u32 = 3;

/// Result of [`SmartStore::smart_write`]
#[derive(Debug)]
pub enum WriteOutcome {
    /// The backend accepted the write
    Committed,
    /// The write is queued; the ticket resolves when it commits or is dropped
    Deferred { ticket: WriteTicket },
}

impl WriteOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, WriteOutcome::Committed)
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, WriteOutcome::Deferred { .. })
    }

    /// Resolve once the write is durable (immediately when committed)
    pub async fn wait(self) -> Result<()> {
        match self {
            WriteOutcome::Committed => Ok(()),
            WriteOutcome::Deferred { ticket } => ticket.wait().await,
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Assembles a [`SmartStore`] from its injected dependencies
pub struct SmartStoreBuilder {
    config: GovernorConfig,
    backend: Option<Arc<dyn DocumentBackend>>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventPublisher>,
}

impl Default for SmartStoreBuilder {
    fn default() -> Self {
        Self {
            config: GovernorConfig::default(),
            backend: None,
            clock: Arc::new(SystemClock),
            events: Arc::new(LoggingEventPublisher::new()),
        }
    }
}

impl SmartStoreBuilder {
    pub fn config(mut self, config: GovernorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn backend(mut self, backend: Arc<dyn DocumentBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Calendar source for the daily reset (tests pass a `ManualClock`)
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }

    /// Validate the configuration and wire every component
    pub fn build(self) -> Result<SmartStore> {
        self.config.validate()?;
        let backend = self
            .backend
            .ok_or_else(|| Error::Config("a document backend is required".into()))?;
        let config = Arc::new(self.config);

        let cache = Arc::new(CacheStore::with_config(CacheConfig::from(config.as_ref())));
        let quota = Arc::new(QuotaGovernor::new(&config, self.clock, self.events.clone()));
        let router = Arc::new(InvalidationRouter::new(cache.clone()));
        let batcher = Arc::new(WriteBatcher::new(
            BatcherConfig::from(config.as_ref()),
            backend.clone(),
            quota.clone(),
            router.clone(),
            self.events.clone(),
        ));
        let listeners = Arc::new(ListenerRegistry::new(
            SyncConfig::from(config.as_ref()),
            quota.clone(),
            self.events.clone(),
        ));
        let exporter = PrometheusExporter::new()?;

        info!(
            backend = backend.name(),
            daily_reads = config.daily_read_limit,
            daily_writes = config.daily_write_limit,
            daily_deletes = config.daily_delete_limit,
            safety_margin = config.safety_margin,
            "Governor assembled"
        );

        // Listeners read through the core; the weak handle keeps the
        // registry from owning what owns it
        let core = Arc::new_cyclic(|core: &Weak<Core>| Core {
            config,
            backend,
            cache,
            quota,
            router,
            batcher,
            listeners,
            poller: Arc::new(PollSource { core: core.clone() }),
            reads: ReadPathMetrics::new(),
            exporter,
            started_at: Instant::now(),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
        });
        Ok(SmartStore { core })
    }
}

// =============================================================================
// Façade
// =============================================================================

struct Core {
    config: Arc<GovernorConfig>,
    backend: Arc<dyn DocumentBackend>,
    cache: Arc<CacheStore<CachedValue>>,
    quota: Arc<QuotaGovernor>,
    router: Arc<InvalidationRouter>,
    batcher: Arc<WriteBatcher>,
    listeners: Arc<ListenerRegistry>,
    poller: Arc<dyn SnapshotSource>,
    reads: ReadPathMetrics,
    exporter: PrometheusExporter,
    started_at: Instant,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    shutting_down: AtomicBool,
}

/// Quota-aware caching front for a metered document store.
///
/// Cheap to clone; every clone shares the same cache, counters and queue.
#[derive(Clone)]
pub struct SmartStore {
    core: Arc<Core>,
}

impl SmartStore {
    pub fn builder() -> SmartStoreBuilder {
        SmartStoreBuilder::default()
    }

    /// Governor over `backend` with the system clock and logging events
    pub fn new(config: GovernorConfig, backend: Arc<dyn DocumentBackend>) -> Result<Self> {
        Self::builder().config(config).backend(backend).build()
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Fetch one document, cache first.
    ///
    /// Never fails on quota: with reads denied the last cached state is
    /// returned (possibly stale), or `None` when nothing is cached.
    #[instrument(skip(self), level = "debug")]
    pub async fn smart_get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        let value = self.core.read_document(collection, id).await?;
        Ok(match value {
            Some(CachedValue::Document(doc)) => Some(doc),
            _ => None,
        })
    }

    /// Run an equality query, cached under its fingerprint
    #[instrument(skip(self, filters, options), level = "debug")]
    pub async fn smart_query(
        &self,
        collection: &str,
        filters: &Filters,
        options: &QueryOptions,
    ) -> Result<Vec<Document>> {
        let value = self.core.read_query(collection, filters, options).await?;
        Ok(match value {
            Some(CachedValue::Documents(docs)) => docs,
            _ => Vec::new(),
        })
    }

    /// Count matching documents; cached with the short count TTL
    #[instrument(skip(self, filters), level = "debug")]
    pub async fn smart_count(&self, collection: &str, filters: &Filters) -> Result<u64> {
        let value = self.core.read_count(collection, filters).await?;
        Ok(match value {
            Some(CachedValue::Count(n)) => n,
            _ => 0,
        })
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Apply a mutation now if the safety budget allows, else queue it.
    ///
    /// Reads issued after this returns observe the write either way.
    #[instrument(skip(self, data), level = "debug")]
    pub async fn smart_write(
        &self,
        collection: &str,
        id: &str,
        data: Payload,
        kind: WriteKind,
    ) -> Result<WriteOutcome> {
        let core = &self.core;
        if core.batcher.is_closed() {
            return Err(Error::ShuttingDown);
        }

        let scope = if kind.is_delete() {
            QuotaScope::Delete
        } else {
            QuotaScope::Write
        };
        let op = WriteOp::new(collection, id, kind, data);

        if core.quota.admits(scope, 1) {
            match core.commit_direct(&op).await {
                Ok(()) => {
                    core.quota.record(scope, 1);
                    core.apply_overlay(&op)?;
                    return Ok(WriteOutcome::Committed);
                }
                Err(e) if e.is_retryable() || matches!(e, Error::QuotaExceeded { .. }) => {
                    warn!(collection, id, error = %e, "Direct write failed; deferring to batcher");
                }
                Err(e) => {
                    // Backend state unknown; make the next read go to the store
                    core.router.on_write(collection, id);
                    return Err(e);
                }
            }
        } else {
            debug!(collection, id, %scope, "Write not admitted; deferring to batcher");
        }

        // Overlay is computed before the op moves into the queue
        let overlay = core.overlay_for(&op);
        let ticket = core.batcher.enqueue_with_ticket(op)?;
        core.router.write_through(collection, id, overlay)?;
        Ok(WriteOutcome::Deferred { ticket })
    }

    /// `smart_write`, then wait for a deferred write to commit or be dropped
    pub async fn smart_write_and_wait(
        &self,
        collection: &str,
        id: &str,
        data: Payload,
        kind: WriteKind,
    ) -> Result<()> {
        self.smart_write(collection, id, data, kind).await?.wait().await
    }

    /// Commit queued writes now, as far as quota allows
    pub async fn flush_now(&self) -> FlushReport {
        self.core.batcher.flush_now().await
    }

    // =========================================================================
    // Listeners
    // =========================================================================

    /// Poll `target` and call `on_change` whenever its value differs from the
    /// last delivery. Fails with `ListenerLimitReached` at the cap.
    pub fn subscribe<F>(
        &self,
        collection: &str,
        target: Target,
        on_change: F,
    ) -> Result<Subscription>
    where
        F: Fn(Snapshot) + Send + Sync + 'static,
    {
        if self.core.shutting_down.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        self.core.listeners.subscribe(
            collection,
            target,
            self.core.poller.clone(),
            Arc::new(on_change),
        )
    }

    // =========================================================================
    // Invalidation
    // =========================================================================

    /// Drop a document and the collection's derived entries from the cache
    pub fn invalidate(&self, collection: &str, id: &str) -> usize {
        self.core.router.on_write(collection, id)
    }

    pub fn invalidate_collection(&self, collection: &str) -> usize {
        self.core.router.invalidate_collection(collection)
    }

    // =========================================================================
    // Observability
    // =========================================================================

    pub fn stats(&self) -> GovernorStats {
        self.core.stats()
    }

    pub fn health(&self) -> HealthReport {
        HealthReport::evaluate(
            &self.core.stats(),
            self.core.shutting_down.load(Ordering::Acquire),
        )
    }

    /// Refresh the exporter and render it.
    /// Returns the content type and the body.
    pub fn metrics_text(&self) -> Result<(String, Vec<u8>)> {
        self.core.exporter.update(&self.core.stats());
        self.core.exporter.encode()
    }

    pub fn mode(&self) -> GovernorMode {
        self.core.quota.mode()
    }

    /// Account for operations spent before this process started
    pub fn seed_daily_usage(&self, scope: QuotaScope, used: u64) {
        self.core.quota.seed_daily_usage(scope, used);
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.core.config
    }

    pub fn quota(&self) -> &Arc<QuotaGovernor> {
        &self.core.quota
    }

    pub fn cache(&self) -> &Arc<CacheStore<CachedValue>> {
        &self.core.cache
    }

    pub fn batcher(&self) -> &Arc<WriteBatcher> {
        &self.core.batcher
    }

    pub fn listeners(&self) -> &Arc<ListenerRegistry> {
        &self.core.listeners
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Spawn the background tasks: quota ticker and daily reset, batch
    /// flusher, cache sweeper and stats reporter. Calling it again is a no-op.
    pub fn start(&self) {
        let core = &self.core;
        if core.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut tasks = core.tasks.lock();
        tasks.push(tokio::spawn(
            core.quota.clone().run(core.cancel.child_token()),
        ));
        tasks.push(tokio::spawn(
            core.batcher.clone().run(core.cancel.child_token()),
        ));
        tasks.push(tokio::spawn(sweep_loop(
            core.clone(),
            core.cancel.child_token(),
        )));
        tasks.push(tokio::spawn(report_loop(
            core.clone(),
            core.cancel.child_token(),
        )));

        info!(tasks = tasks.len(), "Governor started");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.core.shutting_down.load(Ordering::Acquire)
    }

    /// Stop listeners, drain what the quota allows, then stop every task.
    /// Writes that still cannot commit are failed and their overlays dropped.
    pub async fn shutdown(&self) {
        let core = &self.core;
        if core.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Governor shutting down");

        core.listeners.stop_all().await;
        core.batcher.close();

        let report = core.batcher.flush_now().await;
        if report.remaining > 0 {
            warn!(remaining = report.remaining, "Quota left writes queued at shutdown");
            core.batcher.discard_queued();
        }

        core.cancel.cancel();
        let tasks = std::mem::take(&mut *core.tasks.lock());
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Governor shutdown complete");
    }
}

impl std::fmt::Debug for SmartStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmartStore")
            .field("backend", &self.core.backend.name())
            .field("mode", &self.core.quota.mode())
            .field("cached", &self.core.cache.len())
            .field("queued", &self.core.batcher.len())
            .finish()
    }
}

// =============================================================================
// Core internals
// =============================================================================

impl Core {
    async fn read_document(&self, collection: &str, id: &str) -> Result<Option<CachedValue>> {
        let key = CacheKey::document(collection, id);
        let fetch = self.fetch_document(collection, id);
        self.cached_read("get", key, self.config.ttl_for(collection), fetch)
            .await
    }

    async fn read_query(
        &self,
        collection: &str,
        filters: &Filters,
        options: &QueryOptions,
    ) -> Result<Option<CachedValue>> {
        let key = CacheKey::query(collection, query_fingerprint(collection, filters, options));
        let fetch = async {
            self.backend
                .query(collection, filters, options)
                .await
                .map(CachedValue::Documents)
        };
        self.cached_read("query", key, self.config.query_ttl_for(collection), fetch)
            .await
    }

    async fn read_count(&self, collection: &str, filters: &Filters) -> Result<Option<CachedValue>> {
        let key = CacheKey::count(collection, count_fingerprint(collection, filters));
        let fetch = async {
            self.backend
                .count(collection, filters)
                .await
                .map(CachedValue::Count)
        };
        self.cached_read("count", key, self.config.count_ttl(), fetch)
            .await
    }

    /// Backend state of one document with writes still in the batcher folded
    /// on top.
    ///
    /// A flush that commits while the backend call is in flight takes its
    /// writes out of the batcher, and the fetched state may predate them. The
    /// flush moves the collection generation when it does, so a moved
    /// generation means fetch again.
    async fn fetch_document(&self, collection: &str, id: &str) -> Result<CachedValue> {
        let mut fetches = 1;
        loop {
            let observed = self.router.generation(collection);
            let doc = self.backend.get(collection, id).await?;
            let pending = self.batcher.pending_ops(collection, id);
            if self.router.generation(collection) == observed || fetches == MAX_DOCUMENT_FETCHES {
                return Ok(pending
                    .into_iter()
                    .fold(CachedValue::from_lookup(doc), apply_op));
            }
            // The discarded answer was still billed by the store
            self.quota.record_read(1);
            self.reads.record_backend_read();
            debug!(collection, id, fetches, "Collection changed during read; fetching again");
            fetches += 1;
        }
    }

    /// Cache-first read with quota admission and stale fallback.
    ///
    /// `Ok(None)` means no answer is available without spending quota.
    async fn cached_read(
        &self,
        operation: &'static str,
        key: CacheKey,
        ttl: Duration,
        fetch: impl Future<Output = Result<CachedValue>>,
    ) -> Result<Option<CachedValue>> {
        let stale = match self.cache.lookup(&key) {
            Lookup::Fresh(value) => return Ok(Some(value)),
            Lookup::Stale(value) => Some(value),
            Lookup::Miss => None,
        };

        if !self.quota.can_read(1) {
            self.reads.record_denied();
            debug!(key = %key, mode = %self.quota.mode(), "Read not admitted");
            return Ok(self.serve_stale(stale));
        }

        let observed = self.router.generation(key.collection());
        match with_timeout(operation, self.config.backend_timeout(), fetch).await {
            Ok(value) => {
                self.quota.record_read(billed_reads(&value));
                self.reads.record_backend_read();
                if let Err(e) = self
                    .router
                    .populate_if_current(key.clone(), value.clone(), ttl, observed)
                {
                    warn!(key = %key, error = %e, "Failed to cache backend result");
                }
                Ok(Some(value))
            }
            Err(Error::QuotaExceeded { scope, reason }) => {
                self.reads.record_denied();
                warn!(key = %key, %scope, %reason, "Backend refused read on quota");
                Ok(self.serve_stale(stale))
            }
            Err(e) => {
                self.reads.record_backend_error();
                warn!(key = %key, error = %e, "Backend read failed");
                match self.serve_stale(stale) {
                    Some(value) => Ok(Some(value)),
                    None => Err(e),
                }
            }
        }
    }

    fn serve_stale(&self, stale: Option<CachedValue>) -> Option<CachedValue> {
        if stale.is_some() {
            self.reads.record_stale_served();
        }
        stale
    }

    async fn commit_direct(&self, op: &WriteOp) -> Result<()> {
        let (c, id) = (op.collection.as_str(), op.id.as_str());
        let limit = self.config.backend_timeout();
        match op.kind {
            WriteKind::Set => {
                with_timeout("set", limit, self.backend.set(c, id, &op.payload)).await
            }
            WriteKind::Update => {
                with_timeout("update", limit, self.backend.update(c, id, &op.payload)).await
            }
            WriteKind::Delete => with_timeout("delete", limit, self.backend.delete(c, id)).await,
        }
    }

    /// Post-write document state when it is known without a read:
    /// the payload of a set, absence after a delete, or an update merged
    /// into a fresh cached copy
    fn overlay_for(&self, op: &WriteOp) -> Option<(CachedValue, Duration)> {
        let ttl = self.config.ttl_for(&op.collection);
        match op.kind {
            WriteKind::Set => Some((
                CachedValue::Document(Document::new(
                    op.collection.clone(),
                    op.id.clone(),
                    op.payload.clone(),
                )),
                ttl,
            )),
            WriteKind::Delete => Some((CachedValue::Absent, ttl)),
            WriteKind::Update => {
                let key = CacheKey::document(op.collection.clone(), op.id.clone());
                match self.cache.peek(&key) {
                    Some(cached @ CachedValue::Document(_)) => {
                        Some((apply_op(cached, op.clone()), ttl))
                    }
                    _ => None,
                }
            }
        }
    }

    fn apply_overlay(&self, op: &WriteOp) -> Result<()> {
        let overlay = self.overlay_for(op);
        self.router.write_through(&op.collection, &op.id, overlay)?;
        Ok(())
    }

    fn stats(&self) -> GovernorStats {
        let cache = self.cache.stats();
        let quota = self.quota.snapshot();
        GovernorStats {
            mode: quota.mode,
            hit_rate: cache.hit_ratio,
            cache,
            quota,
            reads: self.reads.snapshot(),
            batcher: self.batcher.stats(),
            listeners: self.listeners.stats(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            generated_at: Utc::now(),
        }
    }
}

/// Document state after `op`. Updates of a missing document create it,
/// as the backends do.
fn apply_op(value: CachedValue, op: WriteOp) -> CachedValue {
    match op.kind {
        WriteKind::Set => CachedValue::Document(Document::new(op.collection, op.id, op.payload)),
        WriteKind::Delete => CachedValue::Absent,
        WriteKind::Update => {
            let mut doc = match value {
                CachedValue::Document(doc) => doc,
                _ => Document::new(op.collection, op.id, Payload::new()),
            };
            doc.data.extend(op.payload);
            doc.fetched_at = Utc::now();
            CachedValue::Document(doc)
        }
    }
}

/// Reads a backend answer is billed as: one per document returned by a
/// query, one per thousand documents counted, never less than one
fn billed_reads(value: &CachedValue) -> u64 {
    match value {
        CachedValue::Document(_) | CachedValue::Absent => 1,
        CachedValue::Documents(docs) => (docs.len() as u64).max(1),
        CachedValue::Count(n) => n.div_ceil(COUNT_DOCS_PER_READ).max(1),
    }
}

async fn with_timeout<T>(
    operation: &str,
    limit: Duration,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    match timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(Error::BackendTimeout {
            operation: operation.to_string(),
            timeout: limit,
        }),
    }
}

// =============================================================================
// Listener polling
// =============================================================================

/// Listener reads. They take the same cache-first path as `smart_get` and
/// `smart_query`, so a fresh entry answers a poll without spending quota.
struct PollSource {
    core: Weak<Core>,
}

#[async_trait]
impl SnapshotSource for PollSource {
    async fn snapshot(&self, collection: &str, target: &Target) -> Result<Snapshot> {
        let core = self.core.upgrade().ok_or(Error::ShuttingDown)?;
        let value = match target {
            Target::Document(id) => core.read_document(collection, id).await?,
            Target::Query { filters, options } => {
                core.read_query(collection, filters, options).await?
            }
        };
        match value {
            Some(CachedValue::Document(doc)) => Ok(Snapshot::Document(Some(doc))),
            Some(CachedValue::Absent) => Ok(Snapshot::Document(None)),
            Some(CachedValue::Documents(docs)) => Ok(Snapshot::Query(docs)),
            Some(CachedValue::Count(_)) => Err(Error::Internal(format!(
                "count cached under a listener key in {collection}"
            ))),
            // Nothing cached and no quota to fetch: skip this tick
            None => Err(Error::quota(QuotaScope::Read, "listener poll not admitted")),
        }
    }
}

// =============================================================================
// Background tasks
// =============================================================================

async fn sweep_loop(core: Arc<Core>, cancel: CancellationToken) {
    let mut tick = interval(core.config.sweep_interval());
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                let purged = core.cache.purge_expired();
                let pruned = core.router.prune_index();
                if purged > 0 || pruned > 0 {
                    debug!(purged, pruned, "Swept cache");
                }
            }
        }
    }
}

async fn report_loop(core: Arc<Core>, cancel: CancellationToken) {
    let mut tick = interval(core.config.stats_interval());
    // First tick fires immediately; skip it so the report covers a full period
    tick.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                let stats = core.stats();
                core.exporter.update(&stats);
                info!(
                    mode = %stats.mode,
                    hit_rate = stats.hit_rate,
                    reads_pct = stats.read_usage_percent(),
                    writes_pct = stats.write_usage_percent(),
                    deletes_pct = stats.delete_usage_percent(),
                    queued = stats.batcher.queued,
                    listeners = stats.listeners.active,
                    "Governor stats"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryDocumentBackend, InMemoryEventCollector};
    use assert_matches::assert_matches;
    use serde_json::{json, Value};

    fn payload(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            _ => Payload::new(),
        }
    }

    fn store_with(config: GovernorConfig) -> (SmartStore, Arc<InMemoryDocumentBackend>) {
        let backend = Arc::new(InMemoryDocumentBackend::new());
        let store = SmartStore::builder()
            .config(config)
            .backend(backend.clone())
            .events(Arc::new(InMemoryEventCollector::new()))
            .build()
            .unwrap();
        (store, backend)
    }

    #[test]
    fn test_builder_requires_backend() {
        let result = SmartStore::builder().build();
        assert_matches!(result, Err(Error::Config(_)));
    }

    #[test]
    fn test_billed_reads() {
        assert_eq!(billed_reads(&CachedValue::Absent), 1);
        assert_eq!(billed_reads(&CachedValue::Documents(Vec::new())), 1);
        assert_eq!(billed_reads(&CachedValue::Count(0)), 1);
        assert_eq!(billed_reads(&CachedValue::Count(1000)), 1);
        assert_eq!(billed_reads(&CachedValue::Count(1001)), 2);

        let doc = Document::new("users", "1", Payload::new());
        assert_eq!(billed_reads(&CachedValue::Documents(vec![doc.clone(), doc])), 2);
    }

    #[tokio::test]
    async fn test_get_caches_and_absent_is_cached() {
        let (store, backend) = store_with(GovernorConfig::default());
        backend.insert("users", "1", payload(json!({"name": "Ada"})));

        let doc = store.smart_get("users", "1").await.unwrap().unwrap();
        assert_eq!(doc.field("name"), Some(&json!("Ada")));
        assert!(store.smart_get("users", "1").await.unwrap().is_some());
        assert_eq!(backend.stats().gets, 1);

        assert!(store.smart_get("users", "missing").await.unwrap().is_none());
        assert!(store.smart_get("users", "missing").await.unwrap().is_none());
        assert_eq!(backend.stats().gets, 2);
        assert_eq!(store.quota().usage(QuotaScope::Read).daily_used, 2);
    }

    #[tokio::test]
    async fn test_update_merges_into_cached_copy() {
        let (store, backend) = store_with(GovernorConfig::default());
        backend.insert("users", "1", payload(json!({"name": "Ada", "age": 36})));
        store.smart_get("users", "1").await.unwrap();

        let outcome = store
            .smart_write("users", "1", payload(json!({"age": 37})), WriteKind::Update)
            .await
            .unwrap();
        assert!(outcome.is_committed());

        let doc = store.smart_get("users", "1").await.unwrap().unwrap();
        assert_eq!(doc.field("age"), Some(&json!(37)));
        assert_eq!(doc.field("name"), Some(&json!("Ada")));
        // served from the merged overlay
        assert_eq!(backend.stats().gets, 1);
    }

    #[tokio::test]
    async fn test_delete_caches_absence() {
        let (store, backend) = store_with(GovernorConfig::default());
        backend.insert("users", "1", payload(json!({"name": "Ada"})));

        store
            .smart_write("users", "1", Payload::new(), WriteKind::Delete)
            .await
            .unwrap();
        assert!(store.smart_get("users", "1").await.unwrap().is_none());
        assert_eq!(backend.stats().gets, 0);
        assert_eq!(store.quota().usage(QuotaScope::Delete).daily_used, 1);
    }

    #[tokio::test]
    async fn test_retryable_direct_failure_defers() {
        let (store, backend) = store_with(GovernorConfig::default());
        backend.fail_next(1);

        let outcome = store
            .smart_write("users", "1", payload(json!({"v": 1})), WriteKind::Set)
            .await
            .unwrap();
        assert!(outcome.is_deferred());
        assert_eq!(store.batcher().len(), 1);

        let report = store.flush_now().await;
        assert_eq!(report.committed, 1);
        outcome.wait().await.unwrap();
        assert_eq!(backend.peek("users", "1"), Some(payload(json!({"v": 1}))));
    }

    #[test]
    fn test_apply_op() {
        let update = WriteOp::new("users", "1", WriteKind::Update, payload(json!({"b": 2})));
        let base = CachedValue::Document(Document::new("users", "1", payload(json!({"a": 1}))));

        let merged = apply_op(base, update.clone());
        assert_matches!(
            &merged,
            CachedValue::Document(doc) if doc.data == payload(json!({"a": 1, "b": 2}))
        );

        let created = apply_op(CachedValue::Absent, update);
        assert_matches!(
            &created,
            CachedValue::Document(doc) if doc.data == payload(json!({"b": 2}))
        );

        let delete = WriteOp::new("users", "1", WriteKind::Delete, Payload::new());
        let deleted = apply_op(merged, delete);
        assert_eq!(deleted, CachedValue::Absent);
    }

    #[tokio::test]
    async fn test_deferred_update_visible_without_cached_copy() {
        // budget floor(4 * 0.8) = 3, usage stays below the emergency threshold
        let config = GovernorConfig {
            daily_write_limit: 4,
            ..Default::default()
        };
        let (store, backend) = store_with(config);
        backend.insert("users", "1", payload(json!({"name": "Ada", "age": 36})));

        for i in 0..3 {
            let outcome = store
                .smart_write("logs", &i.to_string(), payload(json!({"i": i})), WriteKind::Set)
                .await
                .unwrap();
            assert!(outcome.is_committed());
        }
        let outcome = store
            .smart_write("users", "1", payload(json!({"age": 37})), WriteKind::Update)
            .await
            .unwrap();
        assert!(outcome.is_deferred());

        let doc = store.smart_get("users", "1").await.unwrap().unwrap();
        assert_eq!(doc.field("age"), Some(&json!(37)));
        assert_eq!(doc.field("name"), Some(&json!("Ada")));
        // backend itself still has the old value
        assert_eq!(backend.peek("users", "1"), Some(payload(json!({"name": "Ada", "age": 36}))));
    }

    #[tokio::test]
    async fn test_count_degrades_to_zero_without_quota() {
        let config = GovernorConfig {
            daily_read_limit: 1,
            safety_margin: 1.0,
            ..Default::default()
        };
        let (store, backend) = store_with(config);
        backend.insert("orders", "1", Payload::new());

        let filters = Filters::new();
        assert_eq!(store.smart_count("orders", &filters).await.unwrap(), 1);
        assert_eq!(store.mode(), GovernorMode::Emergency);
        assert_eq!(store.smart_count("other", &filters).await.unwrap(), 0);
        assert_eq!(store.stats().reads.denied, 1);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_writes() {
        let (store, _backend) = store_with(GovernorConfig::default());
        store.start();
        store.start();
        store.shutdown().await;

        let result = store
            .smart_write("users", "1", Payload::new(), WriteKind::Set)
            .await;
        assert_matches!(result, Err(Error::ShuttingDown));
        assert!(!store.health().status.is_operational());
    }

    #[tokio::test]
    async fn test_metrics_text_reflects_usage() {
        let (store, backend) = store_with(GovernorConfig::default());
        backend.insert("users", "1", Payload::new());
        store.smart_get("users", "1").await.unwrap();

        let (_, body) = store.metrics_text().unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("docgate_quota_daily_used{scope=\"read\"} 1"));
        assert!(text.contains("docgate_cache_entries 1"));
    }
}
