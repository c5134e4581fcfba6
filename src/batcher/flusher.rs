//! Write Batcher - queue and flush loop

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::{interval, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::pending::{PendingWrite, WriteTicket};
use crate::config::GovernorConfig;
use crate::domain::events::DomainEvent;
use crate::domain::ports::{DocumentBackend, EventPublisher, WriteOp};
use crate::error::{Error, Result};
use crate::invalidation::InvalidationRouter;
use crate::quota::{QuotaGovernor, QuotaScope};

/// Batcher configuration
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// Queue length that triggers an early flush
    pub batch_size: usize,
    pub flush_interval: Duration,
    /// Operations per backend commit
    pub max_ops_per_commit: usize,
    /// Retries after the first failed attempt
    pub max_retries: u32,
    /// Base delay, doubled per retry
    pub retry_backoff: Duration,
    pub commit_timeout: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self::from(&GovernorConfig::default())
    }
}

impl From<&GovernorConfig> for BatcherConfig {
    fn from(config: &GovernorConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            flush_interval: config.flush_interval(),
            max_ops_per_commit: config.max_batch_ops_per_commit,
            max_retries: config.max_commit_retries,
            retry_backoff: config.retry_backoff(),
            commit_timeout: config.backend_timeout(),
        }
    }
}

/// Outcome of one flush cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushReport {
    pub committed: usize,
    pub commits: usize,
    pub dropped: usize,
    /// Writes still queued afterwards
    pub remaining: usize,
}

/// Lifetime counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatcherStats {
    pub queued: usize,
    pub enqueued: u64,
    pub committed: u64,
    pub commits: u64,
    pub retries: u64,
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct BatcherCounters {
    enqueued: AtomicU64,
    committed: AtomicU64,
    commits: AtomicU64,
    retries: AtomicU64,
    dropped: AtomicU64,
}

/// How one chunk's commit ended
enum ChunkOutcome {
    Committed,
    /// Budget or remote quota says not now; chunk went back to the queue
    Deferred,
    Dropped,
}

/// Buffers writes and commits them in bounded batches
pub struct WriteBatcher {
    config: BatcherConfig,
    backend: Arc<dyn DocumentBackend>,
    quota: Arc<QuotaGovernor>,
    router: Arc<InvalidationRouter>,
    events: Arc<dyn EventPublisher>,
    queue: Mutex<VecDeque<PendingWrite>>,
    /// Ops taken off the queue by the running flush, until it has invalidated
    inflight: Mutex<Vec<WriteOp>>,
    /// Held for the duration of a flush so only one runs at a time
    flushing: tokio::sync::Mutex<()>,
    full: Notify,
    closed: AtomicBool,
    counters: BatcherCounters,
}

impl WriteBatcher {
    pub fn new(
        mut config: BatcherConfig,
        backend: Arc<dyn DocumentBackend>,
        quota: Arc<QuotaGovernor>,
        router: Arc<InvalidationRouter>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        config.max_ops_per_commit = config
            .max_ops_per_commit
            .min(backend.max_batch_ops())
            .max(1);
        Self {
            config,
            backend,
            quota,
            router,
            events,
            queue: Mutex::new(VecDeque::new()),
            inflight: Mutex::new(Vec::new()),
            flushing: tokio::sync::Mutex::new(()),
            full: Notify::new(),
            closed: AtomicBool::new(false),
            counters: BatcherCounters::default(),
        }
    }

    pub fn config(&self) -> &BatcherConfig {
        &self.config
    }

    /// Queue a write without waiting for its outcome
    pub fn enqueue(&self, op: WriteOp) -> Result<()> {
        self.push(PendingWrite::new(op))
    }

    /// Queue a write and get a ticket that resolves on commit or drop
    pub fn enqueue_with_ticket(&self, op: WriteOp) -> Result<WriteTicket> {
        let (pending, ticket) = PendingWrite::with_ticket(op);
        self.push(pending)?;
        Ok(ticket)
    }

    fn push(&self, pending: PendingWrite) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        let len = {
            let mut queue = self.queue.lock();
            queue.push_back(pending);
            queue.len()
        };
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        debug!(queued = len, "Queued write");
        if len >= self.config.batch_size {
            self.full.notify_one();
        }
        Ok(())
    }

    /// Uncommitted ops for one document, oldest first.
    ///
    /// Ops leave the queue for `inflight` under the queue lock, and both
    /// locks are taken here in that order, so an op is never missed while it
    /// moves between them.
    pub fn pending_ops(&self, collection: &str, id: &str) -> Vec<WriteOp> {
        let same_doc = |op: &WriteOp| op.collection == collection && op.id == id;
        let queue = self.queue.lock();
        let inflight = self.inflight.lock();
        let ops: Vec<WriteOp> = inflight
            .iter()
            .chain(queue.iter().map(|p| &p.op))
            .filter(|op| same_doc(op))
            .cloned()
            .collect();
        ops
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Refuse further writes; queued ones stay until flushed
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> BatcherStats {
        BatcherStats {
            queued: self.len(),
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            committed: self.counters.committed.load(Ordering::Relaxed),
            commits: self.counters.commits.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    // =========================================================================
    // Flushing
    // =========================================================================

    /// Commit as much of the queue as the quota allows.
    ///
    /// The per-second window is consulted before the first commit only. Once
    /// a flush has started it splits the whole admissible queue into bounded
    /// commits, limited by the daily hard budget alone.
    #[instrument(skip(self))]
    pub async fn flush_now(&self) -> FlushReport {
        let _guard = self.flushing.lock().await;
        let started = Instant::now();
        let mut report = FlushReport::default();
        // Committed and dropped keys; both make cached overlays stale
        let mut touched: Vec<(String, String)> = Vec::new();
        let mut first = true;

        while let Some(chunk) = self.take_chunk() {
            let n = chunk.len();
            let keys: Vec<(String, String)> = chunk
                .iter()
                .map(|p| (p.op.collection.clone(), p.op.id.clone()))
                .collect();

            let outcome = self.commit_chunk(chunk, first).await;
            first = false;
            match outcome {
                ChunkOutcome::Committed => {
                    report.committed += n;
                    report.commits += 1;
                    touched.extend(keys);
                }
                ChunkOutcome::Deferred => break,
                ChunkOutcome::Dropped => {
                    report.dropped += n;
                    touched.extend(keys);
                    break;
                }
            }
        }

        if !touched.is_empty() {
            self.router
                .on_writes(touched.iter().map(|(c, id)| (c.as_str(), id.as_str())));
        }
        self.inflight.lock().clear();

        report.remaining = self.len();
        if report.committed > 0 {
            info!(
                committed = report.committed,
                commits = report.commits,
                remaining = report.remaining,
                "Flushed write batch"
            );
            self.events.publish(DomainEvent::BatchFlushed {
                committed: report.committed,
                commits: report.commits,
                remaining: report.remaining,
                duration_ms: started.elapsed().as_millis() as u64,
                timestamp: Utc::now(),
            });
        }
        report
    }

    /// Pop the next chunk: at most `max_ops_per_commit` ops, in queue order,
    /// stopping at the first op that would overrun today's hard budget. The
    /// chunk's ops are marked in flight before the queue lock is released.
    fn take_chunk(&self) -> Option<Vec<PendingWrite>> {
        let mut write_budget = self.quota.remaining_hard(QuotaScope::Write);
        let mut delete_budget = self.quota.remaining_hard(QuotaScope::Delete);

        let mut queue = self.queue.lock();
        let mut chunk = Vec::new();
        while chunk.len() < self.config.max_ops_per_commit {
            let Some(front) = queue.front() else { break };
            let budget = if front.op.kind.is_delete() {
                &mut delete_budget
            } else {
                &mut write_budget
            };
            if *budget == 0 {
                break;
            }
            *budget -= 1;
            if let Some(pending) = queue.pop_front() {
                chunk.push(pending);
            }
        }
        self.inflight
            .lock()
            .extend(chunk.iter().map(|p| p.op.clone()));

        if chunk.is_empty() {
            if !queue.is_empty() {
                debug!(queued = queue.len(), "Daily budget spent; writes stay queued");
            }
            None
        } else {
            Some(chunk)
        }
    }

    /// Put an uncommitted chunk back at the front of the queue. It was the
    /// last chunk marked in flight, so its ops are the tail of `inflight`.
    fn requeue(&self, chunk: Vec<PendingWrite>) {
        let mut queue = self.queue.lock();
        {
            let mut inflight = self.inflight.lock();
            let keep = inflight.len().saturating_sub(chunk.len());
            inflight.truncate(keep);
        }
        for pending in chunk.into_iter().rev() {
            queue.push_front(pending);
        }
    }

    /// Commit one chunk. `check_window` is set for the first chunk of a
    /// flush; later chunks were already sized against the daily budget.
    async fn commit_chunk(
        &self,
        mut chunk: Vec<PendingWrite>,
        check_window: bool,
    ) -> ChunkOutcome {
        let deletes = chunk.iter().filter(|p| p.op.kind.is_delete()).count() as u64;
        let writes = chunk.len() as u64 - deletes;

        let window_open = !check_window
            || ((writes == 0 || self.quota.can_commit_writes(writes))
                && (deletes == 0 || self.quota.can_commit_deletes(deletes)));
        if !window_open {
            debug!(writes, deletes, "Rate window full; deferring chunk");
            self.requeue(chunk);
            return ChunkOutcome::Deferred;
        }

        let ops: Vec<WriteOp> = chunk.iter().map(|p| p.op.clone()).collect();
        let mut attempt: u32 = 0;

        loop {
            let result = match timeout(self.config.commit_timeout, self.backend.batch_commit(&ops))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(Error::BackendTimeout {
                    operation: "batch_commit".into(),
                    timeout: self.config.commit_timeout,
                }),
            };

            match result {
                Ok(()) => {
                    self.quota.record_batch(QuotaScope::Write, writes);
                    self.quota.record_batch(QuotaScope::Delete, deletes);
                    self.counters.commits.fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .committed
                        .fetch_add(chunk.len() as u64, Ordering::Relaxed);
                    for pending in chunk {
                        pending.complete();
                    }
                    return ChunkOutcome::Committed;
                }
                Err(Error::QuotaExceeded { scope, reason }) => {
                    warn!(%scope, %reason, "Backend refused batch on quota; deferring");
                    self.requeue(chunk);
                    return ChunkOutcome::Deferred;
                }
                Err(e) => {
                    attempt += 1;
                    for pending in chunk.iter_mut() {
                        pending.attempts += 1;
                    }
                    if e.is_retryable() && attempt <= self.config.max_retries {
                        let backoff = self.config.retry_backoff * 2u32.saturating_pow(attempt - 1);
                        warn!(attempt, ?backoff, error = %e, "Batch commit failed; retrying");
                        self.counters.retries.fetch_add(1, Ordering::Relaxed);
                        sleep(backoff).await;
                        continue;
                    }
                    self.drop_chunk(chunk, &e);
                    return ChunkOutcome::Dropped;
                }
            }
        }
    }

    fn drop_chunk(&self, chunk: Vec<PendingWrite>, cause: &Error) {
        let reason = cause.to_string();
        let keys: Vec<String> = chunk.iter().map(PendingWrite::key).collect();
        error!(count = keys.len(), error = %reason, "Dropping writes after failed commits");
        self.counters
            .dropped
            .fetch_add(chunk.len() as u64, Ordering::Relaxed);
        self.events.publish(DomainEvent::WritesDropped {
            count: keys.len(),
            keys,
            reason: reason.clone(),
            timestamp: Utc::now(),
        });
        for pending in chunk {
            pending.fail(&reason);
        }
    }

    /// Fail every queued write without committing it and invalidate the
    /// documents they touched. Used once the batcher is closed for good.
    pub fn discard_queued(&self) -> usize {
        let drained: Vec<PendingWrite> = self.queue.lock().drain(..).collect();
        if drained.is_empty() {
            return 0;
        }
        let n = drained.len();
        self.router.on_writes(
            drained
                .iter()
                .map(|p| (p.op.collection.as_str(), p.op.id.as_str())),
        );
        self.drop_chunk(drained, &Error::ShuttingDown);
        n
    }

    /// Background flush loop: on every interval tick and whenever the queue
    /// reaches `batch_size`
    #[instrument(skip(self, cancel))]
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("Starting write batcher with {:?}", self.config);

        let mut tick = interval(self.config.flush_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Write batcher shutting down");
                    break;
                }
                _ = tick.tick() => {
                    if !self.is_empty() {
                        self.flush_now().await;
                    }
                }
                _ = self.full.notified() => {
                    self.flush_now().await;
                }
            }
        }
    }
}

impl std::fmt::Debug for WriteBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBatcher")
            .field("config", &self.config)
            .field("queued", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryDocumentBackend, InMemoryEventCollector};
    use crate::cache::{CacheKey, CacheStore, CachedValue};
    use crate::clock::SystemClock;
    use crate::domain::ports::{Payload, WriteKind};
    use assert_matches::assert_matches;
    use serde_json::json;

    struct Harness {
        backend: Arc<InMemoryDocumentBackend>,
        quota: Arc<QuotaGovernor>,
        cache: Arc<CacheStore<CachedValue>>,
        events: Arc<InMemoryEventCollector>,
        batcher: WriteBatcher,
    }

    fn harness(governor: GovernorConfig, backend: InMemoryDocumentBackend) -> Harness {
        let backend = Arc::new(backend);
        let events = Arc::new(InMemoryEventCollector::new());
        let quota = Arc::new(QuotaGovernor::new(
            &governor,
            Arc::new(SystemClock),
            events.clone(),
        ));
        let cache = Arc::new(CacheStore::new());
        let router = Arc::new(InvalidationRouter::new(cache.clone()));
        let config = BatcherConfig {
            retry_backoff: Duration::from_millis(1),
            ..BatcherConfig::from(&governor)
        };
        let batcher = WriteBatcher::new(
            config,
            backend.clone(),
            quota.clone(),
            router,
            events.clone(),
        );
        Harness {
            backend,
            quota,
            cache,
            events,
            batcher,
        }
    }

    fn roomy() -> GovernorConfig {
        GovernorConfig {
            daily_write_limit: 1_000_000,
            daily_delete_limit: 1_000_000,
            per_second_write_limit: 1_000_000,
            per_second_delete_limit: 1_000_000,
            ..Default::default()
        }
    }

    fn op(id: usize) -> WriteOp {
        let mut payload = Payload::new();
        payload.insert("n".into(), json!(id));
        WriteOp::new("orders", id.to_string(), WriteKind::Set, payload)
    }

    #[tokio::test]
    async fn test_flush_splits_into_bounded_commits() {
        let h = harness(roomy(), InMemoryDocumentBackend::with_max_batch_ops(500));
        for i in 0..1201 {
            h.batcher.enqueue(op(i)).unwrap();
        }

        let report = h.batcher.flush_now().await;
        assert_eq!(report.committed, 1201);
        assert_eq!(report.commits, 3);
        assert_eq!(report.remaining, 0);
        assert_eq!(h.backend.commit_log(), vec![500, 500, 201]);
        assert_eq!(h.quota.usage(QuotaScope::Write).daily_used, 1201);
        assert_eq!(h.events.events_of_type("BatchFlushed").len(), 1);
    }

    #[tokio::test]
    async fn test_flush_splits_under_default_rate_window() {
        let config = GovernorConfig {
            daily_write_limit: 1_000_000,
            ..Default::default()
        };
        let h = harness(config, InMemoryDocumentBackend::with_max_batch_ops(500));
        for i in 0..1201 {
            h.batcher.enqueue(op(i)).unwrap();
        }

        let report = h.batcher.flush_now().await;
        assert_eq!(report.commits, 3);
        assert_eq!(report.remaining, 0);
        assert_eq!(h.backend.commit_log(), vec![500, 500, 201]);
        assert_eq!(h.quota.mode(), crate::quota::GovernorMode::Normal);
    }

    #[tokio::test]
    async fn test_full_window_defers_flush_start() {
        let h = harness(GovernorConfig::default(), InMemoryDocumentBackend::new());
        h.quota.record_write(50);
        for i in 0..3 {
            h.batcher.enqueue(op(i)).unwrap();
        }

        let report = h.batcher.flush_now().await;
        assert_eq!(report.commits, 0);
        assert_eq!(report.remaining, 3);
        assert!(h.backend.commit_log().is_empty());
        // The requeued chunk is reported once, not once per place it visited
        assert_eq!(h.batcher.pending_ops("orders", "0").len(), 1);

        h.quota.reset_window();
        let report = h.batcher.flush_now().await;
        assert_eq!(report.committed, 3);
    }

    #[tokio::test]
    async fn test_commit_size_capped_by_backend_ceiling() {
        let config = GovernorConfig {
            max_batch_ops_per_commit: 500,
            ..roomy()
        };
        let h = harness(config, InMemoryDocumentBackend::with_max_batch_ops(4));
        for i in 0..10 {
            h.batcher.enqueue(op(i)).unwrap();
        }
        h.batcher.flush_now().await;
        assert_eq!(h.backend.commit_log(), vec![4, 4, 2]);
    }

    #[tokio::test]
    async fn test_flush_respects_hard_budget() {
        let config = GovernorConfig {
            daily_write_limit: 10,
            ..roomy()
        };
        let h = harness(config, InMemoryDocumentBackend::new());
        h.quota.record_write(8);
        for i in 0..5 {
            h.batcher.enqueue(op(i)).unwrap();
        }

        let report = h.batcher.flush_now().await;
        assert_eq!(report.committed, 2);
        assert_eq!(report.remaining, 3);
        assert_eq!(h.quota.usage(QuotaScope::Write).daily_used, 10);
        // Queue order preserved: the first two went out
        assert!(h.backend.peek("orders", "0").is_some());
        assert!(h.backend.peek("orders", "1").is_some());
        assert!(h.backend.peek("orders", "2").is_none());

        // Nothing more goes out until the budget resets
        let report = h.batcher.flush_now().await;
        assert_eq!(report.committed, 0);
        assert_eq!(report.remaining, 3);

        h.quota.reset_daily();
        let report = h.batcher.flush_now().await;
        assert_eq!(report.committed, 3);
        assert!(h.batcher.is_empty());
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let h = harness(roomy(), InMemoryDocumentBackend::new());
        h.backend.fail_next(2);
        let ticket = h.batcher.enqueue_with_ticket(op(1)).unwrap();

        let report = h.batcher.flush_now().await;
        assert_eq!(report.committed, 1);
        assert!(ticket.wait().await.is_ok());
        assert_eq!(h.batcher.stats().retries, 2);
    }

    #[tokio::test]
    async fn test_drop_after_retries_notifies_waiters() {
        let h = harness(roomy(), InMemoryDocumentBackend::new());
        h.backend.fail_next(10);
        let ticket = h.batcher.enqueue_with_ticket(op(1)).unwrap();
        h.batcher.enqueue(op(2)).unwrap();

        let report = h.batcher.flush_now().await;
        assert_eq!(report.dropped, 2);
        assert_eq!(report.remaining, 0);
        assert_matches!(
            ticket.wait().await,
            Err(Error::BatchCommitFailed { attempts: 4, .. })
        );
        assert_eq!(h.events.events_of_type("WritesDropped").len(), 1);
        assert_eq!(h.quota.usage(QuotaScope::Write).daily_used, 0);
    }

    #[tokio::test]
    async fn test_flush_invalidates_written_keys() {
        let h = harness(roomy(), InMemoryDocumentBackend::new());
        let key = CacheKey::document("orders", "1");
        h.cache
            .set(key.clone(), CachedValue::Absent, Duration::from_secs(60))
            .unwrap();
        h.batcher.enqueue(op(1)).unwrap();
        h.batcher.flush_now().await;
        assert!(!h.cache.contains(&key));
    }

    #[tokio::test]
    async fn test_closed_batcher_rejects() {
        let h = harness(roomy(), InMemoryDocumentBackend::new());
        h.batcher.close();
        assert_matches!(h.batcher.enqueue(op(1)), Err(Error::ShuttingDown));
    }

    #[tokio::test]
    async fn test_pending_ops_in_queue_order() {
        let h = harness(roomy(), InMemoryDocumentBackend::new());
        h.batcher.enqueue(op(1)).unwrap();
        h.batcher.enqueue(op(2)).unwrap();
        h.batcher
            .enqueue(WriteOp::new("orders", "1", WriteKind::Delete, Payload::new()))
            .unwrap();

        let pending = h.batcher.pending_ops("orders", "1");
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].kind, WriteKind::Set);
        assert_eq!(pending[1].kind, WriteKind::Delete);
        assert!(h.batcher.pending_ops("users", "1").is_empty());

        h.batcher.flush_now().await;
        assert!(h.batcher.pending_ops("orders", "1").is_empty());
    }

    #[tokio::test]
    async fn test_discard_fails_waiters() {
        let h = harness(roomy(), InMemoryDocumentBackend::new());
        let ticket = h.batcher.enqueue_with_ticket(op(1)).unwrap();
        h.batcher.enqueue(op(2)).unwrap();
        h.batcher.close();

        assert_eq!(h.batcher.discard_queued(), 2);
        assert!(h.batcher.is_empty());
        assert_eq!(h.batcher.stats().dropped, 2);
        assert_matches!(ticket.wait().await, Err(Error::BatchCommitFailed { .. }));
        assert_eq!(h.events.events_of_type("WritesDropped").len(), 1);
        assert_eq!(h.batcher.discard_queued(), 0);
    }

    #[tokio::test]
    async fn test_run_flushes_when_full() {
        let config = GovernorConfig {
            batch_size: 3,
            flush_interval_ms: 60_000,
            ..roomy()
        };
        let h = harness(config, InMemoryDocumentBackend::new());
        let batcher = Arc::new(h.batcher);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(batcher.clone().run(cancel.clone()));

        // Let the first interval tick pass on an empty queue
        sleep(Duration::from_millis(20)).await;
        for i in 0..3 {
            batcher.enqueue(op(i)).unwrap();
        }
        for _ in 0..100 {
            if batcher.is_empty() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(batcher.is_empty());
        assert_eq!(h.backend.commit_log(), vec![3]);

        cancel.cancel();
        task.await.unwrap();
    }
}
