//! Listener registry and poll loop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::listener::{Listener, ListenerInfo, ListenerState, OnChange, Subscription};
use crate::config::GovernorConfig;
use crate::domain::events::DomainEvent;
use crate::domain::ports::{EventPublisher, Snapshot, Target};
use crate::error::{Error, Result};
use crate::quota::{GovernorMode, QuotaGovernor};

/// Where listeners read their snapshots from. Implemented by the façade so
/// polls go through the cache and quota checks like any other read.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn snapshot(&self, collection: &str, target: &Target) -> Result<Snapshot>;
}

/// Synchronizer configuration
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub max_active_listeners: usize,
    pub poll_interval: Duration,
}

impl From<&GovernorConfig> for SyncConfig {
    fn from(config: &GovernorConfig) -> Self {
        Self {
            max_active_listeners: config.max_active_listeners,
            poll_interval: config.poll_interval(),
        }
    }
}

/// Listener counts by state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub active: usize,
    pub paused: usize,
    pub max: usize,
}

/// Owns every listener and enforces the active-listener cap
pub struct ListenerRegistry {
    config: SyncConfig,
    listeners: DashMap<Uuid, Arc<Listener>>,
    /// Reserved slots; may briefly lead `listeners.len()` during subscribe
    slots: AtomicUsize,
    quota: Arc<QuotaGovernor>,
    events: Arc<dyn EventPublisher>,
    /// Parent of every listener's token
    root: CancellationToken,
}

impl ListenerRegistry {
    pub fn new(
        config: SyncConfig,
        quota: Arc<QuotaGovernor>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            config,
            listeners: DashMap::new(),
            slots: AtomicUsize::new(0),
            quota,
            events,
            root: CancellationToken::new(),
        }
    }

    /// Register a listener and start polling. Fails with
    /// `ListenerLimitReached` once the cap is reached.
    pub fn subscribe(
        self: &Arc<Self>,
        collection: &str,
        target: Target,
        source: Arc<dyn SnapshotSource>,
        on_change: OnChange,
    ) -> Result<Subscription> {
        let max = self.config.max_active_listeners;
        if let Err(active) =
            self.slots
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
        {
            warn!(collection, active, max, "Rejecting subscription at listener cap");
            self.events.publish(DomainEvent::ListenerRejected {
                collection: collection.to_string(),
                active,
                max,
                timestamp: Utc::now(),
            });
            return Err(Error::ListenerLimitReached { active, max });
        }

        let listener = Arc::new(Listener::new(
            collection.to_string(),
            target,
            self.root.child_token(),
        ));
        self.listeners.insert(listener.id, listener.clone());

        let task = tokio::spawn(poll_loop(
            listener.clone(),
            source,
            on_change,
            self.quota.clone(),
            self.config.poll_interval,
        ));
        *listener.task.lock() = Some(task);

        info!(id = %listener.id, collection, "Listener subscribed");
        Ok(Subscription::new(listener, Arc::downgrade(self)))
    }

    /// Stop and forget a listener. Unknown ids are ignored.
    pub fn remove(&self, id: Uuid) {
        if let Some((_, listener)) = self.listeners.remove(&id) {
            listener.stop();
            self.slots.fetch_sub(1, Ordering::AcqRel);
            debug!(%id, "Listener removed");
        }
    }

    /// Stop every listener and wait for their poll tasks to finish
    #[instrument(skip(self))]
    pub async fn stop_all(&self) {
        self.root.cancel();
        let ids: Vec<Uuid> = self.listeners.iter().map(|e| *e.key()).collect();
        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((_, listener)) = self.listeners.remove(&id) {
                listener.stop();
                self.slots.fetch_sub(1, Ordering::AcqRel);
                if let Some(task) = listener.task.lock().take() {
                    tasks.push(task);
                }
            }
        }
        let stopped = tasks.len();
        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Listener task ended abnormally");
            }
        }
        info!(stopped, "All listeners stopped");
    }

    pub fn active(&self) -> usize {
        self.listeners.len()
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<Listener>> {
        self.listeners.get(&id).map(|e| e.value().clone())
    }

    pub fn list(&self) -> Vec<ListenerInfo> {
        self.listeners.iter().map(|e| e.value().info()).collect()
    }

    pub fn stats(&self) -> SyncStats {
        let paused = self
            .listeners
            .iter()
            .filter(|e| e.value().state() == ListenerState::Paused)
            .count();
        SyncStats {
            active: self.active(),
            paused,
            max: self.config.max_active_listeners,
        }
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("config", &self.config)
            .field("active", &self.active())
            .finish()
    }
}

/// Poll interval for the current mode; `None` means paused
fn poll_delay(mode: GovernorMode, base: Duration) -> Option<Duration> {
    match mode {
        GovernorMode::Normal => Some(base),
        GovernorMode::Warning => Some(base * 2),
        GovernorMode::Emergency => None,
    }
}

async fn poll_loop(
    listener: Arc<Listener>,
    source: Arc<dyn SnapshotSource>,
    on_change: OnChange,
    quota: Arc<QuotaGovernor>,
    base: Duration,
) {
    let mut last: Option<Snapshot> = None;
    let mut delay = Duration::ZERO;

    loop {
        tokio::select! {
            _ = listener.cancel.cancelled() => break,
            _ = sleep(delay) => {}
        }
        if listener.is_stopped() {
            break;
        }

        let Some(next_delay) = poll_delay(quota.mode(), base) else {
            if listener.transition(ListenerState::Paused) != ListenerState::Paused {
                info!(id = %listener.id, "Listener paused in emergency mode");
            }
            delay = base;
            continue;
        };
        if listener.transition(ListenerState::Active) == ListenerState::Paused {
            info!(id = %listener.id, "Listener resumed");
        }
        delay = next_delay;

        match source.snapshot(&listener.collection, &listener.target).await {
            Ok(snapshot) => {
                listener.mark_polled();
                if last.as_ref() == Some(&snapshot) {
                    continue;
                }
                // Unsubscribed while the poll was in flight
                if listener.is_stopped() {
                    break;
                }
                on_change(snapshot.clone());
                listener.mark_delivered();
                last = Some(snapshot);
            }
            Err(e) => {
                warn!(
                    id = %listener.id,
                    collection = %listener.collection,
                    error = %e,
                    "Listener poll failed"
                );
            }
        }
    }

    debug!(id = %listener.id, "Listener poll loop exited");
}
