//! Listener state and the subscription handle returned to callers.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::registry::ListenerRegistry;
use crate::domain::ports::{Snapshot, Target};

/// Callback invoked with each changed snapshot
pub type OnChange = Arc<dyn Fn(Snapshot) + Send + Sync>;

/// Listener lifecycle
///
/// ```text
/// Initializing ──▶ Active ◀──▶ Paused (emergency mode)
///                    │            │
///                    └────────────┴──▶ Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerState {
    Initializing = 0,
    Active = 1,
    Paused = 2,
    Stopped = 3,
}

impl ListenerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ListenerState::Initializing,
            1 => ListenerState::Active,
            2 => ListenerState::Paused,
            _ => ListenerState::Stopped,
        }
    }
}

impl std::fmt::Display for ListenerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerState::Initializing => write!(f, "initializing"),
            ListenerState::Active => write!(f, "active"),
            ListenerState::Paused => write!(f, "paused"),
            ListenerState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Shared state of one listener, owned by the registry and its poll task
pub struct Listener {
    pub id: Uuid,
    pub collection: String,
    pub target: Target,
    state: AtomicU8,
    pub(crate) cancel: CancellationToken,
    last_poll_at: Mutex<Option<DateTime<Utc>>>,
    deliveries: AtomicU64,
    pub(crate) task: Mutex<Option<JoinHandle<()>>>,
}

impl Listener {
    pub(crate) fn new(collection: String, target: Target, cancel: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            collection,
            target,
            state: AtomicU8::new(ListenerState::Initializing as u8),
            cancel,
            last_poll_at: Mutex::new(None),
            deliveries: AtomicU64::new(0),
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ListenerState {
        ListenerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `next` unless already stopped. Returns the previous state.
    pub(crate) fn transition(&self, next: ListenerState) -> ListenerState {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current == ListenerState::Stopped as u8 {
                return ListenerState::Stopped;
            }
            match self.state.compare_exchange(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(prev) => return ListenerState::from_u8(prev),
                Err(actual) => current = actual,
            }
        }
    }

    /// Stop polling. Terminal and idempotent; returns true on the first call.
    pub(crate) fn stop(&self) -> bool {
        let prev = self
            .state
            .swap(ListenerState::Stopped as u8, Ordering::AcqRel);
        self.cancel.cancel();
        prev != ListenerState::Stopped as u8
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == ListenerState::Stopped
    }

    pub(crate) fn mark_polled(&self) {
        *self.last_poll_at.lock() = Some(Utc::now());
    }

    pub(crate) fn mark_delivered(&self) {
        self.deliveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn last_poll_at(&self) -> Option<DateTime<Utc>> {
        *self.last_poll_at.lock()
    }

    pub fn deliveries(&self) -> u64 {
        self.deliveries.load(Ordering::Relaxed)
    }

    pub fn info(&self) -> ListenerInfo {
        ListenerInfo {
            id: self.id,
            collection: self.collection.clone(),
            state: self.state(),
            last_poll_at: self.last_poll_at(),
            deliveries: self.deliveries(),
        }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("collection", &self.collection)
            .field("target", &self.target)
            .field("state", &self.state())
            .finish()
    }
}

/// Serializable view of a listener
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerInfo {
    pub id: Uuid,
    pub collection: String,
    pub state: ListenerState,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub deliveries: u64,
}

/// Handle to an active subscription.
///
/// Dropping the handle does not stop the listener; call
/// [`Subscription::unsubscribe`].
#[derive(Debug, Clone)]
pub struct Subscription {
    listener: Arc<Listener>,
    registry: Weak<ListenerRegistry>,
}

impl Subscription {
    pub(crate) fn new(listener: Arc<Listener>, registry: Weak<ListenerRegistry>) -> Self {
        Self { listener, registry }
    }

    pub fn id(&self) -> Uuid {
        self.listener.id
    }

    pub fn state(&self) -> ListenerState {
        self.listener.state()
    }

    pub fn deliveries(&self) -> u64 {
        self.listener.deliveries()
    }

    /// Stop the listener and release its slot. Safe to call more than once
    /// and while a poll is in flight.
    pub fn unsubscribe(&self) {
        match self.registry.upgrade() {
            Some(registry) => registry.remove(self.listener.id),
            None => {
                self.listener.stop();
            }
        }
    }
}
