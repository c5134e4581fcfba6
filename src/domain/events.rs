//! Domain Events
//!
//! Immutable records of things the governor did that operators care about:
//! mode changes, flushed batches, writes dropped after retries, rejected
//! subscriptions. Events flow through an [`EventPublisher`] so dashboards and
//! audit sinks can observe them without reaching into governor state.
//!
//! [`EventPublisher`]: super::ports::EventPublisher

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Domain event representing a significant occurrence in the governor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
    // =========================================================================
    // Quota Events
    // =========================================================================
    /// The governor mode changed.
    ModeChanged {
        from: String,
        to: String,
        usage_ratio: f64,
        timestamp: DateTime<Utc>,
    },

    /// Daily counters were reset.
    DailyQuotaReset {
        reads: u64,
        writes: u64,
        deletes: u64,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Batcher Events
    // =========================================================================
    /// A flush cycle committed queued writes.
    BatchFlushed {
        committed: usize,
        commits: usize,
        remaining: usize,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// Writes were dropped after exhausting retries.
    WritesDropped {
        count: usize,
        keys: Vec<String>,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Listener Events
    // =========================================================================
    /// A subscribe call was rejected at the listener cap.
    ListenerRejected {
        collection: String,
        active: usize,
        max: usize,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::ModeChanged { .. } => "ModeChanged",
            DomainEvent::DailyQuotaReset { .. } => "DailyQuotaReset",
            DomainEvent::BatchFlushed { .. } => "BatchFlushed",
            DomainEvent::WritesDropped { .. } => "WritesDropped",
            DomainEvent::ListenerRejected { .. } => "ListenerRejected",
        }
    }

    /// Get the event timestamp.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            DomainEvent::ModeChanged { timestamp, .. }
            | DomainEvent::DailyQuotaReset { timestamp, .. }
            | DomainEvent::BatchFlushed { timestamp, .. }
            | DomainEvent::WritesDropped { timestamp, .. }
            | DomainEvent::ListenerRejected { timestamp, .. } => *timestamp,
        }
    }

    /// Whether this event signals degraded service.
    pub fn is_alert(&self) -> bool {
        match self {
            DomainEvent::ModeChanged { to, .. } => to == "emergency",
            DomainEvent::WritesDropped { .. } | DomainEvent::ListenerRejected { .. } => true,
            _ => false,
        }
    }
}
