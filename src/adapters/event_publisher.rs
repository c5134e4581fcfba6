//! Event sinks for governor events.
//!
//! `LoggingEventPublisher` is the production default. Tests use
//! `InMemoryEventCollector` to assert on what the governor announced, and
//! `FanoutEventPublisher` lets an embedder do both at once.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::domain::events::DomainEvent;
use crate::domain::ports::EventPublisher;

/// Writes every event to the tracing pipeline.
///
/// Alerts (emergency mode, dropped writes, rejected listeners) always go out
/// at warn. Everything else is logged at info or debug.
#[derive(Debug, Clone, Default)]
pub struct LoggingEventPublisher {
    verbose: bool,
}

impl LoggingEventPublisher {
    /// Routine events at debug level.
    pub fn new() -> Self {
        Self::default()
    }

    /// Routine events at info level.
    pub fn verbose() -> Self {
        Self { verbose: true }
    }

    fn routine(&self, event: &DomainEvent) {
        match event {
            DomainEvent::ModeChanged { from, to, usage_ratio, .. } => {
                info!(from = %from, to = %to, usage_ratio, "Governor mode changed");
            }
            DomainEvent::DailyQuotaReset { reads, writes, deletes, .. } => {
                info!(reads, writes, deletes, "Daily quota reset");
            }
            DomainEvent::BatchFlushed { committed, commits, remaining, duration_ms, .. } => {
                if self.verbose {
                    info!(committed, commits, remaining, duration_ms, "Batch flushed");
                } else {
                    debug!(committed, commits, remaining, duration_ms, "Batch flushed");
                }
            }
            other => debug!(event_type = other.event_type(), "Governor event"),
        }
    }

    fn alert(&self, event: &DomainEvent) {
        match event {
            DomainEvent::ModeChanged { from, usage_ratio, .. } => {
                warn!(from = %from, usage_ratio, "Governor entered emergency mode");
            }
            DomainEvent::WritesDropped { count, keys, reason, .. } => {
                warn!(count, keys = ?keys, reason = %reason, "Deferred writes dropped");
            }
            DomainEvent::ListenerRejected { collection, active, max, .. } => {
                warn!(collection = %collection, active, max, "Listener rejected at cap");
            }
            other => warn!(event_type = other.event_type(), "Governor alert"),
        }
    }
}

impl EventPublisher for LoggingEventPublisher {
    fn publish(&self, event: DomainEvent) {
        if event.is_alert() {
            self.alert(&event);
        } else {
            self.routine(&event);
        }
    }
}

/// Keeps every published event in memory.
#[derive(Debug, Default)]
pub struct InMemoryEventCollector {
    events: Mutex<Vec<DomainEvent>>,
}

impl InMemoryEventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn last(&self) -> Option<DomainEvent> {
        self.events.lock().last().cloned()
    }

    /// Events whose `event_type()` equals `event_type`, oldest first.
    pub fn events_of_type(&self, event_type: &str) -> Vec<DomainEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }

    /// Remove and return everything collected so far.
    pub fn take(&self) -> Vec<DomainEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl EventPublisher for InMemoryEventCollector {
    fn publish(&self, event: DomainEvent) {
        self.events.lock().push(event);
    }

    fn publish_all(&self, events: Vec<DomainEvent>) {
        self.events.lock().extend(events);
    }
}

/// Delivers each event to several shared sinks.
#[derive(Default)]
pub struct FanoutEventPublisher {
    sinks: Vec<Arc<dyn EventPublisher>>,
}

impl FanoutEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventPublisher>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }
}

impl std::fmt::Debug for FanoutEventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutEventPublisher")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl EventPublisher for FanoutEventPublisher {
    fn publish(&self, event: DomainEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.publish(event.clone());
            }
            last.publish(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn flushed(committed: usize) -> DomainEvent {
        DomainEvent::BatchFlushed {
            committed,
            commits: 1,
            remaining: 0,
            duration_ms: 3,
            timestamp: Utc::now(),
        }
    }

    fn rejected() -> DomainEvent {
        DomainEvent::ListenerRejected {
            collection: "orders".into(),
            active: 2,
            max: 2,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_logging_publisher_handles_every_kind() {
        let publisher = LoggingEventPublisher::verbose();
        publisher.publish(flushed(4));
        publisher.publish(rejected());
        publisher.publish(DomainEvent::ModeChanged {
            from: "warning".into(),
            to: "emergency".into(),
            usage_ratio: 0.97,
            timestamp: Utc::now(),
        });
    }

    #[test]
    fn test_collector_filters_and_drains() {
        let collector = InMemoryEventCollector::new();
        assert!(collector.is_empty());

        collector.publish(flushed(1));
        collector.publish_all(vec![flushed(2), rejected()]);

        assert_eq!(collector.len(), 3);
        assert_eq!(collector.events_of_type("BatchFlushed").len(), 2);
        assert_eq!(
            collector.last().map(|e| e.event_type()),
            Some("ListenerRejected")
        );

        assert_eq!(collector.take().len(), 3);
        assert!(collector.is_empty());
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let first = Arc::new(InMemoryEventCollector::new());
        let second = Arc::new(InMemoryEventCollector::new());
        let fanout = FanoutEventPublisher::new()
            .with_sink(first.clone())
            .with_sink(second.clone())
            .with_sink(Arc::new(LoggingEventPublisher::new()));
        assert_eq!(fanout.sink_count(), 3);

        fanout.publish(flushed(7));
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn test_empty_fanout_is_a_no_op() {
        FanoutEventPublisher::new().publish(rejected());
    }
}
