//! Infrastructure Adapters
//!
//! Implementations of the domain ports, following the Port/Adapter
//! (Hexagonal) architecture pattern.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │            Ports: DocumentBackend │ EventPublisher          │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ InMemoryDocumentBackend │ HttpDocumentBackend              │ │
//! │  │ LoggingEventPublisher │ InMemoryEventCollector │ Fanout    │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

mod event_publisher;
mod http;
mod memory;

pub use event_publisher::{FanoutEventPublisher, InMemoryEventCollector, LoggingEventPublisher};
pub use http::{HttpBackendConfig, HttpDocumentBackend};
pub use memory::{BackendStats, InMemoryDocumentBackend};
