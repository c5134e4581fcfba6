//! docgate - Quota-Aware Caching & Sync Governor
//!
//! Sits between an application and a metered document store with hard daily
//! and per-second operation quotas. Repeated reads are answered from memory,
//! writes are coalesced into bounded batch commits once the safety budget is
//! spent, and change notifications come from adaptive polling instead of
//! persistent listeners.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          SmartStore                              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │  CacheStore  │◀───│ Invalidation │◀───│ WriteBatcher │       │
//! │  │              │    │    Router    │    │              │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! │          ▲                                       │               │
//! │          │           ┌──────────────┐            │               │
//! │          └───────────│ QuotaGovernor│◀───────────┘               │
//! │                      └──────────────┘                            │
//! │                             ▲                                    │
//! │                      ┌──────────────┐                            │
//! │                      │  Listeners   │ (polling)                  │
//! │                      └──────────────┘                            │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//!                      DocumentBackend (port)
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Backends and event publishers implementing domain ports
//! - [`batcher`] - Deferred write queue and bounded batch commits
//! - [`cache`] - Collection-aware TTL cache
//! - [`clock`] - Wall-clock source for the daily reset
//! - [`config`] - Governor configuration
//! - [`domain`] - Value objects, ports and events
//! - [`error`] - Error types
//! - [`facade`] - `SmartStore`, the public entry point
//! - [`invalidation`] - Write-driven cache invalidation
//! - [`monitoring`] - Stats, Prometheus export and health
//! - [`quota`] - Quota counters, admission and governor mode
//! - [`sync`] - Polling listeners

pub mod adapters;
pub mod batcher;
pub mod cache;
pub mod clock;
pub mod config;
pub mod domain;
pub mod error;
pub mod facade;
pub mod invalidation;
pub mod monitoring;
pub mod quota;
pub mod sync;

// Re-export commonly used types
pub use config::GovernorConfig;
pub use domain::ports::{
    Document, DocumentBackend, Filters, OrderBy, Payload, QueryOptions, Snapshot, Target,
    WriteKind,
};
pub use error::{Error, Result};
pub use facade::{SmartStore, SmartStoreBuilder, WriteOutcome};
pub use monitoring::{GovernorStats, HealthStatus};
pub use quota::{GovernorMode, QuotaScope};
pub use sync::Subscription;
