//! Domain Layer
//!
//! Value objects, ports and events shared by every governor component.
//!
//! - **Ports** (`ports.rs`) - the backend and event-publisher traits plus the
//!   document envelope and query types
//! - **Events** (`events.rs`) - domain events for operational visibility
//!
//! ```ignore
//! use docgate::domain::{DocumentBackend, Document};
//!
//! async fn load<B: DocumentBackend>(backend: &B) -> docgate::Result<Option<Document>> {
//!     backend.get("users", "42").await
//! }
//! ```

pub mod events;
pub mod ports;

pub use events::DomainEvent;
pub use ports::{
    Direction, Document, DocumentBackend, EventPublisher, Filters, OrderBy, Payload,
    QueryOptions, Snapshot, Target, WriteKind, WriteOp,
};
