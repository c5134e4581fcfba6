//! Polling Synchronizer
//!
//! "Live" listeners on top of a store that only answers requests. Each
//! listener is a small state machine driven by its own task: it polls
//! through the façade read path, diffs the result against what it last
//! delivered, and backs off or pauses as quota tightens.
//!
//! | Mode      | Poll interval      |
//! |-----------|--------------------|
//! | Normal    | `pollIntervalMs`   |
//! | Warning   | 2 × `pollIntervalMs` |
//! | Emergency | paused             |

mod listener;
mod registry;

pub use listener::{Listener, ListenerInfo, ListenerState, OnChange, Subscription};
pub use registry::{ListenerRegistry, SnapshotSource, SyncConfig, SyncStats};
