//! Write Batcher
//!
//! Writes that cannot go out directly (quota margin spent, emergency mode,
//! transient backend failure) wait here and are committed in bounded batches.
//!
//! ```text
//!  SmartWrite ──enqueue──▶ VecDeque<PendingWrite> ──flush──▶ batch_commit(≤ max ops)
//!                               ▲        │                        │
//!                               │        └─ every flushInterval   ├─ ok: record quota,
//!                               │           or when ≥ batchSize   │      invalidate once
//!                               └──────── requeue (no budget) ◀───┤
//!                                                                 └─ failed after retries:
//!                                                                    BatchCommitFailed
//! ```

mod flusher;
mod pending;

pub use flusher::{BatcherConfig, BatcherStats, FlushReport, WriteBatcher};
pub use pending::{PendingWrite, WriteTicket};
