//! Quota Governor
//!
//! Real-time accounting of billed operations against the store's daily and
//! per-second limits, plus the Normal/Warning/Emergency mode derived from it.

mod counters;
mod governor;

pub use counters::{budget, QuotaCounter, QuotaScope, QuotaUsage};
pub use governor::{GovernorMode, QuotaGovernor, QuotaSnapshot};
