//! Monitoring
//!
//! Stats snapshots, Prometheus export and health evaluation.

mod exporter;
mod health;
mod stats;

pub use exporter::PrometheusExporter;
pub use health::{HealthCheckResult, HealthReport, HealthStatus};
pub use stats::{GovernorStats, ReadPathMetrics, ReadPathStats};
