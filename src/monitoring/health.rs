//! Health Checks
//!
//! Liveness and readiness derived from governor state. A governor in Warning
//! or Emergency mode is degraded but still serving (from cache if need be);
//! only a shut-down governor is unhealthy.

use serde::{Deserialize, Serialize};

use super::stats::GovernorStats;
use crate::quota::GovernorMode;

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Service is healthy
    Healthy,
    /// Service is degraded but operational
    Degraded,
    /// Service is unhealthy
    Unhealthy,
}

impl HealthStatus {
    /// Check if status is healthy or degraded (operational)
    pub fn is_operational(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }

    pub fn is_healthy(&self) -> bool {
        *self == HealthStatus::Healthy
    }

    fn worst(self, other: HealthStatus) -> HealthStatus {
        use HealthStatus::*;
        match (self, other) {
            (Unhealthy, _) | (_, Unhealthy) => Unhealthy,
            (Degraded, _) | (_, Degraded) => Degraded,
            _ => Healthy,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Degraded => write!(f, "Degraded"),
            HealthStatus::Unhealthy => write!(f, "Unhealthy"),
        }
    }
}

/// Health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
}

impl HealthCheckResult {
    pub fn healthy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            message: None,
        }
    }

    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Degraded,
            message: Some(message.into()),
        }
    }

    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
        }
    }
}

/// Aggregated health report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checks: Vec<HealthCheckResult>,
}

impl HealthReport {
    /// Evaluate governor health from a stats snapshot
    pub fn evaluate(stats: &GovernorStats, shutting_down: bool) -> Self {
        let mut checks = Vec::with_capacity(3);

        checks.push(match stats.mode {
            GovernorMode::Normal => HealthCheckResult::healthy("quota"),
            GovernorMode::Warning => HealthCheckResult::degraded(
                "quota",
                format!("warning mode, usage ratio {:.2}", stats.quota.usage_ratio),
            ),
            GovernorMode::Emergency => HealthCheckResult::degraded(
                "quota",
                format!(
                    "emergency mode, reads cache-only, usage ratio {:.2}",
                    stats.quota.usage_ratio
                ),
            ),
        });

        checks.push(if shutting_down {
            HealthCheckResult::unhealthy("batcher", "shutting down")
        } else if stats.batcher.dropped > 0 {
            HealthCheckResult::degraded(
                "batcher",
                format!("{} writes dropped since start", stats.batcher.dropped),
            )
        } else {
            HealthCheckResult::healthy("batcher")
        });

        checks.push(if stats.listeners.paused > 0 {
            HealthCheckResult::degraded(
                "listeners",
                format!("{} listeners paused", stats.listeners.paused),
            )
        } else {
            HealthCheckResult::healthy("listeners")
        });

        let status = checks
            .iter()
            .fold(HealthStatus::Healthy, |acc, c| acc.worst(c.status));
        Self { status, checks }
    }
}
