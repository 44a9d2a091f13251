//! Health evaluation and metrics counters.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use warden_core::config::HealthConfig;
use warden_core::types::{HealthStatus, MetricsSnapshot};

/// Result of a health check, before it is stamped and persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub details: Value,
}

impl HealthCheck {
    pub fn healthy(details: Value) -> Self {
        Self {
            status: HealthStatus::Healthy,
            details,
        }
    }

    pub fn degraded(details: Value) -> Self {
        Self {
            status: HealthStatus::Degraded,
            details,
        }
    }

    pub fn unhealthy(details: Value) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            details,
        }
    }
}

/// Error-count bands for the default health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthThresholds {
    /// `error_count >= unhealthy_errors` → unhealthy.
    pub unhealthy_errors: u64,
    /// `error_count >= degraded_errors` → degraded. 0 disables the band.
    pub degraded_errors: u64,
}

impl HealthThresholds {
    pub fn from_config(config: &HealthConfig) -> Self {
        Self {
            unhealthy_errors: config.unhealthy_error_threshold,
            degraded_errors: config.degraded_error_threshold,
        }
    }

    /// An unreachable store is always unhealthy.
    pub fn evaluate(&self, error_count: u64, store_reachable: bool) -> HealthStatus {
        if !store_reachable || error_count >= self.unhealthy_errors {
            HealthStatus::Unhealthy
        } else if self.degraded_errors > 0 && error_count >= self.degraded_errors {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self::from_config(&HealthConfig::default())
    }
}

/// Cumulative per-agent counters. Reset only by a process restart.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    success: AtomicU64,
    errors: AtomicU64,
    warnings: AtomicU64,
    processing_ms: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, elapsed: Duration) {
        self.success.fetch_add(1, Ordering::Relaxed);
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.processing_ms.fetch_add(ms, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_warning(&self) {
        self.warnings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn success_count(&self) -> u64 {
        self.success.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn warning_count(&self) -> u64 {
        self.warnings.load(Ordering::Relaxed)
    }

    pub fn processing_time_ms(&self) -> u64 {
        self.processing_ms.load(Ordering::Relaxed)
    }

    pub fn snapshot(
        &self,
        agent: &str,
        custom: BTreeMap<String, Value>,
        at: DateTime<Utc>,
    ) -> MetricsSnapshot {
        MetricsSnapshot {
            agent: agent.to_string(),
            success_count: self.success_count(),
            error_count: self.error_count(),
            warning_count: self.warning_count(),
            processing_time_ms: self.processing_time_ms(),
            memory_usage_mb: memory_usage_mb(),
            custom,
            timestamp: at,
        }
    }
}

/// Resident set size of this process in MiB (0 where unavailable).
pub fn memory_usage_mb() -> f64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if let Some(rest) = line.strip_prefix("VmRSS:") {
                    if let Some(kb) = rest.split_whitespace().next().and_then(|s| s.parse::<u64>().ok()) {
                        return kb as f64 / 1024.0;
                    }
                }
            }
        }
    }
    0.0
}

/// Single-slot guard so two runs of the same periodic job never overlap.
#[derive(Debug, Default)]
pub struct TickGuard {
    busy: AtomicBool,
}

/// Held while a tick runs.
pub struct TickPass<'a> {
    guard: &'a TickGuard,
}

impl TickGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` if a tick is already in progress.
    pub fn try_enter(&self) -> Option<TickPass<'_>> {
        if self.busy.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(TickPass { guard: self })
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

impl Drop for TickPass<'_> {
    fn drop(&mut self) {
        self.guard.busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_thresholds() {
        let t = HealthThresholds::default();
        assert_eq!(t.evaluate(0, true), HealthStatus::Healthy);
        assert_eq!(t.evaluate(3, true), HealthStatus::Degraded);
        assert_eq!(t.evaluate(10, true), HealthStatus::Unhealthy);
        assert_eq!(t.evaluate(0, false), HealthStatus::Unhealthy);

        let no_band = HealthThresholds {
            unhealthy_errors: 10,
            degraded_errors: 0,
        };
        assert_eq!(no_band.evaluate(9, true), HealthStatus::Healthy);
    }

    #[test]
    fn test_collector_snapshot() {
        let metrics = MetricsCollector::new();
        for _ in 0..5 {
            metrics.record_success(Duration::from_millis(20));
        }
        metrics.record_error();
        metrics.record_warning();

        let mut custom = BTreeMap::new();
        custom.insert("queue_depth".to_string(), Value::from(4));
        let snap = metrics.snapshot("scorer", custom, Utc::now());
        assert_eq!(snap.success_count, 5);
        assert_eq!(snap.error_count, 1);
        assert_eq!(snap.warning_count, 1);
        assert_eq!(snap.processing_time_ms, 100);
        assert_eq!(snap.custom["queue_depth"], 4);
        assert!(snap.memory_usage_mb >= 0.0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_memory_usage_reads_rss() {
        assert!(memory_usage_mb() > 0.0);
    }

    #[test]
    fn test_tick_guard_is_single_slot() {
        let guard = TickGuard::new();
        let pass = guard.try_enter().unwrap();
        assert!(guard.is_busy());
        assert!(guard.try_enter().is_none());
        drop(pass);
        assert!(!guard.is_busy());
        assert!(guard.try_enter().is_some());
    }
}
