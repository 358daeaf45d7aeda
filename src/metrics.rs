//! Pool metrics and health reporting (spec §4.10).
//!
//! Metrics are instance-owned, not global statics: a process embedding more
//! than one [`crate::mempool::Mempool`] gets independent counters for each,
//! matching the single-writer-lock-per-instance concurrency model (spec §5).

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;

use crate::types::TxStatus;
use crate::validator::CheckReport;

/// Unhealthy if memory usage exceeds this percentage of `memory_limit`.
const MEMORY_UNHEALTHY_PCT: f64 = 90.0;
/// Unhealthy if live entry count exceeds this percentage of `max_size`.
const CAPACITY_UNHEALTHY_PCT: f64 = 90.0;
/// Unhealthy if the lifetime expired rate exceeds this percentage of submitted.
const EXPIRED_UNHEALTHY_PCT: f64 = 10.0;
/// Unhealthy if the lifetime rejected rate exceeds this percentage of submitted.
const REJECTED_UNHEALTHY_PCT: f64 = 5.0;

/// Point-in-time counts by lifecycle status plus total occupied bytes,
/// broadcast to [`crate::ports::EventSink::on_pool_state_changed`] after
/// every mutating operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub pending: usize,
    pub mining: usize,
    pub pending_confirm: usize,
    pub confirmed: usize,
    pub rejected: usize,
    pub expired: usize,
    pub total_bytes: u64,
}

impl PoolSnapshot {
    pub fn total_live(&self) -> usize {
        self.pending + self.mining + self.pending_confirm
    }

    pub fn record(&mut self, status: TxStatus, delta: i64) {
        let bucket = match status {
            TxStatus::Pending => &mut self.pending,
            TxStatus::Mining => &mut self.mining,
            TxStatus::PendingConfirm => &mut self.pending_confirm,
            TxStatus::Confirmed => &mut self.confirmed,
            TxStatus::Rejected => &mut self.rejected,
            TxStatus::Expired => &mut self.expired,
        };
        *bucket = (*bucket as i64 + delta).max(0) as usize;
    }
}

/// Cumulative, monotonic lifetime counters (never reset by `reset()`,
/// unlike [`PoolSnapshot`] which reflects live state).
#[derive(Debug, Default)]
pub struct PoolMetrics {
    submitted: AtomicU64,
    rejected: AtomicU64,
    confirmed: AtomicU64,
    expired: AtomicU64,
    evicted: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolMetricsSnapshot {
    pub submitted: u64,
    pub rejected: u64,
    pub confirmed: u64,
    pub expired: u64,
    pub evicted: u64,
}

impl PoolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Counts an `update_status` transition to `Rejected`. Mining → Pending
    /// requeues (`reject`) do not count here; they are not a terminal
    /// rejection (spec §4.6).
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub fn record_confirmed(&self) {
        self.confirmed.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub fn record_expired(&self) {
        self.expired.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub fn record_evicted(&self, count: u64) {
        self.evicted.fetch_add(count, AtomicOrdering::Relaxed);
    }

    pub fn snapshot(&self) -> PoolMetricsSnapshot {
        PoolMetricsSnapshot {
            submitted: self.submitted.load(AtomicOrdering::Relaxed),
            rejected: self.rejected.load(AtomicOrdering::Relaxed),
            confirmed: self.confirmed.load(AtomicOrdering::Relaxed),
            expired: self.expired.load(AtomicOrdering::Relaxed),
            evicted: self.evicted.load(AtomicOrdering::Relaxed),
        }
    }
}

/// Full health report assembled on demand (spec §4.10 `health_report`):
/// current occupancy, lifetime counters, the validator's per-check
/// attempt/rejection/latency breakdown, and an overall healthy verdict.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub snapshot: PoolSnapshot,
    pub metrics: PoolMetricsSnapshot,
    pub checks: Vec<(String, CheckReport)>,
    pub running: bool,
    pub healthy: bool,
    pub reasons: Vec<String>,
}

/// Evaluates the four health thresholds (spec §4.10): memory usage, live
/// entry count, lifetime expired rate, and lifetime rejected rate, each
/// against the submitted count. Returns the overall verdict and a message
/// per failing condition.
pub fn evaluate_health(
    snapshot: &PoolSnapshot,
    metrics: &PoolMetricsSnapshot,
    memory_limit: u64,
    max_size: usize,
) -> (bool, Vec<String>) {
    let mut reasons = Vec::new();

    let memory_pct = if memory_limit > 0 {
        (snapshot.total_bytes as f64 / memory_limit as f64) * 100.0
    } else {
        0.0
    };
    if memory_pct > MEMORY_UNHEALTHY_PCT {
        reasons.push(format!("memory usage at {:.1}% of limit", memory_pct));
    }

    let capacity_pct = if max_size > 0 {
        (snapshot.total_live() as f64 / max_size as f64) * 100.0
    } else {
        0.0
    };
    if capacity_pct > CAPACITY_UNHEALTHY_PCT {
        reasons.push(format!("transaction count at {:.1}% of capacity", capacity_pct));
    }

    let submitted = metrics.submitted as f64;
    let expired_pct = if submitted > 0.0 {
        (metrics.expired as f64 / submitted) * 100.0
    } else {
        0.0
    };
    if expired_pct > EXPIRED_UNHEALTHY_PCT {
        reasons.push(format!("expired rate at {:.1}%", expired_pct));
    }

    let rejected_pct = if submitted > 0.0 {
        (metrics.rejected as f64 / submitted) * 100.0
    } else {
        0.0
    };
    if rejected_pct > REJECTED_UNHEALTHY_PCT {
        reasons.push(format!("rejected rate at {:.1}%", rejected_pct));
    }

    (reasons.is_empty(), reasons)
}

/// Derived occupancy figures for a single metrics tick (spec §4.10
/// `emit_metrics`): distinct from [`HealthReport`], which carries only the
/// pass/fail thresholds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsageReport {
    pub memory_mb: f64,
    pub limit_mb: f64,
    pub usage_pct: f64,
    pub capacity_pct: f64,
    pub avg_tx_size: f64,
    pub total_tx_size: u64,
    pub oldest_age: Duration,
    pub average_age: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_record_moves_counts_between_buckets() {
        let mut snap = PoolSnapshot::default();
        snap.record(TxStatus::Pending, 1);
        snap.record(TxStatus::Pending, 1);
        assert_eq!(snap.pending, 2);
        snap.record(TxStatus::Pending, -1);
        snap.record(TxStatus::Mining, 1);
        assert_eq!(snap.pending, 1);
        assert_eq!(snap.mining, 1);
        assert_eq!(snap.total_live(), 2);
    }

    #[test]
    fn metrics_accumulate_across_calls() {
        let metrics = PoolMetrics::new();
        metrics.record_submitted();
        metrics.record_submitted();
        metrics.record_confirmed();
        metrics.record_evicted(3);
        let snap = metrics.snapshot();
        assert_eq!(snap.submitted, 2);
        assert_eq!(snap.confirmed, 1);
        assert_eq!(snap.evicted, 3);
    }

    #[test]
    fn evaluate_health_flags_each_threshold_independently() {
        let snapshot = PoolSnapshot {
            pending: 95,
            total_bytes: 950,
            ..Default::default()
        };
        let metrics = PoolMetricsSnapshot {
            submitted: 100,
            expired: 15,
            rejected: 10,
            ..Default::default()
        };
        let (healthy, reasons) = evaluate_health(&snapshot, &metrics, 1000, 100);
        assert!(!healthy);
        assert_eq!(reasons.len(), 4);
    }

    #[test]
    fn evaluate_health_passes_when_under_every_threshold() {
        let snapshot = PoolSnapshot {
            pending: 10,
            total_bytes: 100,
            ..Default::default()
        };
        let metrics = PoolMetricsSnapshot {
            submitted: 100,
            expired: 1,
            rejected: 1,
            ..Default::default()
        };
        let (healthy, reasons) = evaluate_health(&snapshot, &metrics, 1000, 100);
        assert!(healthy);
        assert!(reasons.is_empty());
    }
}
