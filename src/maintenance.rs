//! Background maintenance loop (spec §4.10): periodically expires stale
//! Pending entries, logs a health summary, and (when configured) emits
//! metrics. Runs as a single tokio task per running [`crate::mempool::Mempool`],
//! cancellable via a `tokio::sync::watch` shutdown signal — the same
//! pattern the teacher's transaction forwarder uses.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::mempool::Mempool;

/// Fixed cadence for the expiry sweep and priority recompute, independent of
/// the configurable metrics interval (spec §4.10).
const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);
/// Fixed cadence for the health-report log line (spec §4.10).
const HEALTH_INTERVAL: Duration = Duration::from_secs(600);

/// Owns the maintenance task's shutdown signal. Dropping this (or calling
/// [`stop`](MaintenanceHandle::stop)) ends the loop after its current tick.
pub struct MaintenanceHandle {
    shutdown_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl MaintenanceHandle {
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

/// Spawns the maintenance loop against `mempool`, ticking cleanup, health,
/// and (if `metrics_enabled`) metrics on their own independent intervals
/// until shut down.
pub fn spawn(mempool: Arc<Mempool>, metrics_enabled: bool, metrics_interval: Duration) -> MaintenanceHandle {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut cleanup_ticker = tokio::time::interval(CLEANUP_INTERVAL);
        let mut health_ticker = tokio::time::interval(HEALTH_INTERVAL);
        let mut metrics_ticker = tokio::time::interval(metrics_interval.max(Duration::from_millis(1)));

        loop {
            tokio::select! {
                _ = cleanup_ticker.tick() => {
                    let expired = mempool.run_cleanup();
                    if expired > 0 {
                        debug!(expired, "maintenance cleanup expired stale pending transactions");
                    }
                }
                _ = health_ticker.tick() => {
                    let report = mempool.health_report();
                    info!(
                        pending = report.snapshot.pending,
                        mining = report.snapshot.mining,
                        pending_confirm = report.snapshot.pending_confirm,
                        total_bytes = report.snapshot.total_bytes,
                        submitted = report.metrics.submitted,
                        rejected = report.metrics.rejected,
                        confirmed = report.metrics.confirmed,
                        expired = report.metrics.expired,
                        evicted = report.metrics.evicted,
                        healthy = report.healthy,
                        reasons = %report.reasons.join("; "),
                        "mempool health report"
                    );
                }
                _ = metrics_ticker.tick(), if metrics_enabled => {
                    mempool.emit_metrics().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!("maintenance loop shutting down");
                        return;
                    }
                }
            }
        }
    });

    MaintenanceHandle { shutdown_tx, task }
}
