//! Retention sweeper
//!
//! Periodically expires backups past their retention and fails records
//! left pending/running by a crashed process.

use crate::backup::BackupIsolationManager;
use crate::config::BackupConfig;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Backups deleted past retention
    pub expired: u64,
    /// Stale pending or running backups marked failed
    pub reconciled: u64,
}

/// Background retention task
pub struct RetentionSweeper {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RetentionSweeper {
    /// Spawn on the current runtime; the first sweep runs immediately
    pub fn spawn(backups: Arc<BackupIsolationManager>, config: &BackupConfig) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let period = config.sweep_interval().max(Duration::from_secs(1));
        let stale_after = config.stale_after();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = Self::run_once(&backups, stale_after).await;
                        if report != SweepReport::default() {
                            info!(expired = report.expired, reconciled = report.reconciled, "Retention sweep finished");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Retention sweeper stopped");
        });
        info!(interval_secs = period.as_secs(), "Retention sweeper started");

        Self { shutdown, handle }
    }

    /// One pass: reconcile stale records, then expire old backups.
    /// Failures are logged; the next pass retries.
    pub async fn run_once(
        backups: &BackupIsolationManager,
        stale_after: chrono::Duration,
    ) -> SweepReport {
        let reconciled = match backups.reconcile_stale_backups(stale_after).await {
            Ok(n) => n,
            Err(e) => {
                error!(error = %e, "Stale backup reconciliation failed");
                0
            }
        };
        let expired = match backups.sweep_expired_backups().await {
            Ok(n) => n,
            Err(e) => {
                error!(error = %e, "Retention sweep failed");
                0
            }
        };
        SweepReport { expired, reconciled }
    }

    /// Stop after the current pass
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}
