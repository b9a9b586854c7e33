//! Background reaping of invalid session rows

use crate::store::SessionStore;
use crate::SessionResult;
use std::time::Duration;
use tether_core::CleanupSettings;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Outcome of one cleanup run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: usize,
    pub batches: usize,
    /// Whether the run stopped because no invalid rows were left
    pub drained: bool,
}

#[derive(Debug, Clone)]
pub struct CleanupScheduler {
    store: SessionStore,
    interval: Duration,
    batch_size: u32,
    run_budget: Duration,
}

impl CleanupScheduler {
    pub fn new(store: SessionStore, interval: Duration, batch_size: u32, run_budget: Duration) -> Self {
        Self {
            store,
            interval: interval.max(Duration::from_millis(10)),
            batch_size: batch_size.max(1),
            run_budget,
        }
    }

    pub fn from_settings(store: SessionStore, settings: &CleanupSettings) -> Self {
        Self::new(
            store,
            Duration::from_secs(settings.interval_secs),
            settings.batch_size,
            Duration::from_millis(settings.run_budget_ms),
        )
    }

    /// Delete batches until one comes back short or the run budget is spent
    pub async fn run_once(&self) -> SessionResult<CleanupReport> {
        let started = Instant::now();
        let mut report = CleanupReport::default();

        loop {
            let removed = self.store.cleanup_expired(self.batch_size).await?;
            report.removed += removed;
            report.batches += 1;

            if removed < self.batch_size as usize {
                report.drained = true;
                break;
            }
            if started.elapsed() >= self.run_budget {
                debug!(removed = report.removed, "Cleanup run budget exhausted");
                break;
            }

            tokio::task::yield_now().await;
        }

        Ok(report)
    }

    /// Start the periodic task
    pub fn start(self) -> CleanupHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        info!(
            interval_secs = self.interval.as_secs(),
            batch_size = self.batch_size,
            "Session cleanup scheduler started"
        );

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.run_once().await {
                            Ok(report) if report.removed > 0 => {
                                info!(
                                    removed = report.removed,
                                    batches = report.batches,
                                    drained = report.drained,
                                    "Expired sessions cleaned up"
                                );
                            }
                            Ok(_) => {}
                            Err(e) => {
                                warn!(error = %e, "Session cleanup failed, retrying next tick");
                            }
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Session cleanup scheduler stopped");
        });

        CleanupHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Running scheduler
///
/// Dropping the handle also stops the task once its current run ends, but
/// without waiting for it; use [`shutdown`](Self::shutdown) to join.
#[derive(Debug)]
pub struct CleanupHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl CleanupHandle {
    /// Signal the task and wait for the in-flight run to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Cleanup task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
