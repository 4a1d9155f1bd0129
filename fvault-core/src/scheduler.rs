//! Retention scheduler
//!
//! A supervised background task that runs the retention sweep on an
//! interval. A failed cycle is logged and recorded in the status channel, and
//! the next attempt is pushed out exponentially up to `max_backoff`. The
//! sweep itself locks one file at a time inside the manager.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::VersioningConfig;
use crate::error::{Result, VersionError};
use crate::manager::{CleanupReport, VersionManager};

/// Scheduling knobs
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub max_backoff: Duration,
    /// Also delete unreferenced blobs after each sweep
    pub collect_garbage: bool,
    /// Sweep right away instead of waiting one interval
    pub run_on_start: bool,
}

impl SchedulerConfig {
    pub fn from_versioning(config: &VersioningConfig) -> Self {
        Self {
            interval: config.cleanup_interval,
            max_backoff: config.max_backoff,
            collect_garbage: true,
            run_on_start: false,
        }
    }

    /// Delay before the next sweep after `consecutive_failures` failed ones
    pub fn next_delay(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return self.interval;
        }
        let factor = 1u32 << consecutive_failures.min(20);
        self.interval
            .saturating_mul(factor)
            .min(self.max_backoff.max(self.interval))
    }
}

/// Snapshot of scheduler progress
#[derive(Debug, Clone, Default)]
pub struct SchedulerStatus {
    pub runs: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub last_run: Option<DateTime<Utc>>,
    pub last_removed: usize,
    pub last_garbage: usize,
    pub last_error: Option<String>,
    pub next_delay: Duration,
}

pub struct RetentionScheduler {
    manager: Arc<VersionManager>,
    config: SchedulerConfig,
}

impl RetentionScheduler {
    pub fn new(manager: Arc<VersionManager>, config: SchedulerConfig) -> Self {
        Self { manager, config }
    }

    /// One sweep, plus garbage collection when enabled
    pub async fn run_once(&self) -> Result<(CleanupReport, usize)> {
        let report = self.manager.cleanup_report(None).await?;
        let garbage = if self.config.collect_garbage {
            self.manager.collect_garbage().await?
        } else {
            0
        };
        Ok((report, garbage))
    }

    /// Start the background task
    pub fn spawn(self) -> SchedulerHandle {
        let cancel = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(SchedulerStatus::default());
        let task = tokio::spawn(self.run(cancel.clone(), status_tx));
        SchedulerHandle {
            cancel,
            status: status_rx,
            task,
        }
    }

    async fn run(self, cancel: CancellationToken, status: watch::Sender<SchedulerStatus>) {
        tracing::info!(
            "Retention scheduler started (every {:?}, backoff cap {:?})",
            self.config.interval,
            self.config.max_backoff
        );
        let mut delay = if self.config.run_on_start {
            Duration::ZERO
        } else {
            self.config.interval
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            // a sweep in progress finishes before shutdown is honored
            let outcome = self.run_once().await.and_then(|(report, garbage)| {
                if report.is_clean() {
                    Ok((report, garbage))
                } else {
                    Err(VersionError::Storage(format!(
                        "cleanup failed for {} files, first: {} ({})",
                        report.failed_files.len(),
                        report.failed_files[0].0,
                        report.failed_files[0].1
                    )))
                }
            });

            status.send_modify(|s| {
                s.runs += 1;
                s.last_run = Some(Utc::now());
                match &outcome {
                    Ok((report, garbage)) => {
                        s.consecutive_failures = 0;
                        s.last_removed = report.removed;
                        s.last_garbage = *garbage;
                        s.last_error = None;
                    }
                    Err(e) => {
                        s.failures += 1;
                        s.consecutive_failures = s.consecutive_failures.saturating_add(1);
                        s.last_error = Some(e.to_string());
                    }
                }
                s.next_delay = self.config.next_delay(s.consecutive_failures);
                delay = s.next_delay;
            });

            if let Err(e) = outcome {
                tracing::warn!("Retention sweep failed, next attempt in {:?}: {}", delay, e);
            }
        }

        tracing::info!("Retention scheduler stopped");
    }
}

/// Control handle for a running scheduler
pub struct SchedulerHandle {
    cancel: CancellationToken,
    status: watch::Receiver<SchedulerStatus>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn status(&self) -> SchedulerStatus {
        self.status.borrow().clone()
    }

    /// Receiver that observes every status change
    pub fn subscribe(&self) -> watch::Receiver<SchedulerStatus> {
        self.status.clone()
    }

    /// Stop the task and wait for it to exit
    pub async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();
        self.task
            .await
            .map_err(|e| VersionError::Storage(format!("Retention scheduler task failed: {}", e)))
    }
}
