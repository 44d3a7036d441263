// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background workers recovering stalled work.
//!
//! [`StuckMigrationMonitor`] periodically hands vehicles whose migration made
//! no progress back to the launcher. [`QueueDrainWorker`] resubmits persisted
//! QUEUED jobs that are not in flight and prunes old terminated jobs.
//!
//! Neither worker cancels anything; both act on persisted state only.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info};
use vvrte_core::CoreError;
use vvrte_core::jobs::JobService;

use crate::error::Result;
use crate::launcher::Launcher;

fn chrono_duration(duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration).map_err(|e| {
        CoreError::Validation {
            field: "duration".to_string(),
            message: e.to_string(),
        }
        .into()
    })
}

/// Configuration for the stuck-migration monitor.
#[derive(Debug, Clone)]
pub struct StuckMigrationMonitorConfig {
    /// How often to sweep.
    pub poll_interval: Duration,
    /// Minimum age of a vehicle's last update before it counts as stuck.
    pub stuck_timeout: Duration,
}

impl Default for StuckMigrationMonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            stuck_timeout: Duration::from_secs(120),
        }
    }
}

/// Background worker sweeping stuck migrations.
pub struct StuckMigrationMonitor {
    launcher: Arc<Launcher>,
    config: StuckMigrationMonitorConfig,
    shutdown: Arc<Notify>,
}

impl StuckMigrationMonitor {
    pub fn new(launcher: Arc<Launcher>, config: StuckMigrationMonitorConfig) -> Self {
        Self {
            launcher,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the sweep loop until the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            stuck_timeout_secs = self.config.stuck_timeout.as_secs(),
            "Stuck migration monitor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Stuck migration monitor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Failed to handle stuck migrations");
                    }
                }
            }
        }

        info!("Stuck migration monitor stopped");
    }

    /// Run one sweep. Returns how many vehicles were handled.
    pub async fn sweep(&self) -> Result<usize> {
        let timeout = chrono_duration(self.config.stuck_timeout)?;
        let handled = self.launcher.handle_stuck_migrations(timeout).await?;
        if handled > 0 {
            info!(handled, "Recovered stuck virtual vehicles");
        } else {
            debug!("No stuck virtual vehicles");
        }
        Ok(handled)
    }
}

/// Configuration for the queue drain worker.
#[derive(Debug, Clone)]
pub struct QueueDrainConfig {
    /// How often to resubmit queued jobs.
    pub poll_interval: Duration,
    /// Terminated jobs older than this are deleted.
    pub job_retention: Duration,
}

impl Default for QueueDrainConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            job_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Background worker draining leftover QUEUED jobs.
pub struct QueueDrainWorker {
    jobs: Arc<JobService>,
    config: QueueDrainConfig,
    shutdown: Arc<Notify>,
}

impl QueueDrainWorker {
    pub fn new(jobs: Arc<JobService>, config: QueueDrainConfig) -> Self {
        Self {
            jobs,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the drain loop until the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Queue drain worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Queue drain worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.drain().await {
                        error!(error = %e, "Failed to drain job queues");
                    }
                }
            }
        }

        info!("Queue drain worker stopped");
    }

    /// Resubmit queued jobs and prune old ones.
    pub async fn drain(&self) -> Result<()> {
        let submitted = self.jobs.execute_queued_jobs().await?;
        let removed = self
            .jobs
            .remove_old_jobs(chrono_duration(self.config.job_retention)?)
            .await?;
        debug!(submitted, removed, "Job queues drained");
        Ok(())
    }
}
