// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job runnable factories for the vehicle and migration queues.
//!
//! Factories hold weak references, so the job service registered with them
//! never keeps the launcher or the migrator alive.

use std::sync::{Arc, Weak};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use tracing::{debug, instrument};
use vvrte_core::entities::Job;
use vvrte_core::jobs::{JobRunnable, JobRunnableFactory};

use crate::launcher::{Launcher, MODE_RUN, RunRequest};
use crate::migrator::{MODE_CONTINUE, MODE_RECEIVE, MODE_SEND, MODE_SEND_ACK, Migrator};

fn upgrade<T>(weak: &Weak<T>, what: &str) -> anyhow::Result<Arc<T>> {
    weak.upgrade()
        .ok_or_else(|| anyhow!("{} has been shut down", what))
}

fn target(job: &Job) -> anyhow::Result<i64> {
    job.target_id()
        .with_context(|| format!("job {} has no target id: '{}'", job.id, job.parameters))
}

// ============================================================================
// Vehicle queue
// ============================================================================

/// Creates script slice runnables (`mode=vv-run,id=<vehicle>`).
pub struct VehicleJobFactory {
    launcher: Weak<Launcher>,
}

impl VehicleJobFactory {
    pub fn new(launcher: &Arc<Launcher>) -> Self {
        Self {
            launcher: Arc::downgrade(launcher),
        }
    }
}

impl JobRunnableFactory for VehicleJobFactory {
    fn create_runnable(&self, job: &Job) -> Option<Box<dyn JobRunnable>> {
        if job.mode() != Some(MODE_RUN) {
            return None;
        }
        Some(Box::new(VehicleRunnable {
            launcher: self.launcher.clone(),
            job: job.clone(),
        }))
    }
}

struct VehicleRunnable {
    launcher: Weak<Launcher>,
    job: Job,
}

#[async_trait]
impl JobRunnable for VehicleRunnable {
    #[instrument(skip(self), fields(job_id = self.job.id))]
    async fn run(&mut self) -> anyhow::Result<()> {
        let launcher = upgrade(&self.launcher, "launcher")?;
        let vehicle_id = target(&self.job)?;
        let request: RunRequest = match &self.job.data {
            Some(data) => serde_json::from_slice(data).context("invalid run request")?,
            None => RunRequest {
                use_continuation: false,
            },
        };
        debug!(vehicle_id, use_continuation = request.use_continuation, "Running vehicle slice");
        launcher
            .run_vehicle(vehicle_id, request.use_continuation)
            .await?;
        Ok(())
    }
}

// ============================================================================
// Migration queue
// ============================================================================

/// Creates the migration runnables: send, send-ack, receive and continue.
pub struct MigrationJobFactory {
    migrator: Weak<Migrator>,
}

impl MigrationJobFactory {
    pub fn new(migrator: &Arc<Migrator>) -> Self {
        Self {
            migrator: Arc::downgrade(migrator),
        }
    }
}

impl JobRunnableFactory for MigrationJobFactory {
    fn create_runnable(&self, job: &Job) -> Option<Box<dyn JobRunnable>> {
        let mode = match job.mode()? {
            MODE_SEND => MigrationMode::Send,
            MODE_SEND_ACK => MigrationMode::SendAck,
            MODE_RECEIVE => MigrationMode::Receive,
            MODE_CONTINUE => MigrationMode::Continue,
            _ => return None,
        };
        Some(Box::new(MigrationRunnable {
            migrator: self.migrator.clone(),
            job: job.clone(),
            mode,
        }))
    }
}

#[derive(Debug, Clone, Copy)]
enum MigrationMode {
    Send,
    SendAck,
    Receive,
    Continue,
}

struct MigrationRunnable {
    migrator: Weak<Migrator>,
    job: Job,
    mode: MigrationMode,
}

impl MigrationRunnable {
    fn payload(&self) -> anyhow::Result<&[u8]> {
        self.job
            .data
            .as_deref()
            .with_context(|| format!("job {} carries no payload", self.job.id))
    }
}

#[async_trait]
impl JobRunnable for MigrationRunnable {
    #[instrument(skip(self), fields(job_id = self.job.id, mode = ?self.mode))]
    async fn run(&mut self) -> anyhow::Result<()> {
        let migrator = upgrade(&self.migrator, "migrator")?;
        match self.mode {
            MigrationMode::Send => migrator.send(target(&self.job)?).await?,
            MigrationMode::SendAck => migrator.resend_final_chunk(target(&self.job)?).await?,
            MigrationMode::Receive => migrator.store_chunk(self.payload()?).await?,
            MigrationMode::Continue => migrator.continue_migration(self.payload()?).await?,
        }
        Ok(())
    }
}
