// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Named, bounded-concurrency job queues.
//!
//! A [`JobQueue`] runs persisted [`Job`](crate::entities::Job) records on a
//! fixed-size worker pool. It guarantees that at most one execution per job id
//! is in flight, and persists every status transition as its own commit:
//!
//! ```text
//! execute(id) ──► QUEUED ──(permit)──► RUNNING ──(runnable)──► OK | FAILED
//! ```
//!
//! What a job actually does is decided by the [`JobRunnableFactory`]
//! instances registered on the queue. The [`JobService`] owns all named queues
//! of a node and adds the submission policies (fresh job, deduplicated job,
//! owning job per entity) on top.

mod queue;
mod service;

pub use queue::JobQueue;
pub use service::JobService;

use async_trait::async_trait;

use crate::entities::Job;

/// Queue executing virtual vehicle script slices.
pub const VEHICLE_QUEUE: &str = "vehicle";

/// Queue executing migration transfer work.
pub const MIGRATION_QUEUE: &str = "migration";

/// One execution of a job.
#[async_trait]
pub trait JobRunnable: Send {
    /// Do the work. An error marks the job FAILED.
    async fn run(&mut self) -> anyhow::Result<()>;
}

/// Turns a job record into something runnable.
pub trait JobRunnableFactory: Send + Sync {
    /// Build the runnable for `job`, or `None` if this factory does not handle it.
    fn create_runnable(&self, job: &Job) -> Option<Box<dyn JobRunnable>>;
}

/// Format job parameters as `mode=<mode>,id=<id>`.
pub fn job_parameters(mode: &str, id: i64) -> String {
    format!("mode={},id={}", mode, id)
}
