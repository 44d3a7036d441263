// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::{Notify, RwLock, Semaphore};
use tracing::{debug, error, info, instrument, warn};

use super::{JobRunnable, JobRunnableFactory};
use crate::entities::{Job, JobStatus};
use crate::error::{CoreError, Result};
use crate::persistence::Persistence;
use crate::time::TimeService;

/// A named worker pool with per-id mutual exclusion.
///
/// Cloning is cheap; clones share the pool.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    name: String,
    persistence: Arc<dyn Persistence>,
    time: Arc<dyn TimeService>,
    permits: Arc<Semaphore>,
    /// Ids claimed by this process, from submission until the final commit.
    running: Arc<Mutex<HashSet<i64>>>,
    idle: Arc<Notify>,
    factories: RwLock<Vec<Arc<dyn JobRunnableFactory>>>,
}

/// Releases a claimed job id when the execution is over.
struct RunningGuard {
    job_id: i64,
    running: Arc<Mutex<HashSet<i64>>>,
    idle: Arc<Notify>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        running.remove(&self.job_id);
        if running.is_empty() {
            self.idle.notify_waiters();
        }
    }
}

impl JobQueue {
    /// Create a queue running at most `pool_size` jobs at once.
    pub fn new(
        name: impl Into<String>,
        pool_size: usize,
        persistence: Arc<dyn Persistence>,
        time: Arc<dyn TimeService>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                name: name.into(),
                persistence,
                time,
                permits: Arc::new(Semaphore::new(pool_size.max(1))),
                running: Arc::new(Mutex::new(HashSet::new())),
                idle: Arc::new(Notify::new()),
                factories: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Add a factory. Factories are asked in registration order.
    pub async fn register_factory(&self, factory: Arc<dyn JobRunnableFactory>) {
        self.inner.factories.write().await.push(factory);
    }

    /// True while an execution of `job_id` is queued or running in this process.
    pub fn is_running(&self, job_id: i64) -> bool {
        self.inner
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&job_id)
    }

    /// Number of executions queued or running in this process.
    pub fn running_count(&self) -> usize {
        self.inner
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Submit a persisted job for execution.
    ///
    /// Fails with [`CoreError::AlreadyRunning`] while a previous execution of
    /// the same id is in flight. A job that already reached a terminal status
    /// is executed again from scratch.
    #[instrument(skip(self), fields(queue = %self.inner.name))]
    pub async fn execute(&self, job_id: i64) -> Result<()> {
        let mut job = self
            .inner
            .persistence
            .get_job(job_id)
            .await?
            .ok_or_else(|| CoreError::not_found("job", job_id))?;

        let guard = self.claim(job_id)?;

        job.status = JobStatus::Queued;
        job.queued = Some(self.inner.time.now());
        job.started = None;
        job.ended = None;
        self.inner.persistence.update_job(&job).await?;

        debug!(job_id, parameters = %job.parameters, "Job queued");

        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.work(job, guard).await;
        });

        Ok(())
    }

    /// Wait until no execution is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.running_count() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn claim(&self, job_id: i64) -> Result<RunningGuard> {
        let mut running = self
            .inner
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if !running.insert(job_id) {
            return Err(CoreError::AlreadyRunning {
                queue: self.inner.name.clone(),
                job_id,
            });
        }
        Ok(RunningGuard {
            job_id,
            running: self.inner.running.clone(),
            idle: self.inner.idle.clone(),
        })
    }
}

impl QueueInner {
    async fn work(self: Arc<Self>, mut job: Job, _guard: RunningGuard) {
        let _permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                warn!(queue = %self.name, job_id = job.id, "Worker pool closed, job left queued");
                return;
            }
        };

        job.status = JobStatus::Running;
        job.started = Some(self.time.now());
        if let Err(e) = self.persistence.update_job(&job).await {
            error!(queue = %self.name, job_id = job.id, error = %e, "Failed to mark job running");
            return;
        }

        let status = match self.create_runnable(&job).await {
            Some(runnable) => Self::run_isolated(&self.name, job.id, runnable).await,
            None => {
                error!(
                    queue = %self.name,
                    job_id = job.id,
                    parameters = %job.parameters,
                    "No runnable registered for job"
                );
                JobStatus::Failed
            }
        };

        job.status = status;
        job.ended = Some(self.time.now());
        if let Err(e) = self.persistence.update_job(&job).await {
            error!(queue = %self.name, job_id = job.id, error = %e, "Failed to record job outcome");
            return;
        }

        info!(queue = %self.name, job_id = job.id, status = %status, "Job ended");
    }

    async fn create_runnable(&self, job: &Job) -> Option<Box<dyn JobRunnable>> {
        let factories = self.factories.read().await;
        factories.iter().find_map(|f| f.create_runnable(job))
    }

    /// Run on a separate task so a panic ends the job instead of the worker.
    async fn run_isolated(queue: &str, job_id: i64, mut runnable: Box<dyn JobRunnable>) -> JobStatus {
        match tokio::spawn(async move { runnable.run().await }).await {
            Ok(Ok(())) => JobStatus::Ok,
            Ok(Err(e)) => {
                error!(queue, job_id, error = %e, "Job failed");
                JobStatus::Failed
            }
            Err(e) => {
                error!(queue, job_id, error = %e, "Job panicked");
                JobStatus::Failed
            }
        }
    }
}
