// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{JobQueue, JobRunnableFactory};
use crate::entities::JobStatus;
use crate::error::{CoreError, Result};
use crate::persistence::Persistence;
use crate::time::TimeService;

/// Owns the named job queues of a node and the submission policies on top of them.
pub struct JobService {
    persistence: Arc<dyn Persistence>,
    time: Arc<dyn TimeService>,
    queues: HashMap<String, JobQueue>,
    /// Serializes lookup-then-submit so two callers cannot create twin jobs.
    submit_lock: Mutex<()>,
}

impl JobService {
    /// Create a service with one queue per `(name, pool_size)` pair.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        time: Arc<dyn TimeService>,
        queues: &[(&str, usize)],
    ) -> Self {
        let queues = queues
            .iter()
            .map(|(name, size)| {
                (
                    name.to_string(),
                    JobQueue::new(*name, *size, persistence.clone(), time.clone()),
                )
            })
            .collect();

        Self {
            persistence,
            time,
            queues,
            submit_lock: Mutex::new(()),
        }
    }

    /// Look up a queue by name.
    pub fn queue(&self, name: &str) -> Result<&JobQueue> {
        self.queues
            .get(name)
            .ok_or_else(|| CoreError::not_found("job queue", name))
    }

    /// Register a runnable factory on a queue.
    pub async fn register_factory(
        &self,
        queue: &str,
        factory: Arc<dyn JobRunnableFactory>,
    ) -> Result<()> {
        self.queue(queue)?.register_factory(factory).await;
        Ok(())
    }

    /// Create a fresh job and submit it.
    pub async fn add_job(&self, queue: &str, parameters: &str, data: Option<Vec<u8>>) -> Result<i64> {
        let job_queue = self.queue(queue)?;
        let _lock = self.submit_lock.lock().await;

        let id = self
            .persistence
            .insert_job(queue, parameters, data.as_deref(), self.time.now())
            .await?;
        job_queue.execute(id).await?;
        Ok(id)
    }

    /// Submit a job unless an equal one is already queued or running.
    ///
    /// Returns the id of the existing or new job. A persisted QUEUED job that is
    /// not in flight in this process (left over from a restart) is resubmitted.
    pub async fn add_job_if_not_exists(
        &self,
        queue: &str,
        parameters: &str,
        data: Option<Vec<u8>>,
    ) -> Result<i64> {
        let job_queue = self.queue(queue)?;
        let _lock = self.submit_lock.lock().await;

        if let Some(existing) = self.persistence.find_active_job(queue, parameters).await? {
            if !job_queue.is_running(existing.id) {
                match job_queue.execute(existing.id).await {
                    Ok(()) | Err(CoreError::AlreadyRunning { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
            debug!(queue, job_id = existing.id, parameters, "Job already exists");
            return Ok(existing.id);
        }

        let id = self
            .persistence
            .insert_job(queue, parameters, data.as_deref(), self.time.now())
            .await?;
        job_queue.execute(id).await?;
        Ok(id)
    }

    /// Submit the owning job of an entity.
    ///
    /// The latest job with these parameters is reused with fresh `data`, so an
    /// entity keeps one job id across executions. Fails with
    /// [`CoreError::AlreadyRunning`] while that job is in flight.
    pub async fn dispatch(&self, queue: &str, parameters: &str, data: Option<Vec<u8>>) -> Result<i64> {
        let job_queue = self.queue(queue)?;
        let _lock = self.submit_lock.lock().await;

        let Some(mut job) = self.persistence.find_latest_job(queue, parameters).await? else {
            let id = self
                .persistence
                .insert_job(queue, parameters, data.as_deref(), self.time.now())
                .await?;
            job_queue.execute(id).await?;
            return Ok(id);
        };

        if job_queue.is_running(job.id) {
            return Err(CoreError::AlreadyRunning {
                queue: queue.to_string(),
                job_id: job.id,
            });
        }

        job.data = data;
        self.persistence.update_job(&job).await?;
        job_queue.execute(job.id).await?;
        Ok(job.id)
    }

    /// Resubmit persisted QUEUED jobs that are not in flight. Returns how many were submitted.
    pub async fn execute_queued_jobs(&self) -> Result<usize> {
        let _lock = self.submit_lock.lock().await;
        let mut submitted = 0;

        for (name, queue) in &self.queues {
            for job in self.persistence.list_jobs(name, JobStatus::Queued).await? {
                if queue.is_running(job.id) {
                    continue;
                }
                match queue.execute(job.id).await {
                    Ok(()) => submitted += 1,
                    Err(CoreError::AlreadyRunning { .. }) => {}
                    Err(e) => warn!(queue = %name, job_id = job.id, error = %e, "Failed to resubmit job"),
                }
            }
        }

        if submitted > 0 {
            debug!(submitted, "Resubmitted queued jobs");
        }
        Ok(submitted)
    }

    /// Return jobs left RUNNING by a dead process to QUEUED. Returns how many were reset.
    pub async fn reset_interrupted_jobs(&self) -> Result<usize> {
        let _lock = self.submit_lock.lock().await;
        let mut reset = 0;

        for (name, queue) in &self.queues {
            for mut job in self.persistence.list_jobs(name, JobStatus::Running).await? {
                if queue.is_running(job.id) {
                    continue;
                }
                job.status = JobStatus::Queued;
                job.started = None;
                self.persistence.update_job(&job).await?;
                reset += 1;
            }
        }

        if reset > 0 {
            info!(reset, "Reset interrupted jobs");
        }
        Ok(reset)
    }

    /// Delete terminal jobs that ended more than `older_than` ago.
    pub async fn remove_old_jobs(&self, older_than: chrono::Duration) -> Result<u64> {
        let cutoff = self.time.now() - older_than;
        let removed = self.persistence.delete_terminated_jobs(cutoff).await?;
        if removed > 0 {
            debug!(removed, "Removed old jobs");
        }
        Ok(removed)
    }

    /// Wait until every queue is idle at the same time.
    pub async fn wait_idle(&self) {
        loop {
            for queue in self.queues.values() {
                queue.wait_idle().await;
            }
            if self.queues.values().all(|q| q.running_count() == 0) {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::Job;
    use crate::jobs::{JobRunnable, job_parameters};
    use crate::persistence::SqlitePersistence;
    use crate::time::ManualTimeService;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone, Utc};
    use sqlx::sqlite::SqlitePoolOptions;
    use tokio::sync::Semaphore;

    struct Recorder {
        seen: Arc<std::sync::Mutex<Vec<Option<Vec<u8>>>>>,
        gate: Arc<Semaphore>,
    }

    struct Recorded {
        data: Option<Vec<u8>>,
        seen: Arc<std::sync::Mutex<Vec<Option<Vec<u8>>>>>,
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl JobRunnable for Recorded {
        async fn run(&mut self) -> anyhow::Result<()> {
            let _permit = self.gate.acquire().await?;
            self.seen.lock().unwrap().push(self.data.take());
            Ok(())
        }
    }

    impl JobRunnableFactory for Recorder {
        fn create_runnable(&self, job: &Job) -> Option<Box<dyn JobRunnable>> {
            Some(Box::new(Recorded {
                data: job.data.clone(),
                seen: self.seen.clone(),
                gate: self.gate.clone(),
            }))
        }
    }

    struct Fixture {
        service: JobService,
        persistence: Arc<dyn Persistence>,
        time: Arc<ManualTimeService>,
        seen: Arc<std::sync::Mutex<Vec<Option<Vec<u8>>>>>,
        gate: Arc<Semaphore>,
    }

    async fn fixture(open: bool) -> Fixture {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        crate::migrations::run_sqlite(&pool)
            .await
            .expect("Failed to run migrations");

        let persistence: Arc<dyn Persistence> = Arc::new(SqlitePersistence::new(pool));
        let time = Arc::new(ManualTimeService::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap()));
        let service = JobService::new(persistence.clone(), time.clone(), &[("a", 2), ("b", 1)]);

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let gate = Arc::new(Semaphore::new(if open { 1_000 } else { 0 }));
        for queue in ["a", "b"] {
            service
                .register_factory(
                    queue,
                    Arc::new(Recorder {
                        seen: seen.clone(),
                        gate: gate.clone(),
                    }),
                )
                .await
                .unwrap();
        }

        Fixture {
            service,
            persistence,
            time,
            seen,
            gate,
        }
    }

    #[tokio::test]
    async fn test_add_job_always_creates() {
        let f = fixture(true).await;
        let first = f.service.add_job("a", "mode=x,id=1", None).await.unwrap();
        let second = f.service.add_job("a", "mode=x,id=1", None).await.unwrap();
        assert_ne!(first, second);
        f.service.wait_idle().await;
        assert_eq!(f.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_add_job_if_not_exists_deduplicates_active_jobs() {
        let f = fixture(false).await;
        let params = job_parameters("migration-send", 3);
        let first = f.service.add_job_if_not_exists("a", &params, None).await.unwrap();
        let again = f.service.add_job_if_not_exists("a", &params, None).await.unwrap();
        assert_eq!(first, again);

        f.gate.add_permits(1_000);
        f.service.wait_idle().await;

        let later = f.service.add_job_if_not_exists("a", &params, None).await.unwrap();
        assert_ne!(first, later);
        f.service.wait_idle().await;
    }

    #[tokio::test]
    async fn test_dispatch_reuses_the_owning_job() {
        let f = fixture(false).await;
        let params = job_parameters("vv-run", 7);

        let id = f.service.dispatch("a", &params, Some(b"1".to_vec())).await.unwrap();
        let err = f
            .service
            .dispatch("a", &params, Some(b"2".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::AlreadyRunning { .. }));

        f.gate.add_permits(1_000);
        f.service.wait_idle().await;

        let again = f.service.dispatch("a", &params, Some(b"3".to_vec())).await.unwrap();
        assert_eq!(id, again);
        f.service.wait_idle().await;

        let seen = f.seen.lock().unwrap().clone();
        assert_eq!(seen, vec![Some(b"1".to_vec()), Some(b"3".to_vec())]);
    }

    #[tokio::test]
    async fn test_unknown_queue() {
        let f = fixture(true).await;
        let err = f.service.add_job("nope", "mode=x", None).await.unwrap_err();
        assert_eq!(err.error_code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_recovery_after_restart() {
        let f = fixture(true).await;

        // Records a dead process left behind.
        let queued = f
            .persistence
            .insert_job("a", "mode=x,id=1", None, f.time.now())
            .await
            .unwrap();
        let running = f
            .persistence
            .insert_job("b", "mode=x,id=2", None, f.time.now())
            .await
            .unwrap();
        let mut job = f.persistence.get_job(running).await.unwrap().unwrap();
        job.status = JobStatus::Running;
        job.started = Some(f.time.now());
        f.persistence.update_job(&job).await.unwrap();

        assert_eq!(f.service.reset_interrupted_jobs().await.unwrap(), 1);
        assert_eq!(f.service.execute_queued_jobs().await.unwrap(), 2);
        f.service.wait_idle().await;

        for id in [queued, running] {
            let job = f.persistence.get_job(id).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Ok);
        }
        assert_eq!(f.service.execute_queued_jobs().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remove_old_jobs() {
        let f = fixture(true).await;
        f.service.add_job("a", "mode=x,id=1", None).await.unwrap();
        f.service.wait_idle().await;

        assert_eq!(f.service.remove_old_jobs(Duration::hours(1)).await.unwrap(), 0);
        f.time.advance(Duration::hours(2));
        assert_eq!(f.service.remove_old_jobs(Duration::hours(1)).await.unwrap(), 1);
    }
}
