// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for one real-vehicle node.
//!
//! [`NodeRuntime`] wires the job service, launcher, migrator, scheduler and the
//! background workers together, so a node can run inside an existing tokio
//! application or in tests.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use vvrte_core::persistence::SqlitePersistence;
//! use vvrte_node::http::HttpCommunicationService;
//! use vvrte_node::runtime::NodeRuntime;
//! use vvrte_node::script::MockScriptRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let persistence = Arc::new(SqlitePersistence::from_path("data/node.db").await?);
//!
//!     let runtime = NodeRuntime::builder()
//!         .persistence(persistence)
//!         .script_runtime(Arc::new(MockScriptRuntime::new()))
//!         .communication(Arc::new(HttpCommunicationService::new()))
//!         .real_vehicle_name("rv1")
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};
use vvrte_core::communication::CommunicationService;
use vvrte_core::config::Config;
#[cfg(feature = "http")]
use vvrte_core::config::DEFAULT_MAX_CONNECTOR_BODY_BYTES;
use vvrte_core::entities::{OWN_REAL_VEHICLE_PARAMETER, Task};
use vvrte_core::jobs::{JobService, MIGRATION_QUEUE, VEHICLE_QUEUE};
use vvrte_core::persistence::Persistence;
use vvrte_core::time::{SystemTimeService, TimeService};

use crate::job_factories::{MigrationJobFactory, VehicleJobFactory};
use crate::launcher::Launcher;
use crate::mapper::Mapper;
use crate::migrator::{DEFAULT_CHUNK_SIZE, Migrator};
use crate::scheduler::TaskScheduler;
use crate::script::ScriptRuntime;
use crate::stuck_migration_monitor::{
    QueueDrainConfig, QueueDrainWorker, StuckMigrationMonitor, StuckMigrationMonitorConfig,
};

/// Builder for [`NodeRuntime`].
pub struct NodeRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    script_runtime: Option<Arc<dyn ScriptRuntime>>,
    communication: Option<Arc<dyn CommunicationService>>,
    time: Arc<dyn TimeService>,
    real_vehicle_name: Option<String>,
    vehicle_queue_workers: usize,
    migration_queue_workers: usize,
    migration_chunk_size: usize,
    scheduler: String,
    stuck_sweep_interval: Duration,
    stuck_timeout: Duration,
    queue_drain_interval: Duration,
    job_retention: Duration,
    #[cfg(feature = "http")]
    http_addr: Option<std::net::SocketAddr>,
    #[cfg(feature = "http")]
    max_connector_body_bytes: usize,
}

impl Default for NodeRuntimeBuilder {
    fn default() -> Self {
        let monitor = StuckMigrationMonitorConfig::default();
        let drain = QueueDrainConfig::default();
        Self {
            persistence: None,
            script_runtime: None,
            communication: None,
            time: Arc::new(SystemTimeService),
            real_vehicle_name: None,
            vehicle_queue_workers: 4,
            migration_queue_workers: 2,
            migration_chunk_size: DEFAULT_CHUNK_SIZE,
            scheduler: "default".to_string(),
            stuck_sweep_interval: monitor.poll_interval,
            stuck_timeout: monitor.stuck_timeout,
            queue_drain_interval: drain.poll_interval,
            job_retention: drain.job_retention,
            #[cfg(feature = "http")]
            http_addr: None,
            #[cfg(feature = "http")]
            max_connector_body_bytes: DEFAULT_MAX_CONNECTOR_BODY_BYTES,
        }
    }
}

impl NodeRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every tunable from an environment configuration.
    pub fn config(mut self, config: &Config) -> Self {
        self.real_vehicle_name = config.real_vehicle_name.clone();
        self.vehicle_queue_workers = config.vehicle_queue_workers;
        self.migration_queue_workers = config.migration_queue_workers;
        self.migration_chunk_size = config.migration_chunk_size;
        self.scheduler = config.scheduler.clone();
        self.stuck_sweep_interval = config.stuck_sweep_interval;
        self.stuck_timeout = config.stuck_timeout;
        self.queue_drain_interval = config.queue_drain_interval;
        #[cfg(feature = "http")]
        {
            self.http_addr = Some(config.http_addr);
            self.max_connector_body_bytes = config.max_connector_body_bytes;
        }
        self
    }

    /// Set the persistence backend (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the script runtime executing vehicle code (required).
    pub fn script_runtime(mut self, runtime: Arc<dyn ScriptRuntime>) -> Self {
        self.script_runtime = Some(runtime);
        self
    }

    /// Set the transport to other real vehicles (required).
    pub fn communication(mut self, communication: Arc<dyn CommunicationService>) -> Self {
        self.communication = Some(communication);
        self
    }

    /// Set the clock.
    ///
    /// Default: system time
    pub fn time(mut self, time: Arc<dyn TimeService>) -> Self {
        self.time = time;
        self
    }

    /// Name of the real vehicle this node represents, stored on start.
    pub fn real_vehicle_name(mut self, name: impl Into<String>) -> Self {
        self.real_vehicle_name = Some(name.into());
        self
    }

    /// Set the vehicle queue pool size.
    ///
    /// Default: 4
    pub fn vehicle_queue_workers(mut self, workers: usize) -> Self {
        self.vehicle_queue_workers = workers;
        self
    }

    /// Set the migration queue pool size.
    ///
    /// Default: 2
    pub fn migration_queue_workers(mut self, workers: usize) -> Self {
        self.migration_queue_workers = workers;
        self
    }

    /// Set the number of storage entries per migration chunk.
    ///
    /// Default: 20
    pub fn migration_chunk_size(mut self, size: usize) -> Self {
        self.migration_chunk_size = size;
        self
    }

    /// Set the scheduling strategy by name.
    ///
    /// Default: "default"
    pub fn scheduler(mut self, name: impl Into<String>) -> Self {
        self.scheduler = name.into();
        self
    }

    /// Set how often the stuck-migration sweep runs.
    ///
    /// Default: 60 seconds
    pub fn stuck_sweep_interval(mut self, interval: Duration) -> Self {
        self.stuck_sweep_interval = interval;
        self
    }

    /// Set the minimum age of the last update before a vehicle counts as stuck.
    ///
    /// Default: 120 seconds
    pub fn stuck_timeout(mut self, timeout: Duration) -> Self {
        self.stuck_timeout = timeout;
        self
    }

    /// Set how often leftover queued jobs are resubmitted.
    ///
    /// Default: 10 seconds
    pub fn queue_drain_interval(mut self, interval: Duration) -> Self {
        self.queue_drain_interval = interval;
        self
    }

    /// Set how long terminated jobs are kept.
    ///
    /// Default: 24 hours
    pub fn job_retention(mut self, retention: Duration) -> Self {
        self.job_retention = retention;
        self
    }

    /// Serve the HTTP surface on this address.
    ///
    /// Default: no HTTP server
    #[cfg(feature = "http")]
    pub fn http_addr(mut self, addr: std::net::SocketAddr) -> Self {
        self.http_addr = Some(addr);
        self
    }

    /// Set the largest payload the connector endpoints accept.
    ///
    /// Default: 64 MiB
    #[cfg(feature = "http")]
    pub fn max_connector_body_bytes(mut self, bytes: usize) -> Self {
        self.max_connector_body_bytes = bytes;
        self
    }

    /// Validate the configuration.
    pub fn build(self) -> Result<NodeRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let script_runtime = self
            .script_runtime
            .ok_or_else(|| anyhow::anyhow!("script_runtime is required"))?;
        let communication = self
            .communication
            .ok_or_else(|| anyhow::anyhow!("communication is required"))?;

        if self.vehicle_queue_workers == 0 || self.migration_queue_workers == 0 {
            anyhow::bail!("queue pool sizes must be positive");
        }
        if self.migration_chunk_size == 0 {
            anyhow::bail!("migration chunk size must be positive");
        }
        #[cfg(feature = "http")]
        if self.max_connector_body_bytes == 0 {
            anyhow::bail!("connector body limit must be positive");
        }

        Ok(NodeRuntimeConfig {
            persistence,
            script_runtime,
            communication,
            time: self.time,
            real_vehicle_name: self.real_vehicle_name,
            vehicle_queue_workers: self.vehicle_queue_workers,
            migration_queue_workers: self.migration_queue_workers,
            migration_chunk_size: self.migration_chunk_size,
            scheduler: self.scheduler,
            monitor: StuckMigrationMonitorConfig {
                poll_interval: self.stuck_sweep_interval,
                stuck_timeout: self.stuck_timeout,
            },
            drain: QueueDrainConfig {
                poll_interval: self.queue_drain_interval,
                job_retention: self.job_retention,
            },
            #[cfg(feature = "http")]
            http_addr: self.http_addr,
            #[cfg(feature = "http")]
            max_connector_body_bytes: self.max_connector_body_bytes,
        })
    }
}

/// Validated configuration of a [`NodeRuntime`].
pub struct NodeRuntimeConfig {
    persistence: Arc<dyn Persistence>,
    script_runtime: Arc<dyn ScriptRuntime>,
    communication: Arc<dyn CommunicationService>,
    time: Arc<dyn TimeService>,
    real_vehicle_name: Option<String>,
    vehicle_queue_workers: usize,
    migration_queue_workers: usize,
    migration_chunk_size: usize,
    scheduler: String,
    monitor: StuckMigrationMonitorConfig,
    drain: QueueDrainConfig,
    #[cfg(feature = "http")]
    http_addr: Option<std::net::SocketAddr>,
    #[cfg(feature = "http")]
    max_connector_body_bytes: usize,
}

impl NodeRuntimeConfig {
    /// Start the runtime: register the job factories, recover interrupted
    /// jobs and spawn the background workers.
    pub async fn start(self) -> Result<NodeRuntime> {
        let persistence = self.persistence;
        let time = self.time;

        if let Some(name) = &self.real_vehicle_name {
            persistence
                .set_parameter(OWN_REAL_VEHICLE_PARAMETER, name)
                .await?;
        }

        let jobs = Arc::new(JobService::new(
            persistence.clone(),
            time.clone(),
            &[
                (VEHICLE_QUEUE, self.vehicle_queue_workers),
                (MIGRATION_QUEUE, self.migration_queue_workers),
            ],
        ));

        let mapper = Arc::new(Mapper::new(persistence.clone()));
        let launcher = Arc::new(Launcher::new(
            persistence.clone(),
            jobs.clone(),
            self.script_runtime,
            mapper.clone(),
            time.clone(),
        ));
        let migrator = Arc::new(Migrator::new(
            persistence.clone(),
            jobs.clone(),
            self.communication,
            time.clone(),
            launcher.clone(),
            self.migration_chunk_size,
        ));
        let scheduler = Arc::new(TaskScheduler::new(
            persistence.clone(),
            time.clone(),
            &self.scheduler,
        ));

        jobs.register_factory(VEHICLE_QUEUE, Arc::new(VehicleJobFactory::new(&launcher)))
            .await?;
        jobs.register_factory(MIGRATION_QUEUE, Arc::new(MigrationJobFactory::new(&migrator)))
            .await?;

        jobs.reset_interrupted_jobs().await?;
        jobs.execute_queued_jobs().await?;

        let monitor = StuckMigrationMonitor::new(launcher.clone(), self.monitor);
        let monitor_shutdown = monitor.shutdown_handle();
        let monitor_handle = tokio::spawn(async move {
            monitor.run().await;
        });

        let drain = QueueDrainWorker::new(jobs.clone(), self.drain);
        let drain_shutdown = drain.shutdown_handle();
        let drain_handle = tokio::spawn(async move {
            drain.run().await;
        });

        #[cfg(feature = "http")]
        let server = match self.http_addr {
            Some(addr) => {
                let state = Arc::new(crate::http::AppState {
                    launcher: launcher.clone(),
                    migrator: migrator.clone(),
                    persistence: persistence.clone(),
                    max_body_bytes: self.max_connector_body_bytes,
                });
                Some(HttpServer::start(addr, state).await?)
            }
            None => None,
        };

        info!(
            real_vehicle = ?self.real_vehicle_name,
            scheduler = %self.scheduler,
            chunk_size = migrator.chunk_size(),
            "NodeRuntime started"
        );

        Ok(NodeRuntime {
            persistence,
            jobs,
            launcher,
            migrator,
            scheduler,
            monitor_handle,
            drain_handle,
            monitor_shutdown,
            drain_shutdown,
            #[cfg(feature = "http")]
            server,
        })
    }
}

#[cfg(feature = "http")]
struct HttpServer {
    addr: std::net::SocketAddr,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    handle: JoinHandle<std::io::Result<()>>,
}

#[cfg(feature = "http")]
impl HttpServer {
    async fn start(
        addr: std::net::SocketAddr,
        state: Arc<crate::http::AppState>,
    ) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
        let app = crate::http::router(state);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.wait_for(|stop| *stop).await;
                })
                .await
        });

        info!(%addr, "HTTP server listening");
        Ok(Self {
            addr,
            shutdown_tx,
            handle,
        })
    }
}

/// A running node.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct NodeRuntime {
    persistence: Arc<dyn Persistence>,
    jobs: Arc<JobService>,
    launcher: Arc<Launcher>,
    migrator: Arc<Migrator>,
    scheduler: Arc<TaskScheduler>,
    monitor_handle: JoinHandle<()>,
    drain_handle: JoinHandle<()>,
    monitor_shutdown: Arc<Notify>,
    drain_shutdown: Arc<Notify>,
    #[cfg(feature = "http")]
    server: Option<HttpServer>,
}

impl NodeRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> NodeRuntimeBuilder {
        NodeRuntimeBuilder::new()
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    pub fn jobs(&self) -> &Arc<JobService> {
        &self.jobs
    }

    pub fn launcher(&self) -> &Arc<Launcher> {
        &self.launcher
    }

    pub fn migrator(&self) -> &Arc<Migrator> {
        &self.migrator
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    /// Address the HTTP server is bound to, if one runs.
    #[cfg(feature = "http")]
    pub fn http_addr(&self) -> Option<std::net::SocketAddr> {
        self.server.as_ref().map(|s| s.addr)
    }

    /// Complete a task and resume the vehicle waiting on it.
    pub async fn complete_task(
        &self,
        task_id: i64,
        sensor_values: Option<Vec<u8>>,
    ) -> crate::error::Result<Task> {
        let task = self.scheduler.complete(task_id, sensor_values).await?;
        if task.vehicle_id.is_some() {
            self.launcher.notify_task(&task).await?;
        }
        Ok(task)
    }

    /// Wait until no job runs on any queue.
    pub async fn wait_idle(&self) {
        self.jobs.wait_idle().await;
    }

    /// Gracefully shut down the background workers and the HTTP server.
    ///
    /// Jobs in flight are not cancelled; they finish on their own.
    pub async fn shutdown(self) -> Result<()> {
        info!("NodeRuntime shutting down...");

        self.monitor_shutdown.notify_one();
        self.drain_shutdown.notify_one();

        if let Err(e) = self.monitor_handle.await {
            error!("Stuck migration monitor task panicked: {}", e);
        }
        if let Err(e) = self.drain_handle.await {
            error!("Queue drain worker task panicked: {}", e);
        }

        #[cfg(feature = "http")]
        if let Some(server) = self.server {
            let _ = server.shutdown_tx.send(true);
            match server.handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("HTTP server error during shutdown: {}", e),
                Err(e) => error!("HTTP server task panicked: {}", e),
            }
        }

        info!("NodeRuntime shutdown complete");
        Ok(())
    }
}
