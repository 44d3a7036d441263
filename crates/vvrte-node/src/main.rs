// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! VVRTE Node - one real vehicle of the virtual vehicle runtime
//!
//! The node:
//! - Runs virtual vehicle scripts on the vehicle job queue
//! - Migrates virtual vehicles to and from other real vehicles
//! - Serves the migration connectors over HTTP
//! - Sweeps stuck migrations periodically

use std::sync::Arc;

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::{error, info, warn};

use vvrte_core::config::Config;
use vvrte_core::persistence::SqlitePersistence;
use vvrte_core::time::SystemTimeService;
use vvrte_node::http::HttpCommunicationService;
use vvrte_node::runtime::NodeRuntime;
use vvrte_node::script::{MockScriptRuntime, ProcessScriptRuntime, ScriptRuntime};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vvrte_node=info,vvrte_core=info".into()),
        )
        .init();

    info!("Starting VVRTE Node");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        http_addr = %config.http_addr,
        real_vehicle = ?config.real_vehicle_name,
        scheduler = %config.scheduler,
        chunk_size = config.migration_chunk_size,
        "Configuration loaded"
    );

    info!("Connecting to database...");
    let options: SqliteConnectOptions = config.database_url.parse()?;
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options.create_if_missing(true))
        .await?;

    info!("Running database migrations...");
    vvrte_core::migrations::run_sqlite(&pool).await?;
    info!("Migrations completed");

    let time = Arc::new(SystemTimeService);
    let scripts: Arc<dyn ScriptRuntime> = match &config.script_command {
        Some(command) => Arc::new(ProcessScriptRuntime::new(command, time.clone())?),
        None => {
            warn!("VVRTE_SCRIPT_COMMAND not set, virtual vehicles finish without executing");
            Arc::new(MockScriptRuntime::new())
        }
    };

    let runtime = NodeRuntime::builder()
        .config(&config)
        .persistence(Arc::new(SqlitePersistence::new(pool.clone())))
        .script_runtime(scripts)
        .communication(Arc::new(HttpCommunicationService::new()))
        .time(time)
        .build()?
        .start()
        .await?;

    info!("VVRTE Node initialized successfully");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    pool.close().await;
    info!("Shutdown complete");

    Ok(())
}
