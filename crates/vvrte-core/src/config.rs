// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Virtual vehicle runtime configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL
    pub database_url: String,
    /// Name of the real vehicle this node represents, if it should be (re)set on start
    pub real_vehicle_name: Option<String>,
    /// HTTP address for the migration connectors
    pub http_addr: SocketAddr,
    /// Worker pool size of the vehicle execution queue
    pub vehicle_queue_workers: usize,
    /// Worker pool size of the migration queue
    pub migration_queue_workers: usize,
    /// Number of storage entries per migration chunk
    pub migration_chunk_size: usize,
    /// Name of the task scheduling strategy
    pub scheduler: String,
    /// Interval of the stuck-migration sweep
    pub stuck_sweep_interval: Duration,
    /// Minimum time without update before a vehicle counts as stuck
    pub stuck_timeout: Duration,
    /// Interval of the queue-draining hook
    pub queue_drain_interval: Duration,
    /// Interpreter command for the external-process script runtime
    pub script_command: Option<String>,
    /// Largest payload accepted by the connector endpoints, in bytes
    pub max_connector_body_bytes: usize,
}

/// Default connector payload limit: 64 MiB.
pub const DEFAULT_MAX_CONNECTOR_BODY_BYTES: usize = 64 * 1024 * 1024;

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `VVRTE_DATABASE_URL`: SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `VVRTE_REAL_VEHICLE_NAME`: own real vehicle name (default: unset)
    /// - `VVRTE_HTTP_PORT`: connector port (default: 8080)
    /// - `VVRTE_VEHICLE_QUEUE_WORKERS`: vehicle queue pool size (default: 4)
    /// - `VVRTE_MIGRATION_QUEUE_WORKERS`: migration queue pool size (default: 2)
    /// - `VVRTE_MIGRATION_CHUNK_SIZE`: storage entries per chunk (default: 20)
    /// - `VVRTE_SCHEDULER`: scheduling strategy (default: "default")
    /// - `VVRTE_STUCK_SWEEP_INTERVAL_SECS`: sweep interval (default: 60)
    /// - `VVRTE_STUCK_TIMEOUT_SECS`: stuck threshold (default: 120)
    /// - `VVRTE_QUEUE_DRAIN_INTERVAL_SECS`: draining interval (default: 10)
    /// - `VVRTE_SCRIPT_COMMAND`: script interpreter command (default: unset)
    /// - `VVRTE_MAX_CONNECTOR_BODY_BYTES`: connector payload limit (default: 64 MiB)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("VVRTE_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("VVRTE_DATABASE_URL"))?;

        let real_vehicle_name = std::env::var("VVRTE_REAL_VEHICLE_NAME")
            .ok()
            .filter(|name| !name.trim().is_empty());

        let http_port: u16 = parse_var(
            "VVRTE_HTTP_PORT",
            "8080",
            "must be a valid port number",
        )?;

        let vehicle_queue_workers: usize = parse_var(
            "VVRTE_VEHICLE_QUEUE_WORKERS",
            "4",
            "must be a positive integer",
        )?;
        let migration_queue_workers: usize = parse_var(
            "VVRTE_MIGRATION_QUEUE_WORKERS",
            "2",
            "must be a positive integer",
        )?;
        if vehicle_queue_workers == 0 {
            return Err(ConfigError::Invalid(
                "VVRTE_VEHICLE_QUEUE_WORKERS",
                "must be a positive integer",
            ));
        }
        if migration_queue_workers == 0 {
            return Err(ConfigError::Invalid(
                "VVRTE_MIGRATION_QUEUE_WORKERS",
                "must be a positive integer",
            ));
        }

        let migration_chunk_size: usize = parse_var(
            "VVRTE_MIGRATION_CHUNK_SIZE",
            "20",
            "must be a positive integer",
        )?;
        if migration_chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "VVRTE_MIGRATION_CHUNK_SIZE",
                "must be a positive integer",
            ));
        }

        let scheduler = std::env::var("VVRTE_SCHEDULER").unwrap_or_else(|_| "default".to_string());

        let stuck_sweep_interval_secs: u64 = parse_var(
            "VVRTE_STUCK_SWEEP_INTERVAL_SECS",
            "60",
            "must be a number of seconds",
        )?;
        let stuck_timeout_secs: u64 = parse_var(
            "VVRTE_STUCK_TIMEOUT_SECS",
            "120",
            "must be a number of seconds",
        )?;
        let queue_drain_interval_secs: u64 = parse_var(
            "VVRTE_QUEUE_DRAIN_INTERVAL_SECS",
            "10",
            "must be a number of seconds",
        )?;

        let script_command = std::env::var("VVRTE_SCRIPT_COMMAND")
            .ok()
            .filter(|cmd| !cmd.trim().is_empty());

        let max_connector_body_bytes: usize = parse_var(
            "VVRTE_MAX_CONNECTOR_BODY_BYTES",
            &DEFAULT_MAX_CONNECTOR_BODY_BYTES.to_string(),
            "must be a positive number of bytes",
        )?;
        if max_connector_body_bytes == 0 {
            return Err(ConfigError::Invalid(
                "VVRTE_MAX_CONNECTOR_BODY_BYTES",
                "must be a positive number of bytes",
            ));
        }

        Ok(Self {
            database_url,
            real_vehicle_name,
            http_addr: SocketAddr::from(([0, 0, 0, 0], http_port)),
            vehicle_queue_workers,
            migration_queue_workers,
            migration_chunk_size,
            scheduler,
            stuck_sweep_interval: Duration::from_secs(stuck_sweep_interval_secs),
            stuck_timeout: Duration::from_secs(stuck_timeout_secs),
            queue_drain_interval: Duration::from_secs(queue_drain_interval_secs),
            script_command,
            max_connector_body_bytes,
        })
    }
}

fn parse_var<T: FromStr>(
    key: &'static str,
    default: &str,
    hint: &'static str,
) -> Result<T, ConfigError> {
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::Invalid(key, hint))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ALL_VARS: &[&str] = &[
        "VVRTE_DATABASE_URL",
        "VVRTE_REAL_VEHICLE_NAME",
        "VVRTE_HTTP_PORT",
        "VVRTE_VEHICLE_QUEUE_WORKERS",
        "VVRTE_MIGRATION_QUEUE_WORKERS",
        "VVRTE_MIGRATION_CHUNK_SIZE",
        "VVRTE_SCHEDULER",
        "VVRTE_STUCK_SWEEP_INTERVAL_SECS",
        "VVRTE_STUCK_TIMEOUT_SECS",
        "VVRTE_QUEUE_DRAIN_INTERVAL_SECS",
        "VVRTE_SCRIPT_COMMAND",
        "VVRTE_MAX_CONNECTOR_BODY_BYTES",
    ];

    /// Sets env vars for a test and restores them afterwards
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn clean() -> Self {
            let mut guard = Self { vars: Vec::new() };
            for key in ALL_VARS {
                guard.remove(key);
            }
            guard
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("VVRTE_DATABASE_URL", "sqlite::memory:");

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.real_vehicle_name, None);
        assert_eq!(config.http_addr.port(), 8080);
        assert_eq!(config.vehicle_queue_workers, 4);
        assert_eq!(config.migration_queue_workers, 2);
        assert_eq!(config.migration_chunk_size, 20);
        assert_eq!(config.scheduler, "default");
        assert_eq!(config.stuck_sweep_interval, Duration::from_secs(60));
        assert_eq!(config.stuck_timeout, Duration::from_secs(120));
        assert_eq!(config.queue_drain_interval, Duration::from_secs(10));
        assert!(config.script_command.is_none());
        assert_eq!(config.max_connector_body_bytes, 64 * 1024 * 1024);
    }

    #[test]
    fn test_config_from_env_with_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("VVRTE_DATABASE_URL", "sqlite:node.db");
        guard.set("VVRTE_REAL_VEHICLE_NAME", "rv01");
        guard.set("VVRTE_HTTP_PORT", "9090");
        guard.set("VVRTE_MIGRATION_CHUNK_SIZE", "5");
        guard.set("VVRTE_SCHEDULER", "reverse");
        guard.set("VVRTE_SCRIPT_COMMAND", "vv-interpreter --json");
        guard.set("VVRTE_MAX_CONNECTOR_BODY_BYTES", "1048576");

        let config = Config::from_env().unwrap();

        assert_eq!(config.real_vehicle_name.as_deref(), Some("rv01"));
        assert_eq!(config.http_addr.port(), 9090);
        assert_eq!(config.migration_chunk_size, 5);
        assert_eq!(config.scheduler, "reverse");
        assert_eq!(
            config.script_command.as_deref(),
            Some("vv-interpreter --json")
        );
        assert_eq!(config.max_connector_body_bytes, 1_048_576);
    }

    #[test]
    fn test_config_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::clean();

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("VVRTE_DATABASE_URL")));
    }

    #[test]
    fn test_config_rejects_zero_chunk_size() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("VVRTE_DATABASE_URL", "sqlite::memory:");
        guard.set("VVRTE_MIGRATION_CHUNK_SIZE", "0");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("VVRTE_MIGRATION_CHUNK_SIZE", _)
        ));
    }

    #[test]
    fn test_config_rejects_bad_port() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("VVRTE_DATABASE_URL", "sqlite::memory:");
        guard.set("VVRTE_HTTP_PORT", "not-a-port");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("VVRTE_HTTP_PORT", _)));
    }
}
