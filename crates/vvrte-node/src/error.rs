// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for vvrte-node.

use thiserror::Error;
use vvrte_core::CoreError;

/// Node errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] vvrte_core::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation failed, including archive encoding.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Core operation failed.
    #[error("{0}")]
    Core(#[from] CoreError),

    /// The script runtime could not create or run a worker.
    #[error("Script error: {0}")]
    Script(String),
}

impl Error {
    /// Stable error code for remote callers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Core(e) => e.error_code(),
            Self::Script(_) => "SCRIPT_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Io(_) | Self::Json(_) => "INTERNAL_ERROR",
        }
    }

    /// The wrapped core error, if any.
    pub fn as_core(&self) -> Option<&CoreError> {
        match self {
            Self::Core(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type using node Error.
pub type Result<T> = std::result::Result<T, Error>;
