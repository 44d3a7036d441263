// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for vvrte-core.
//!
//! One error type is shared by the job queues, the persistence layer and the
//! node services. Each variant maps to a stable error code that the HTTP
//! connector surface hands back to remote callers.

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by the runtime core.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum CoreError {
    /// A record was not found.
    NotFound {
        /// Kind of record ("virtual vehicle", "job", ...).
        entity: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// An operation was attempted from a disallowed lifecycle state.
    InvalidState {
        /// Kind of record.
        entity: &'static str,
        /// Identifier of the record.
        id: String,
        /// Human-readable description of the allowed states.
        expected: String,
        /// The state the record was actually in.
        actual: String,
    },

    /// A job was submitted while a previous execution of the same id still runs.
    AlreadyRunning {
        /// Queue the job belongs to.
        queue: String,
        /// The job id.
        job_id: i64,
    },

    /// A migration archive was malformed or arrived out of order.
    TransferError {
        /// What was wrong with the archive.
        reason: String,
    },

    /// The acknowledgement of a migration chunk could not be delivered.
    AckFailure {
        /// UUID of the virtual vehicle being migrated.
        vehicle: String,
        /// Transport or remote failure detail.
        reason: String,
    },

    /// A migration was requested but no destination is known.
    NoDestination {
        /// UUID of the virtual vehicle.
        vehicle: String,
    },

    /// Input validation failed.
    Validation {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    Database {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::AlreadyRunning { .. } => "ALREADY_RUNNING",
            Self::TransferError { .. } => "TRANSFER_ERROR",
            Self::AckFailure { .. } => "ACK_FAILURE",
            Self::NoDestination { .. } => "NO_DESTINATION",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Database { .. } => "DATABASE_ERROR",
        }
    }

    /// Shorthand for a [`CoreError::TransferError`].
    pub fn transfer(reason: impl Into<String>) -> Self {
        Self::TransferError {
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`CoreError::NotFound`].
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { entity, id } => write!(f, "No {} found for '{}'", entity, id),
            Self::InvalidState {
                entity,
                id,
                expected,
                actual,
            } => write!(
                f,
                "The {} '{}' is in state {}, but expected {}",
                entity, id, actual, expected
            ),
            Self::AlreadyRunning { queue, job_id } => {
                write!(f, "Job {} is already running in queue '{}'", job_id, queue)
            }
            Self::TransferError { reason } => write!(f, "Migration transfer failed: {}", reason),
            Self::AckFailure { vehicle, reason } => write!(
                f,
                "Acknowledging migration of virtual vehicle {} failed: {}",
                vehicle, reason
            ),
            Self::NoDestination { vehicle } => {
                write!(f, "No migration destination for virtual vehicle {}", vehicle)
            }
            Self::Validation { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::Database { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::Database {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Database {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}
