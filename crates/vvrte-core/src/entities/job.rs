// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Execution status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting for a worker.
    Queued,
    /// A worker is executing the job.
    Running,
    /// Finished successfully.
    Ok,
    /// Finished with an error.
    Failed,
}

impl JobStatus {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Ok => "OK",
            Self::Failed => "FAILED",
        }
    }

    /// True for OK and FAILED.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ok | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(Self::Queued),
            "RUNNING" => Ok(Self::Running),
            "OK" => Ok(Self::Ok),
            "FAILED" => Ok(Self::Failed),
            other => Err(CoreError::Validation {
                field: "job.status".to_string(),
                message: format!("unknown job status '{}'", other),
            }),
        }
    }
}

/// A unit of work executed by a job queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// Database id, also the exclusivity key inside its queue.
    pub id: i64,
    /// Name of the queue that executes this job.
    pub queue_name: String,
    /// Current status.
    pub status: JobStatus,
    /// When the record was created.
    pub created: DateTime<Utc>,
    /// When the job was last handed to its queue.
    pub queued: Option<DateTime<Utc>>,
    /// When a worker picked the job up.
    pub started: Option<DateTime<Utc>>,
    /// When the job reached a terminal status.
    pub ended: Option<DateTime<Utc>>,
    /// Free-form parameters, `key=value` pairs separated by commas.
    pub parameters: String,
    /// Optional binary payload.
    pub data: Option<Vec<u8>>,
}

impl Job {
    /// Look up one `key=value` pair in the parameter string.
    ///
    /// ```
    /// # use vvrte_core::entities::{Job, JobStatus};
    /// # let job = Job { id: 1, queue_name: "migration".into(), status: JobStatus::Queued,
    /// #     created: chrono::Utc::now(), queued: None, started: None, ended: None,
    /// #     parameters: "mode=migration-send,id=7".into(), data: None };
    /// assert_eq!(job.parameter("mode"), Some("migration-send"));
    /// assert_eq!(job.parameter("id"), Some("7"));
    /// assert_eq!(job.parameter("missing"), None);
    /// ```
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.split(',').find_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            (k.trim() == key).then(|| v.trim())
        })
    }

    /// The `mode` parameter, naming the kind of work.
    pub fn mode(&self) -> Option<&str> {
        self.parameter("mode")
    }

    /// The numeric `id` parameter.
    pub fn target_id(&self) -> Option<i64> {
        self.parameter("id").and_then(|id| id.parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(parameters: &str) -> Job {
        Job {
            id: 1,
            queue_name: "q".into(),
            status: JobStatus::Queued,
            created: Utc::now(),
            queued: None,
            started: None,
            ended: None,
            parameters: parameters.into(),
            data: None,
        }
    }

    #[test]
    fn test_parameters() {
        let run = job("mode=vv-run, id=12");
        assert_eq!(run.mode(), Some("vv-run"));
        assert_eq!(run.target_id(), Some(12));

        let receive = job("mode=migration-receive");
        assert_eq!(receive.mode(), Some("migration-receive"));
        assert_eq!(receive.target_id(), None);
    }

    #[test]
    fn test_status_round_trip_through_strings() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Ok,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("DONE".parse::<JobStatus>().is_err());
        assert!(JobStatus::Ok.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }
}
