// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::SensorDefinition;
use crate::error::CoreError;
use crate::geodesy::PolarCoordinate;

/// Scheduling state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Pending, not yet ordered.
    Init,
    /// Ordered into the run queue.
    Scheduled,
    /// Currently executed by the real vehicle.
    Running,
    /// Sensor values were collected.
    Completed,
}

impl TaskState {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Scheduled => "SCHEDULED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INIT" => Ok(Self::Init),
            "SCHEDULED" => Ok(Self::Scheduled),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            other => Err(CoreError::Validation {
                field: "task.state".to_string(),
                message: format!("unknown task state '{}'", other),
            }),
        }
    }
}

/// Default acceptance radius around a task position, in meters.
pub const DEFAULT_TOLERANCE: f64 = 5.0;

/// A geolocated measurement job.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    /// Database id. Zero until persisted.
    pub id: i64,
    /// Where the measurement has to be taken.
    pub position: PolarCoordinate,
    pub state: TaskState,
    /// Rank in the run queue, 0 for the task being executed.
    pub order: i32,
    /// Acceptance radius in meters.
    pub tolerance: f64,
    pub distance_to_target: f64,
    pub creation_time: DateTime<Utc>,
    pub execution_start: Option<DateTime<Utc>>,
    pub execution_end: Option<DateTime<Utc>>,
    /// Collected sensor values, opaque to the runtime.
    pub sensor_values: Option<Vec<u8>>,
    /// Sensors a vehicle needs to execute the task.
    pub sensors: Vec<SensorDefinition>,
    /// Virtual vehicle waiting on this task.
    pub vehicle_id: Option<i64>,
}

impl Task {
    /// A pending task created at `creation_time`.
    pub fn new(
        position: PolarCoordinate,
        sensors: Vec<SensorDefinition>,
        creation_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            position,
            state: TaskState::Init,
            order: 0,
            tolerance: DEFAULT_TOLERANCE,
            distance_to_target: 0.0,
            creation_time,
            execution_start: None,
            execution_end: None,
            sensor_values: None,
            sensors,
            vehicle_id: None,
        }
    }
}
