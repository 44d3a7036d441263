// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Lifecycle state of a virtual vehicle.
///
/// ```text
///  INIT ──start──► RUNNING ──yield──► TASK_COMPLETION_AWAITED / INTERRUPTED
///                     │                        │
///                     │               decision │ migrate
///                     ▼                        ▼
///              FINISHED / DEFECTIVE    MIGRATION_AWAITED_SND ──► MIGRATING_SND
///                                                                  │
///                                  MIGRATION_COMPLETED_SND ◄───────┘
///
///  (receiver) MIGRATING_RCV ──last chunk acked──► MIGRATION_COMPLETED_RCV ──► RUNNING
///                  │
///                  └──ack failed──► MIGRATION_INTERRUPTED_RCV
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VirtualVehicleState {
    /// Created, never started.
    Init,
    /// The script is executing.
    Running,
    /// Paused until the assigned task completes.
    TaskCompletionAwaited,
    /// Paused by the script.
    Interrupted,
    /// The script ran to completion.
    Finished,
    /// The script crashed or could not be started.
    Defective,
    /// Waiting for the migration send job to pick the vehicle up.
    MigrationAwaitedSnd,
    /// Chunks are being sent.
    MigratingSnd,
    /// Sending stopped, either on a transport error or for lack of a destination.
    MigrationInterruptedSnd,
    /// The last chunk has been handed to the destination.
    MigrationCompletedSnd,
    /// Chunks are being received.
    MigratingRcv,
    /// All chunks arrived and were acknowledged.
    MigrationCompletedRcv,
    /// Acknowledging a received chunk failed.
    MigrationInterruptedRcv,
}

use VirtualVehicleState::*;

impl VirtualVehicleState {
    /// Every state, in declaration order.
    pub const ALL: &'static [VirtualVehicleState] = &[
        Init,
        Running,
        TaskCompletionAwaited,
        Interrupted,
        Finished,
        Defective,
        MigrationAwaitedSnd,
        MigratingSnd,
        MigrationInterruptedSnd,
        MigrationCompletedSnd,
        MigratingRcv,
        MigrationCompletedRcv,
        MigrationInterruptedRcv,
    ];

    /// States a vehicle may be started from.
    pub const STATES_FOR_START: &'static [VirtualVehicleState] = &[Init];

    /// States a vehicle may be stopped or terminated from.
    pub const STATES_FOR_STOP: &'static [VirtualVehicleState] = &[
        Running,
        TaskCompletionAwaited,
        Interrupted,
        MigrationAwaitedSnd,
        MigrationInterruptedSnd,
        MigrationInterruptedRcv,
    ];

    /// States a paused vehicle may be resumed locally from its continuation.
    pub const STATES_FOR_RESUME: &'static [VirtualVehicleState] = &[
        Interrupted,
        TaskCompletionAwaited,
        MigrationInterruptedSnd,
        MigrationInterruptedRcv,
        MigrationCompletedRcv,
    ];

    /// States a vehicle may be restarted from scratch from.
    pub const STATES_FOR_RESTART: &'static [VirtualVehicleState] = &[Finished, Defective];

    /// States a vehicle may be deleted in.
    pub const STATES_FOR_DELETE: &'static [VirtualVehicleState] = &[
        Init,
        Finished,
        Defective,
        MigrationInterruptedSnd,
        MigrationInterruptedRcv,
    ];

    /// States in which a known vehicle accepts further migration chunks.
    pub const STATES_FOR_MIGRATION_RCV: &'static [VirtualVehicleState] =
        &[MigratingRcv, MigrationInterruptedRcv];

    /// Pre-migration states that are kept as-is once the migration completes.
    pub const NO_CHANGE_AFTER_MIGRATION: &'static [VirtualVehicleState] = &[Finished, Defective];

    /// States the stuck-migration sweep acts on when this node is not a ground station.
    pub const STUCK_STATES_FROM_RV: &'static [VirtualVehicleState] = &[
        MigrationAwaitedSnd,
        MigratingSnd,
        MigrationInterruptedSnd,
        MigrationCompletedSnd,
        MigratingRcv,
        TaskCompletionAwaited,
        Finished,
        Defective,
    ];

    /// States the stuck-migration sweep acts on when this node is a ground station.
    pub const STUCK_STATES_FROM_GS: &'static [VirtualVehicleState] = &[
        MigrationAwaitedSnd,
        MigratingSnd,
        MigrationInterruptedSnd,
        MigrationCompletedSnd,
        MigratingRcv,
        TaskCompletionAwaited,
    ];

    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Init => "INIT",
            Running => "RUNNING",
            TaskCompletionAwaited => "TASK_COMPLETION_AWAITED",
            Interrupted => "INTERRUPTED",
            Finished => "FINISHED",
            Defective => "DEFECTIVE",
            MigrationAwaitedSnd => "MIGRATION_AWAITED_SND",
            MigratingSnd => "MIGRATING_SND",
            MigrationInterruptedSnd => "MIGRATION_INTERRUPTED_SND",
            MigrationCompletedSnd => "MIGRATION_COMPLETED_SND",
            MigratingRcv => "MIGRATING_RCV",
            MigrationCompletedRcv => "MIGRATION_COMPLETED_RCV",
            MigrationInterruptedRcv => "MIGRATION_INTERRUPTED_RCV",
        }
    }

    /// True if `self` is a member of `set`.
    pub fn is_in(&self, set: &[VirtualVehicleState]) -> bool {
        set.contains(self)
    }

    /// Render a state set for error messages, e.g. `[INIT, RUNNING]`.
    pub fn describe(set: &[VirtualVehicleState]) -> String {
        let names: Vec<&str> = set.iter().map(|s| s.as_str()).collect();
        format!("[{}]", names.join(", "))
    }
}

impl fmt::Display for VirtualVehicleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VirtualVehicleState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| CoreError::Validation {
                field: "virtual_vehicle.state".to_string(),
                message: format!("unknown state '{}'", s),
            })
    }
}

/// A mobile, interruptible script unit.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualVehicle {
    /// Local database id. Zero until persisted.
    pub id: i64,
    /// Stable identity across migrations.
    pub uuid: String,
    /// Display name.
    pub name: String,
    /// Script API version the code was written against.
    pub api_version: i32,
    /// Script source.
    pub code: Option<String>,
    /// Opaque paused-execution snapshot.
    pub continuation: Option<Vec<u8>>,
    /// Lifecycle state.
    pub state: VirtualVehicleState,
    /// State the vehicle had when its current migration began.
    pub pre_migration_state: Option<VirtualVehicleState>,
    /// Human-readable detail about the current state.
    pub state_info: Option<String>,
    /// Task the vehicle currently waits on.
    pub task_id: Option<i64>,
    /// Real vehicle the vehicle is migrating away from.
    pub migration_source_id: Option<i64>,
    /// Real vehicle the vehicle is migrating to.
    pub migration_destination_id: Option<i64>,
    /// When the current migration began.
    pub migration_start_time: Option<DateTime<Utc>>,
    /// Migration cursor: the chunk currently in flight.
    pub chunk_number: i32,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub update_time: Option<DateTime<Utc>>,
}

impl VirtualVehicle {
    /// A fresh vehicle in [`VirtualVehicleState::Init`] with a random UUID.
    pub fn new(name: impl Into<String>, api_version: i32, code: impl Into<String>) -> Self {
        Self {
            id: 0,
            uuid: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            api_version,
            code: Some(code.into()),
            continuation: None,
            state: Init,
            pre_migration_state: None,
            state_info: None,
            task_id: None,
            migration_source_id: None,
            migration_destination_id: None,
            migration_start_time: None,
            chunk_number: 0,
            start_time: None,
            end_time: None,
            update_time: None,
        }
    }

    /// Drop every trace of a migration episode.
    pub fn clear_migration(&mut self) {
        self.pre_migration_state = None;
        self.migration_source_id = None;
        self.migration_destination_id = None;
        self.migration_start_time = None;
        self.chunk_number = 0;
    }
}

/// One named entry of a virtual vehicle's private key/value storage.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualVehicleStorage {
    /// Database id. Zero until persisted.
    pub id: i64,
    /// Owning vehicle.
    pub vehicle_id: i64,
    /// Entry name, unique per vehicle.
    pub name: String,
    /// Last modification.
    pub modification_time: DateTime<Utc>,
    /// Raw content.
    pub content: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_strings_round_trip() {
        for state in VirtualVehicleState::ALL {
            assert_eq!(state.as_str().parse::<VirtualVehicleState>().unwrap(), *state);
        }
        assert!("PAUSED".parse::<VirtualVehicleState>().is_err());
    }

    #[test]
    fn test_serde_uses_screaming_snake_case() {
        let json = serde_json::to_string(&MigrationAwaitedSnd).unwrap();
        assert_eq!(json, "\"MIGRATION_AWAITED_SND\"");
    }

    #[test]
    fn test_start_only_from_init() {
        for state in VirtualVehicleState::ALL {
            assert_eq!(
                state.is_in(VirtualVehicleState::STATES_FOR_START),
                *state == Init
            );
        }
    }

    #[test]
    fn test_running_vehicles_cannot_be_deleted_or_restarted() {
        for state in [Running, MigratingSnd, MigratingRcv, MigrationAwaitedSnd] {
            assert!(!state.is_in(VirtualVehicleState::STATES_FOR_DELETE));
            assert!(!state.is_in(VirtualVehicleState::STATES_FOR_RESTART));
        }
    }

    #[test]
    fn test_ground_station_sweep_leaves_finished_vehicles_alone() {
        assert!(!Finished.is_in(VirtualVehicleState::STUCK_STATES_FROM_GS));
        assert!(Finished.is_in(VirtualVehicleState::STUCK_STATES_FROM_RV));
        for state in VirtualVehicleState::STUCK_STATES_FROM_GS {
            assert!(state.is_in(VirtualVehicleState::STUCK_STATES_FROM_RV));
        }
    }

    #[test]
    fn test_describe() {
        assert_eq!(
            VirtualVehicleState::describe(VirtualVehicleState::STATES_FOR_RESTART),
            "[FINISHED, DEFECTIVE]"
        );
    }

    #[test]
    fn test_new_vehicle() {
        let a = VirtualVehicle::new("vv1", 1, "print('hi')");
        let b = VirtualVehicle::new("vv1", 1, "print('hi')");
        assert_eq!(a.state, Init);
        assert_eq!(a.chunk_number, 0);
        assert_ne!(a.uuid, b.uuid);
    }
}
