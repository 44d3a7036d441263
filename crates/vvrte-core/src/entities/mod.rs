// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain records shared by the job queues, the persistence layer and the node services.

mod job;
mod real_vehicle;
mod task;
mod virtual_vehicle;

pub use job::{Job, JobStatus};
pub use real_vehicle::{RealVehicle, RealVehicleType, SensorDefinition, SensorVisibility};
pub use task::{DEFAULT_TOLERANCE, Task, TaskState};
pub use virtual_vehicle::{VirtualVehicle, VirtualVehicleState, VirtualVehicleStorage};

/// Parameter naming the real vehicle this node represents.
pub const OWN_REAL_VEHICLE_PARAMETER: &str = "realVehicleName";
