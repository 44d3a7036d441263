// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Placement decisions: run a task here or migrate to another real vehicle.

use std::sync::Arc;

use tracing::{debug, warn};
use vvrte_core::entities::{RealVehicle, Task};
use vvrte_core::geodesy::AreaOfOperation;
use vvrte_core::persistence::Persistence;

use crate::error::Result;

/// Outcome of [`Mapper::decide`].
#[derive(Debug, Clone, PartialEq)]
pub struct MappingDecision {
    /// True if the task cannot be executed on this real vehicle.
    pub migrate: bool,
    /// Suitable destinations in scan order. The first one is used.
    pub candidates: Vec<RealVehicle>,
    /// The task the decision was made for.
    pub task: Option<Task>,
}

impl MappingDecision {
    /// Keep the task on this real vehicle.
    pub fn local(task: Task) -> Self {
        Self {
            migrate: false,
            candidates: Vec::new(),
            task: Some(task),
        }
    }

    /// Migrate toward `candidates`.
    pub fn migrate(task: Option<Task>, candidates: Vec<RealVehicle>) -> Self {
        Self {
            migrate: true,
            candidates,
            task,
        }
    }
}

/// Decides where a task has to be executed.
pub struct Mapper {
    persistence: Arc<dyn Persistence>,
}

impl Mapper {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }

    /// Decide whether `task` stays local or migrates, and where to.
    ///
    /// Without an own real vehicle the decision is to migrate with no
    /// candidates. Otherwise the task stays local when the own geofence
    /// contains its position and the own sensors cover it. Else every other
    /// active real vehicle satisfying both is a candidate, falling back to the
    /// ground stations when none does.
    pub async fn decide(&self, task: &Task) -> Result<MappingDecision> {
        let Some(own) = self.persistence.find_own_real_vehicle().await? else {
            warn!("Own real vehicle unknown, deferring placement");
            return Ok(MappingDecision::migrate(Some(task.clone()), Vec::new()));
        };

        if Self::is_suitable(&own, task) {
            debug!(real_vehicle = %own.name, "Task stays local");
            return Ok(MappingDecision::local(task.clone()));
        }

        let mut candidates: Vec<RealVehicle> = self
            .persistence
            .find_all_active_real_vehicles_except(own.id)
            .await?
            .into_iter()
            .filter(|rv| Self::is_suitable(rv, task))
            .collect();

        if candidates.is_empty() {
            candidates = self
                .persistence
                .find_all_ground_stations()
                .await?
                .into_iter()
                .filter(|gs| gs.id != own.id)
                .collect();
        }

        debug!(
            candidates = candidates.len(),
            latitude = task.position.latitude,
            longitude = task.position.longitude,
            "Task has to migrate"
        );
        Ok(MappingDecision::migrate(Some(task.clone()), candidates))
    }

    fn is_suitable(rv: &RealVehicle, task: &Task) -> bool {
        let area = rv.area().unwrap_or_else(|e| {
            warn!(real_vehicle = %rv.name, error = %e, "Ignoring unreadable area of operation");
            AreaOfOperation::default()
        });
        area.contains(&task.position) && rv.has_sensors(&task.sensors)
    }
}
