// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Virtual vehicle lifecycle.
//!
//! The launcher validates lifecycle requests against the named state sets of
//! [`VirtualVehicleState`], dispatches script slices onto the vehicle queue and
//! turns every yield into the next persisted state. Each vehicle owns exactly
//! one job on the vehicle queue, so its transitions never interleave.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};
use vvrte_core::CoreError;
use vvrte_core::entities::{RealVehicle, Task, TaskState, VirtualVehicle, VirtualVehicleState};
use vvrte_core::jobs::{JobService, MIGRATION_QUEUE, VEHICLE_QUEUE, job_parameters};
use vvrte_core::persistence::Persistence;
use vvrte_core::time::TimeService;

use crate::error::Result;
use crate::mapper::{Mapper, MappingDecision};
use crate::migrator::{MODE_SEND_ACK, submit_send_job};
use crate::script::{ApplicationState, ScriptRuntime, WorkerContext, YIELD_STATES};

/// Job mode executing one script slice of a vehicle.
pub const MODE_RUN: &str = "vv-run";

/// State info recorded by a manual stop.
pub const STOPPED_MANUALLY: &str = "Vehicle has been stopped manually.";

/// Payload of a vehicle run job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RunRequest {
    pub use_continuation: bool,
}

/// Starts, stops and resumes virtual vehicles.
pub struct Launcher {
    persistence: Arc<dyn Persistence>,
    jobs: Arc<JobService>,
    scripts: Arc<dyn ScriptRuntime>,
    mapper: Arc<Mapper>,
    time: Arc<dyn TimeService>,
}

impl Launcher {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        jobs: Arc<JobService>,
        scripts: Arc<dyn ScriptRuntime>,
        mapper: Arc<Mapper>,
        time: Arc<dyn TimeService>,
    ) -> Self {
        Self {
            persistence,
            jobs,
            scripts,
            mapper,
            time,
        }
    }

    /// Start a vehicle from scratch. Only INIT vehicles can be started.
    #[instrument(skip(self))]
    pub async fn start(&self, vehicle_id: i64) -> Result<()> {
        let mut vehicle = self.load(vehicle_id).await?;
        Self::require(&vehicle, VirtualVehicleState::STATES_FOR_START)?;

        vehicle.start_time = Some(self.time.now());
        vehicle.continuation = None;
        vehicle.pre_migration_state = None;
        self.save(&mut vehicle).await?;

        info!(vehicle_id, name = %vehicle.name, "Starting virtual vehicle");
        self.dispatch(vehicle_id, false).await
    }

    /// Stop a vehicle manually and put it into `new_state`.
    ///
    /// `new_state` is INIT for a stop that allows a later start, FINISHED for
    /// a termination.
    #[instrument(skip(self))]
    pub async fn stop(&self, vehicle_id: i64, new_state: VirtualVehicleState) -> Result<()> {
        if !matches!(
            new_state,
            VirtualVehicleState::Init | VirtualVehicleState::Finished
        ) {
            return Err(CoreError::Validation {
                field: "state".to_string(),
                message: format!("a vehicle can not be stopped into {}", new_state),
            }
            .into());
        }

        let mut vehicle = self.load(vehicle_id).await?;
        Self::require(&vehicle, VirtualVehicleState::STATES_FOR_STOP)?;

        vehicle.state = new_state;
        vehicle.state_info = Some(STOPPED_MANUALLY.to_string());
        vehicle.continuation = None;
        vehicle.clear_migration();
        vehicle.task_id = None;
        vehicle.start_time = None;
        vehicle.end_time = None;
        self.save(&mut vehicle).await?;

        info!(vehicle_id, state = %new_state, "Virtual vehicle stopped");
        Ok(())
    }

    /// Resume a paused vehicle from its continuation.
    #[instrument(skip(self))]
    pub async fn resume(&self, vehicle_id: i64) -> Result<()> {
        let vehicle = self.load(vehicle_id).await?;
        Self::require(&vehicle, VirtualVehicleState::STATES_FOR_RESUME)?;
        info!(vehicle_id, state = %vehicle.state, "Resuming virtual vehicle");
        self.dispatch(vehicle_id, true).await
    }

    /// Reset a finished or defective vehicle to INIT and start it again.
    #[instrument(skip(self))]
    pub async fn restart(&self, vehicle_id: i64) -> Result<()> {
        let mut vehicle = self.load(vehicle_id).await?;
        Self::require(&vehicle, VirtualVehicleState::STATES_FOR_RESTART)?;

        vehicle.state = VirtualVehicleState::Init;
        vehicle.state_info = None;
        vehicle.end_time = None;
        vehicle.clear_migration();
        self.save(&mut vehicle).await?;

        self.start(vehicle_id).await
    }

    /// Delete a vehicle and its storage.
    #[instrument(skip(self))]
    pub async fn delete(&self, vehicle_id: i64) -> Result<()> {
        let vehicle = self.load(vehicle_id).await?;
        Self::require(&vehicle, VirtualVehicleState::STATES_FOR_DELETE)?;
        self.persistence.delete_virtual_vehicle(vehicle_id).await?;
        info!(vehicle_id, "Virtual vehicle deleted");
        Ok(())
    }

    /// React to a state reached outside the launcher, e.g. a completed migration.
    pub async fn state_change(&self, vehicle: &VirtualVehicle) -> Result<()> {
        debug!(vehicle_id = vehicle.id, state = %vehicle.state, "Vehicle state changed");
        if vehicle.state == VirtualVehicleState::MigrationCompletedRcv {
            self.dispatch(vehicle.id, true).await?;
        }
        Ok(())
    }

    /// A task finished: detach it from its vehicle and resume the vehicle.
    #[instrument(skip(self, task), fields(task_id = task.id))]
    pub async fn notify_task(&self, task: &Task) -> Result<()> {
        let mut stored = self
            .persistence
            .get_task(task.id)
            .await?
            .ok_or_else(|| CoreError::not_found("task", task.id))?;

        let Some(vehicle_id) = stored.vehicle_id.take() else {
            debug!("Task has no vehicle attached");
            return Ok(());
        };
        self.persistence.update_task(&stored).await?;

        let mut vehicle = self.load(vehicle_id).await?;
        if vehicle.task_id == Some(task.id) {
            vehicle.task_id = None;
            self.save(&mut vehicle).await?;
        }

        self.dispatch(vehicle_id, true).await
    }

    async fn dispatch(&self, vehicle_id: i64, use_continuation: bool) -> Result<()> {
        let data = serde_json::to_vec(&RunRequest { use_continuation })?;
        self.jobs
            .dispatch(VEHICLE_QUEUE, &job_parameters(MODE_RUN, vehicle_id), Some(data))
            .await?;
        Ok(())
    }

    // ========================================================================
    // Script execution
    // ========================================================================

    /// Execute one script slice of a vehicle. Runs as the vehicle's job.
    #[instrument(skip(self))]
    pub async fn run_vehicle(&self, vehicle_id: i64, use_continuation: bool) -> Result<()> {
        let mut vehicle = self.load(vehicle_id).await?;

        let context = WorkerContext {
            vehicle: vehicle.clone(),
            use_continuation,
            mapper: self.mapper.clone(),
        };
        let mut worker = match self.scripts.create_worker(context).await {
            Ok(worker) => worker,
            Err(e) => {
                error!(vehicle_id, error = %e, "Can not (re)start virtual vehicle");
                vehicle.state = VirtualVehicleState::Defective;
                vehicle.state_info = Some(e.to_string());
                self.save(&mut vehicle).await?;
                return Err(e);
            }
        };

        vehicle.state = VirtualVehicleState::Running;
        self.save(&mut vehicle).await?;

        let (state, failure) = match worker.run().await {
            Ok(state) if state.is_in(YIELD_STATES) => (state, None),
            Ok(state) => (
                VirtualVehicleState::Defective,
                Some(format!("Script yielded unexpected state {}", state)),
            ),
            Err(e) => (VirtualVehicleState::Defective, Some(e.to_string())),
        };

        vehicle.state = state;
        vehicle.state_info = worker.result().or(failure);
        info!(vehicle_id, %state, "Virtual vehicle yielded");

        let initiate = match state {
            VirtualVehicleState::TaskCompletionAwaited | VirtualVehicleState::Interrupted => {
                vehicle.continuation = worker.snapshot();
                self.handle_paused(&mut vehicle, state, worker.application_state())
                    .await?
            }
            _ => {
                if state == VirtualVehicleState::Defective {
                    error!(vehicle_id, info = ?vehicle.state_info, "Virtual vehicle crashed");
                }
                self.handle_finished(&mut vehicle).await?
            }
        };

        self.save(&mut vehicle).await?;

        if initiate {
            info!(
                vehicle_id,
                destination = ?vehicle.migration_destination_id,
                "Initiating migration"
            );
            submit_send_job(&self.jobs, vehicle_id).await?;
        }
        Ok(())
    }

    /// Returns true if a migration has to be initiated.
    async fn handle_paused(
        &self,
        vehicle: &mut VirtualVehicle,
        state: VirtualVehicleState,
        application: ApplicationState,
    ) -> Result<bool> {
        if let Some(mut task) = application.task {
            task.state = TaskState::Init;
            task.vehicle_id = Some(vehicle.id);
            let task_id = self.persistence.insert_task(&task).await?;
            vehicle.task_id = Some(task_id);
            info!(vehicle_id = vehicle.id, task_id, "Task queued for local execution");
        }

        let Some(decision) = application.decision else {
            return Ok(false);
        };

        if decision.migrate && !decision.candidates.is_empty() {
            let own = self.persistence.find_own_real_vehicle().await?;
            vehicle.migration_destination_id = Some(decision.candidates[0].id);
            vehicle.migration_source_id = own.map(|rv| rv.id);
            vehicle.pre_migration_state = Some(state);
            vehicle.chunk_number = 0;
            vehicle.state = VirtualVehicleState::MigrationAwaitedSnd;
            vehicle.migration_start_time = Some(self.time.now());
            vehicle.task_id = None;
            return Ok(true);
        }

        warn!(vehicle_id = vehicle.id, "No suitable real vehicle found to migrate to");
        vehicle.state = VirtualVehicleState::MigrationInterruptedSnd;
        vehicle.migration_destination_id = None;
        vehicle.state_info = Some(no_destination_info(&decision));
        Ok(false)
    }

    /// Returns true if a migration to a ground station has to be initiated.
    async fn handle_finished(&self, vehicle: &mut VirtualVehicle) -> Result<bool> {
        vehicle.end_time = Some(self.time.now());

        let Some(own) = self.persistence.find_own_real_vehicle().await? else {
            warn!(vehicle_id = vehicle.id, "Own real vehicle unknown, keeping vehicle");
            return Ok(false);
        };
        if own.is_ground_station() {
            return Ok(false);
        }

        let ground_stations = self.persistence.find_all_ground_stations().await?;
        let Some(destination) = ground_stations.first() else {
            return Ok(false);
        };

        vehicle.migration_destination_id = Some(destination.id);
        vehicle.migration_source_id = Some(own.id);
        vehicle.chunk_number = 0;
        Ok(true)
    }

    // ========================================================================
    // Stuck migrations
    // ========================================================================

    /// Recover vehicles whose migration stalled. Returns how many were handled.
    ///
    /// Only vehicles not updated within `stuck_timeout` are considered.
    pub async fn handle_stuck_migrations(&self, stuck_timeout: chrono::Duration) -> Result<usize> {
        let Some(own) = self.persistence.find_own_real_vehicle().await? else {
            debug!("Own real vehicle unknown, skipping stuck migration sweep");
            return Ok(0);
        };
        let ground_stations = self.persistence.find_all_ground_stations().await?;

        let states = if own.is_ground_station() {
            VirtualVehicleState::STUCK_STATES_FROM_GS
        } else {
            VirtualVehicleState::STUCK_STATES_FROM_RV
        };

        let cutoff = self.time.now() - stuck_timeout;
        let stuck: Vec<VirtualVehicle> = self
            .persistence
            .list_virtual_vehicles_in_states(states)
            .await?
            .into_iter()
            .filter(|vv| vv.update_time.is_none_or(|updated| updated < cutoff))
            .collect();

        debug!(count = stuck.len(), "Handling stuck virtual vehicles");
        let mut handled = 0;
        for vehicle in stuck {
            info!(vehicle_id = vehicle.id, name = %vehicle.name, state = %vehicle.state, "Found stuck virtual vehicle");
            let vehicle_id = vehicle.id;
            match self.handle_stuck(vehicle, &own, &ground_stations).await {
                Ok(true) => handled += 1,
                Ok(false) => {}
                Err(e) => error!(vehicle_id, error = %e, "Recovering stuck vehicle failed"),
            }
        }
        Ok(handled)
    }

    async fn handle_stuck(
        &self,
        mut vehicle: VirtualVehicle,
        own: &RealVehicle,
        ground_stations: &[RealVehicle],
    ) -> Result<bool> {
        use VirtualVehicleState::*;

        match vehicle.state {
            MigratingRcv => {
                warn!(vehicle_id = vehicle.id, "Discarding abandoned incoming migration");
                vehicle.state = Defective;
                self.save(&mut vehicle).await?;
                self.persistence.delete_virtual_vehicle(vehicle.id).await?;
                Ok(true)
            }
            MigratingSnd | MigrationInterruptedSnd | MigrationAwaitedSnd => {
                if vehicle.migration_destination_id.is_none()
                    && !self.assign_ground_station(&mut vehicle, own, ground_stations).await?
                {
                    return Ok(false);
                }
                submit_send_job(&self.jobs, vehicle.id).await?;
                Ok(true)
            }
            MigrationCompletedSnd => {
                self.jobs
                    .add_job_if_not_exists(
                        MIGRATION_QUEUE,
                        &job_parameters(MODE_SEND_ACK, vehicle.id),
                        None,
                    )
                    .await?;
                Ok(true)
            }
            TaskCompletionAwaited => {
                self.dispatch(vehicle.id, true).await?;
                Ok(true)
            }
            _ if vehicle.migration_destination_id.is_none() => {
                if !self.assign_ground_station(&mut vehicle, own, ground_stations).await? {
                    return Ok(false);
                }
                submit_send_job(&self.jobs, vehicle.id).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn assign_ground_station(
        &self,
        vehicle: &mut VirtualVehicle,
        own: &RealVehicle,
        ground_stations: &[RealVehicle],
    ) -> Result<bool> {
        let Some(destination) = ground_stations.first() else {
            return Ok(false);
        };
        if destination.id == own.id {
            return Ok(false);
        }
        vehicle.migration_destination_id = Some(destination.id);
        vehicle.migration_source_id = Some(own.id);
        self.save(vehicle).await?;
        Ok(true)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn require(vehicle: &VirtualVehicle, allowed: &[VirtualVehicleState]) -> Result<()> {
        if vehicle.state.is_in(allowed) {
            return Ok(());
        }
        Err(CoreError::InvalidState {
            entity: "virtual vehicle",
            id: vehicle.id.to_string(),
            expected: VirtualVehicleState::describe(allowed),
            actual: vehicle.state.to_string(),
        }
        .into())
    }

    async fn load(&self, vehicle_id: i64) -> Result<VirtualVehicle> {
        Ok(self
            .persistence
            .get_virtual_vehicle(vehicle_id)
            .await?
            .ok_or_else(|| CoreError::not_found("virtual vehicle", vehicle_id))?)
    }

    async fn save(&self, vehicle: &mut VirtualVehicle) -> Result<()> {
        vehicle.update_time = Some(self.time.now());
        self.persistence.update_virtual_vehicle(vehicle).await?;
        Ok(())
    }
}

/// State info of a vehicle that found no migration destination.
pub fn no_destination_info(decision: &MappingDecision) -> String {
    let mut info = format!(
        "No suitable real vehicle found to migrate to!\n\nMigration: {}",
        decision.migrate
    );
    if let Some(task) = &decision.task {
        info.push_str(&format!(
            "\nTask Position: {{lat: {:.8}, lng: {:.8}, alt: {:.8}}}",
            task.position.latitude, task.position.longitude, task.position.altitude
        ));
    }
    info
}
