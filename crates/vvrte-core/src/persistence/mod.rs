// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for vvrte-core.
//!
//! Every method is its own commit. The lifecycle code calls them after each
//! discrete transition rather than batching, so a crash leaves an auditable
//! record of the last completed step. The only multi-row transaction is
//! [`Persistence::store_vehicle_with_storage`], used to apply a received
//! migration chunk all-or-nothing.

pub mod sqlite;

pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::entities::{
    Job, JobStatus, OWN_REAL_VEHICLE_PARAMETER, RealVehicle, Task, TaskState, VirtualVehicle,
    VirtualVehicleState, VirtualVehicleStorage,
};
use crate::error::CoreError;

/// Storage backend for jobs, vehicles, tasks and parameters.
#[async_trait]
pub trait Persistence: Send + Sync {
    // ========================================================================
    // Jobs
    // ========================================================================

    /// Create a job in status QUEUED and return its id.
    async fn insert_job(
        &self,
        queue_name: &str,
        parameters: &str,
        data: Option<&[u8]>,
        created: DateTime<Utc>,
    ) -> Result<i64, CoreError>;

    /// Load a job by id.
    async fn get_job(&self, id: i64) -> Result<Option<Job>, CoreError>;

    /// Write back status, timestamps and payload of a job.
    async fn update_job(&self, job: &Job) -> Result<(), CoreError>;

    /// The most recent job with exactly these queue and parameters.
    async fn find_latest_job(
        &self,
        queue_name: &str,
        parameters: &str,
    ) -> Result<Option<Job>, CoreError>;

    /// A QUEUED or RUNNING job with exactly these queue and parameters.
    async fn find_active_job(
        &self,
        queue_name: &str,
        parameters: &str,
    ) -> Result<Option<Job>, CoreError>;

    /// All jobs of a queue in the given status, oldest first.
    async fn list_jobs(&self, queue_name: &str, status: JobStatus) -> Result<Vec<Job>, CoreError>;

    /// Delete OK/FAILED jobs that ended before `cutoff`. Returns the number removed.
    async fn delete_terminated_jobs(&self, cutoff: DateTime<Utc>) -> Result<u64, CoreError>;

    // ========================================================================
    // Parameters
    // ========================================================================

    /// Read a parameter.
    async fn get_parameter(&self, name: &str) -> Result<Option<String>, CoreError>;

    /// Create or overwrite a parameter.
    async fn set_parameter(&self, name: &str, value: &str) -> Result<(), CoreError>;

    // ========================================================================
    // Real vehicles
    // ========================================================================

    /// Insert a real vehicle and return its id.
    async fn insert_real_vehicle(&self, vehicle: &RealVehicle) -> Result<i64, CoreError>;

    /// Write back a real vehicle.
    async fn update_real_vehicle(&self, vehicle: &RealVehicle) -> Result<(), CoreError>;

    /// Load a real vehicle by id, deleted or not.
    async fn get_real_vehicle(&self, id: i64) -> Result<Option<RealVehicle>, CoreError>;

    /// Load a real vehicle by name, deleted or not.
    async fn find_real_vehicle_by_name(&self, name: &str)
    -> Result<Option<RealVehicle>, CoreError>;

    /// All real vehicles not marked deleted, in id order.
    async fn list_real_vehicles(&self) -> Result<Vec<RealVehicle>, CoreError>;

    /// The real vehicle named by the `realVehicleName` parameter.
    async fn find_own_real_vehicle(&self) -> Result<Option<RealVehicle>, CoreError> {
        match self.get_parameter(OWN_REAL_VEHICLE_PARAMETER).await? {
            Some(name) => self.find_real_vehicle_by_name(&name).await,
            None => Ok(None),
        }
    }

    /// All active ground stations, in id order.
    async fn find_all_ground_stations(&self) -> Result<Vec<RealVehicle>, CoreError> {
        Ok(self
            .list_real_vehicles()
            .await?
            .into_iter()
            .filter(RealVehicle::is_ground_station)
            .collect())
    }

    /// All active real vehicles except the one with id `own_id`.
    async fn find_all_active_real_vehicles_except(
        &self,
        own_id: i64,
    ) -> Result<Vec<RealVehicle>, CoreError> {
        Ok(self
            .list_real_vehicles()
            .await?
            .into_iter()
            .filter(|rv| rv.id != own_id)
            .collect())
    }

    // ========================================================================
    // Virtual vehicles
    // ========================================================================

    /// Insert a virtual vehicle and return its id.
    async fn insert_virtual_vehicle(&self, vehicle: &VirtualVehicle) -> Result<i64, CoreError>;

    /// Write back every column of a virtual vehicle.
    async fn update_virtual_vehicle(&self, vehicle: &VirtualVehicle) -> Result<(), CoreError>;

    /// Load a virtual vehicle by id.
    async fn get_virtual_vehicle(&self, id: i64) -> Result<Option<VirtualVehicle>, CoreError>;

    /// Load a virtual vehicle by UUID.
    async fn find_virtual_vehicle_by_uuid(
        &self,
        uuid: &str,
    ) -> Result<Option<VirtualVehicle>, CoreError>;

    /// All virtual vehicles, in id order.
    async fn list_virtual_vehicles(&self) -> Result<Vec<VirtualVehicle>, CoreError>;

    /// All virtual vehicles whose state is in `states`, in id order.
    async fn list_virtual_vehicles_in_states(
        &self,
        states: &[VirtualVehicleState],
    ) -> Result<Vec<VirtualVehicle>, CoreError>;

    /// Delete a virtual vehicle together with its storage.
    async fn delete_virtual_vehicle(&self, id: i64) -> Result<(), CoreError>;

    /// Insert (id 0) or update a vehicle and upsert storage items in one transaction.
    ///
    /// The `vehicle_id` of each item is replaced by the vehicle's id.
    /// Returns the vehicle id.
    async fn store_vehicle_with_storage(
        &self,
        vehicle: &VirtualVehicle,
        items: &[VirtualVehicleStorage],
    ) -> Result<i64, CoreError>;

    // ========================================================================
    // Virtual vehicle storage
    // ========================================================================

    /// Up to `limit` storage items named after `after_name`, ordered by name.
    async fn list_storage_items_after(
        &self,
        vehicle_id: i64,
        after_name: &str,
        limit: usize,
    ) -> Result<Vec<VirtualVehicleStorage>, CoreError>;

    /// Name of the storage item at position `offset` in name order.
    async fn storage_item_name_at(
        &self,
        vehicle_id: i64,
        offset: usize,
    ) -> Result<Option<String>, CoreError>;

    /// Load one storage item.
    async fn get_storage_item(
        &self,
        vehicle_id: i64,
        name: &str,
    ) -> Result<Option<VirtualVehicleStorage>, CoreError>;

    /// Create or overwrite a storage item keyed by vehicle and name.
    async fn save_storage_item(&self, item: &VirtualVehicleStorage) -> Result<(), CoreError>;

    /// Number of storage items of a vehicle.
    async fn count_storage_items(&self, vehicle_id: i64) -> Result<i64, CoreError>;

    // ========================================================================
    // Tasks
    // ========================================================================

    /// Insert a task and return its id.
    async fn insert_task(&self, task: &Task) -> Result<i64, CoreError>;

    /// Write back a task.
    async fn update_task(&self, task: &Task) -> Result<(), CoreError>;

    /// Load a task by id.
    async fn get_task(&self, id: i64) -> Result<Option<Task>, CoreError>;

    /// The task currently executed, if any.
    async fn find_running_task(&self) -> Result<Option<Task>, CoreError>;

    /// Tasks in a state, ordered by rank, then creation time, then id.
    async fn list_tasks_in_state(&self, state: TaskState) -> Result<Vec<Task>, CoreError>;

    /// Write back several tasks in one transaction.
    async fn update_tasks(&self, tasks: &[Task]) -> Result<(), CoreError>;

    // ========================================================================
    // Health
    // ========================================================================

    /// Check that the database answers.
    async fn health_check_db(&self) -> Result<bool, CoreError>;
}
