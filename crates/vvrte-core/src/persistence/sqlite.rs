// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{SqliteConnection, SqlitePool};

use crate::entities::{
    Job, JobStatus, RealVehicle, SensorDefinition, Task, TaskState, VirtualVehicle,
    VirtualVehicleState, VirtualVehicleStorage,
};
use crate::error::CoreError;
use crate::geodesy::PolarCoordinate;

use super::Persistence;

use crate::migrations::SQLITE as MIGRATOR;

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file when missing, then
    /// runs all migrations.
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/vvrte.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::Database {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| CoreError::Database {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        MIGRATOR.run(&pool).await.map_err(|e| CoreError::Database {
            operation: "migrate".to_string(),
            details: format!("Failed to run migrations: {}", e),
        })?;

        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

// ============================================================================
// Row types
// ============================================================================

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: i64,
    queue_name: String,
    status: String,
    created: DateTime<Utc>,
    queued: Option<DateTime<Utc>>,
    started: Option<DateTime<Utc>>,
    ended: Option<DateTime<Utc>>,
    parameters: String,
    data: Option<Vec<u8>>,
}

impl TryFrom<JobRow> for Job {
    type Error = CoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: row.id,
            queue_name: row.queue_name,
            status: row.status.parse()?,
            created: row.created,
            queued: row.queued,
            started: row.started,
            ended: row.ended,
            parameters: row.parameters,
            data: row.data,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RealVehicleRow {
    id: i64,
    name: String,
    url: String,
    vehicle_type: String,
    area_of_operation: Option<String>,
    sensors: String,
    last_update: Option<DateTime<Utc>>,
    deleted: bool,
}

impl TryFrom<RealVehicleRow> for RealVehicle {
    type Error = CoreError;

    fn try_from(row: RealVehicleRow) -> Result<Self, Self::Error> {
        Ok(RealVehicle {
            id: row.id,
            name: row.name,
            url: row.url,
            vehicle_type: row.vehicle_type.parse()?,
            area_of_operation: row.area_of_operation,
            sensors: serde_json::from_str(&row.sensors)?,
            last_update: row.last_update,
            deleted: row.deleted,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct VirtualVehicleRow {
    id: i64,
    uuid: String,
    name: String,
    api_version: i32,
    code: Option<String>,
    continuation: Option<Vec<u8>>,
    state: String,
    pre_migration_state: Option<String>,
    state_info: Option<String>,
    task_id: Option<i64>,
    migration_source_id: Option<i64>,
    migration_destination_id: Option<i64>,
    migration_start_time: Option<DateTime<Utc>>,
    chunk_number: i32,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    update_time: Option<DateTime<Utc>>,
}

impl TryFrom<VirtualVehicleRow> for VirtualVehicle {
    type Error = CoreError;

    fn try_from(row: VirtualVehicleRow) -> Result<Self, Self::Error> {
        Ok(VirtualVehicle {
            id: row.id,
            uuid: row.uuid,
            name: row.name,
            api_version: row.api_version,
            code: row.code,
            continuation: row.continuation,
            state: row.state.parse()?,
            pre_migration_state: row
                .pre_migration_state
                .as_deref()
                .map(str::parse)
                .transpose()?,
            state_info: row.state_info,
            task_id: row.task_id,
            migration_source_id: row.migration_source_id,
            migration_destination_id: row.migration_destination_id,
            migration_start_time: row.migration_start_time,
            chunk_number: row.chunk_number,
            start_time: row.start_time,
            end_time: row.end_time,
            update_time: row.update_time,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct StorageRow {
    id: i64,
    vehicle_id: i64,
    name: String,
    modification_time: DateTime<Utc>,
    content: Vec<u8>,
}

impl From<StorageRow> for VirtualVehicleStorage {
    fn from(row: StorageRow) -> Self {
        VirtualVehicleStorage {
            id: row.id,
            vehicle_id: row.vehicle_id,
            name: row.name,
            modification_time: row.modification_time,
            content: row.content,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TaskRow {
    id: i64,
    latitude: f64,
    longitude: f64,
    altitude: f64,
    state: String,
    task_order: i32,
    tolerance: f64,
    distance_to_target: f64,
    creation_time: DateTime<Utc>,
    execution_start: Option<DateTime<Utc>>,
    execution_end: Option<DateTime<Utc>>,
    sensor_values: Option<Vec<u8>>,
    sensors: String,
    vehicle_id: Option<i64>,
}

impl TryFrom<TaskRow> for Task {
    type Error = CoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(Task {
            id: row.id,
            position: PolarCoordinate::new(row.latitude, row.longitude, row.altitude),
            state: row.state.parse()?,
            order: row.task_order,
            tolerance: row.tolerance,
            distance_to_target: row.distance_to_target,
            creation_time: row.creation_time,
            execution_start: row.execution_start,
            execution_end: row.execution_end,
            sensor_values: row.sensor_values,
            sensors: serde_json::from_str(&row.sensors)?,
            vehicle_id: row.vehicle_id,
        })
    }
}

const JOB_COLUMNS: &str =
    "id, queue_name, status, created, queued, started, ended, parameters, data";

const REAL_VEHICLE_COLUMNS: &str =
    "id, name, url, vehicle_type, area_of_operation, sensors, last_update, deleted";

const VIRTUAL_VEHICLE_COLUMNS: &str = "id, uuid, name, api_version, code, continuation, state, \
     pre_migration_state, state_info, task_id, migration_source_id, migration_destination_id, \
     migration_start_time, chunk_number, start_time, end_time, update_time";

const TASK_COLUMNS: &str = "id, latitude, longitude, altitude, state, task_order, tolerance, \
     distance_to_target, creation_time, execution_start, execution_end, sensor_values, sensors, \
     vehicle_id";

fn sensors_json(sensors: &[SensorDefinition]) -> Result<String, CoreError> {
    Ok(serde_json::to_string(sensors)?)
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

// ============================================================================
// Connection-level writers, shared by pool and transaction callers
// ============================================================================

async fn write_virtual_vehicle(
    conn: &mut SqliteConnection,
    vehicle: &VirtualVehicle,
) -> Result<i64, CoreError> {
    let pre_state = vehicle.pre_migration_state.map(|s| s.as_str());

    if vehicle.id == 0 {
        let result = sqlx::query(
            r#"
            INSERT INTO virtual_vehicles (
                uuid, name, api_version, code, continuation, state, pre_migration_state,
                state_info, task_id, migration_source_id, migration_destination_id,
                migration_start_time, chunk_number, start_time, end_time, update_time
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&vehicle.uuid)
        .bind(&vehicle.name)
        .bind(vehicle.api_version)
        .bind(&vehicle.code)
        .bind(&vehicle.continuation)
        .bind(vehicle.state.as_str())
        .bind(pre_state)
        .bind(&vehicle.state_info)
        .bind(vehicle.task_id)
        .bind(vehicle.migration_source_id)
        .bind(vehicle.migration_destination_id)
        .bind(vehicle.migration_start_time)
        .bind(vehicle.chunk_number)
        .bind(vehicle.start_time)
        .bind(vehicle.end_time)
        .bind(vehicle.update_time)
        .execute(&mut *conn)
        .await?;

        return Ok(result.last_insert_rowid());
    }

    let result = sqlx::query(
        r#"
        UPDATE virtual_vehicles
        SET uuid = ?, name = ?, api_version = ?, code = ?, continuation = ?, state = ?,
            pre_migration_state = ?, state_info = ?, task_id = ?, migration_source_id = ?,
            migration_destination_id = ?, migration_start_time = ?, chunk_number = ?,
            start_time = ?, end_time = ?, update_time = ?
        WHERE id = ?
        "#,
    )
    .bind(&vehicle.uuid)
    .bind(&vehicle.name)
    .bind(vehicle.api_version)
    .bind(&vehicle.code)
    .bind(&vehicle.continuation)
    .bind(vehicle.state.as_str())
    .bind(pre_state)
    .bind(&vehicle.state_info)
    .bind(vehicle.task_id)
    .bind(vehicle.migration_source_id)
    .bind(vehicle.migration_destination_id)
    .bind(vehicle.migration_start_time)
    .bind(vehicle.chunk_number)
    .bind(vehicle.start_time)
    .bind(vehicle.end_time)
    .bind(vehicle.update_time)
    .bind(vehicle.id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(CoreError::not_found("virtual vehicle", vehicle.id));
    }

    Ok(vehicle.id)
}

async fn upsert_storage_item(
    conn: &mut SqliteConnection,
    vehicle_id: i64,
    item: &VirtualVehicleStorage,
) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO virtual_vehicle_storage (vehicle_id, name, modification_time, content)
        VALUES (?, ?, ?, ?)
        ON CONFLICT (vehicle_id, name)
        DO UPDATE SET modification_time = excluded.modification_time, content = excluded.content
        "#,
    )
    .bind(vehicle_id)
    .bind(&item.name)
    .bind(item.modification_time)
    .bind(&item.content)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn write_task(conn: &mut SqliteConnection, task: &Task) -> Result<(), CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE tasks
        SET latitude = ?, longitude = ?, altitude = ?, state = ?, task_order = ?,
            tolerance = ?, distance_to_target = ?, creation_time = ?, execution_start = ?,
            execution_end = ?, sensor_values = ?, sensors = ?, vehicle_id = ?
        WHERE id = ?
        "#,
    )
    .bind(task.position.latitude)
    .bind(task.position.longitude)
    .bind(task.position.altitude)
    .bind(task.state.as_str())
    .bind(task.order)
    .bind(task.tolerance)
    .bind(task.distance_to_target)
    .bind(task.creation_time)
    .bind(task.execution_start)
    .bind(task.execution_end)
    .bind(&task.sensor_values)
    .bind(sensors_json(&task.sensors)?)
    .bind(task.vehicle_id)
    .bind(task.id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(CoreError::not_found("task", task.id));
    }

    Ok(())
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    // ========================================================================
    // Jobs
    // ========================================================================

    async fn insert_job(
        &self,
        queue_name: &str,
        parameters: &str,
        data: Option<&[u8]>,
        created: DateTime<Utc>,
    ) -> Result<i64, CoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (queue_name, status, created, parameters, data)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(queue_name)
        .bind(JobStatus::Queued.as_str())
        .bind(created)
        .bind(parameters)
        .bind(data)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn get_job(&self, id: i64) -> Result<Option<Job>, CoreError> {
        let sql = format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS);
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Job::try_from).transpose()
    }

    async fn update_job(&self, job: &Job) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?, queued = ?, started = ?, ended = ?, data = ?
            WHERE id = ?
            "#,
        )
        .bind(job.status.as_str())
        .bind(job.queued)
        .bind(job.started)
        .bind(job.ended)
        .bind(&job.data)
        .bind(job.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("job", job.id));
        }

        Ok(())
    }

    async fn find_latest_job(
        &self,
        queue_name: &str,
        parameters: &str,
    ) -> Result<Option<Job>, CoreError> {
        let sql = format!(
            "SELECT {} FROM jobs WHERE queue_name = ? AND parameters = ? ORDER BY id DESC LIMIT 1",
            JOB_COLUMNS
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(queue_name)
            .bind(parameters)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Job::try_from).transpose()
    }

    async fn find_active_job(
        &self,
        queue_name: &str,
        parameters: &str,
    ) -> Result<Option<Job>, CoreError> {
        let sql = format!(
            "SELECT {} FROM jobs WHERE queue_name = ? AND parameters = ? AND status IN (?, ?) \
             ORDER BY id DESC LIMIT 1",
            JOB_COLUMNS
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(queue_name)
            .bind(parameters)
            .bind(JobStatus::Queued.as_str())
            .bind(JobStatus::Running.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Job::try_from).transpose()
    }

    async fn list_jobs(&self, queue_name: &str, status: JobStatus) -> Result<Vec<Job>, CoreError> {
        let sql = format!(
            "SELECT {} FROM jobs WHERE queue_name = ? AND status = ? ORDER BY id ASC",
            JOB_COLUMNS
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(queue_name)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn delete_terminated_jobs(&self, cutoff: DateTime<Utc>) -> Result<u64, CoreError> {
        let ended: Vec<(i64, Option<DateTime<Utc>>)> =
            sqlx::query_as("SELECT id, ended FROM jobs WHERE status IN (?, ?)")
                .bind(JobStatus::Ok.as_str())
                .bind(JobStatus::Failed.as_str())
                .fetch_all(&self.pool)
                .await?;

        let expired: Vec<i64> = ended
            .into_iter()
            .filter(|(_, ended)| ended.is_some_and(|t| t < cutoff))
            .map(|(id, _)| id)
            .collect();

        if expired.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for id in expired {
            removed += sqlx::query("DELETE FROM jobs WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;

        Ok(removed)
    }

    // ========================================================================
    // Parameters
    // ========================================================================

    async fn get_parameter(&self, name: &str) -> Result<Option<String>, CoreError> {
        let value: Option<(Option<String>,)> =
            sqlx::query_as("SELECT value FROM parameters WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;

        Ok(value.and_then(|(v,)| v))
    }

    async fn set_parameter(&self, name: &str, value: &str) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO parameters (name, value) VALUES (?, ?)
            ON CONFLICT (name) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ========================================================================
    // Real vehicles
    // ========================================================================

    async fn insert_real_vehicle(&self, vehicle: &RealVehicle) -> Result<i64, CoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO real_vehicles
                (name, url, vehicle_type, area_of_operation, sensors, last_update, deleted)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&vehicle.name)
        .bind(&vehicle.url)
        .bind(vehicle.vehicle_type.as_str())
        .bind(&vehicle.area_of_operation)
        .bind(sensors_json(&vehicle.sensors)?)
        .bind(vehicle.last_update)
        .bind(vehicle.deleted)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn update_real_vehicle(&self, vehicle: &RealVehicle) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE real_vehicles
            SET name = ?, url = ?, vehicle_type = ?, area_of_operation = ?, sensors = ?,
                last_update = ?, deleted = ?
            WHERE id = ?
            "#,
        )
        .bind(&vehicle.name)
        .bind(&vehicle.url)
        .bind(vehicle.vehicle_type.as_str())
        .bind(&vehicle.area_of_operation)
        .bind(sensors_json(&vehicle.sensors)?)
        .bind(vehicle.last_update)
        .bind(vehicle.deleted)
        .bind(vehicle.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("real vehicle", vehicle.id));
        }

        Ok(())
    }

    async fn get_real_vehicle(&self, id: i64) -> Result<Option<RealVehicle>, CoreError> {
        let sql = format!("SELECT {} FROM real_vehicles WHERE id = ?", REAL_VEHICLE_COLUMNS);
        let row = sqlx::query_as::<_, RealVehicleRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(RealVehicle::try_from).transpose()
    }

    async fn find_real_vehicle_by_name(
        &self,
        name: &str,
    ) -> Result<Option<RealVehicle>, CoreError> {
        let sql = format!(
            "SELECT {} FROM real_vehicles WHERE name = ?",
            REAL_VEHICLE_COLUMNS
        );
        let row = sqlx::query_as::<_, RealVehicleRow>(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        row.map(RealVehicle::try_from).transpose()
    }

    async fn list_real_vehicles(&self) -> Result<Vec<RealVehicle>, CoreError> {
        let sql = format!(
            "SELECT {} FROM real_vehicles WHERE deleted = 0 ORDER BY id ASC",
            REAL_VEHICLE_COLUMNS
        );
        let rows = sqlx::query_as::<_, RealVehicleRow>(&sql)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(RealVehicle::try_from).collect()
    }

    // ========================================================================
    // Virtual vehicles
    // ========================================================================

    async fn insert_virtual_vehicle(&self, vehicle: &VirtualVehicle) -> Result<i64, CoreError> {
        let mut fresh = vehicle.clone();
        fresh.id = 0;
        let mut conn = self.pool.acquire().await?;
        write_virtual_vehicle(&mut conn, &fresh).await
    }

    async fn update_virtual_vehicle(&self, vehicle: &VirtualVehicle) -> Result<(), CoreError> {
        if vehicle.id == 0 {
            return Err(CoreError::not_found("virtual vehicle", vehicle.id));
        }
        let mut conn = self.pool.acquire().await?;
        write_virtual_vehicle(&mut conn, vehicle).await?;
        Ok(())
    }

    async fn get_virtual_vehicle(&self, id: i64) -> Result<Option<VirtualVehicle>, CoreError> {
        let sql = format!(
            "SELECT {} FROM virtual_vehicles WHERE id = ?",
            VIRTUAL_VEHICLE_COLUMNS
        );
        let row = sqlx::query_as::<_, VirtualVehicleRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(VirtualVehicle::try_from).transpose()
    }

    async fn find_virtual_vehicle_by_uuid(
        &self,
        uuid: &str,
    ) -> Result<Option<VirtualVehicle>, CoreError> {
        let sql = format!(
            "SELECT {} FROM virtual_vehicles WHERE uuid = ?",
            VIRTUAL_VEHICLE_COLUMNS
        );
        let row = sqlx::query_as::<_, VirtualVehicleRow>(&sql)
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await?;

        row.map(VirtualVehicle::try_from).transpose()
    }

    async fn list_virtual_vehicles(&self) -> Result<Vec<VirtualVehicle>, CoreError> {
        let sql = format!(
            "SELECT {} FROM virtual_vehicles ORDER BY id ASC",
            VIRTUAL_VEHICLE_COLUMNS
        );
        let rows = sqlx::query_as::<_, VirtualVehicleRow>(&sql)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(VirtualVehicle::try_from).collect()
    }

    async fn list_virtual_vehicles_in_states(
        &self,
        states: &[VirtualVehicleState],
    ) -> Result<Vec<VirtualVehicle>, CoreError> {
        if states.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT {} FROM virtual_vehicles WHERE state IN ({}) ORDER BY id ASC",
            VIRTUAL_VEHICLE_COLUMNS,
            placeholders(states.len())
        );
        let mut query = sqlx::query_as::<_, VirtualVehicleRow>(&sql);
        for state in states {
            query = query.bind(state.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;

        rows.into_iter().map(VirtualVehicle::try_from).collect()
    }

    async fn delete_virtual_vehicle(&self, id: i64) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM virtual_vehicle_storage WHERE vehicle_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM virtual_vehicles WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("virtual vehicle", id));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn store_vehicle_with_storage(
        &self,
        vehicle: &VirtualVehicle,
        items: &[VirtualVehicleStorage],
    ) -> Result<i64, CoreError> {
        let mut tx = self.pool.begin().await?;

        let vehicle_id = write_virtual_vehicle(&mut tx, vehicle).await?;
        for item in items {
            upsert_storage_item(&mut tx, vehicle_id, item).await?;
        }

        tx.commit().await?;
        Ok(vehicle_id)
    }

    // ========================================================================
    // Virtual vehicle storage
    // ========================================================================

    async fn list_storage_items_after(
        &self,
        vehicle_id: i64,
        after_name: &str,
        limit: usize,
    ) -> Result<Vec<VirtualVehicleStorage>, CoreError> {
        let rows = sqlx::query_as::<_, StorageRow>(
            r#"
            SELECT id, vehicle_id, name, modification_time, content
            FROM virtual_vehicle_storage
            WHERE vehicle_id = ? AND name > ?
            ORDER BY name ASC
            LIMIT ?
            "#,
        )
        .bind(vehicle_id)
        .bind(after_name)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(VirtualVehicleStorage::from).collect())
    }

    async fn storage_item_name_at(
        &self,
        vehicle_id: i64,
        offset: usize,
    ) -> Result<Option<String>, CoreError> {
        let name: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT name FROM virtual_vehicle_storage
            WHERE vehicle_id = ?
            ORDER BY name ASC
            LIMIT 1 OFFSET ?
            "#,
        )
        .bind(vehicle_id)
        .bind(offset as i64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(name.map(|(n,)| n))
    }

    async fn get_storage_item(
        &self,
        vehicle_id: i64,
        name: &str,
    ) -> Result<Option<VirtualVehicleStorage>, CoreError> {
        let row = sqlx::query_as::<_, StorageRow>(
            r#"
            SELECT id, vehicle_id, name, modification_time, content
            FROM virtual_vehicle_storage
            WHERE vehicle_id = ? AND name = ?
            "#,
        )
        .bind(vehicle_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(VirtualVehicleStorage::from))
    }

    async fn save_storage_item(&self, item: &VirtualVehicleStorage) -> Result<(), CoreError> {
        let mut conn = self.pool.acquire().await?;
        upsert_storage_item(&mut conn, item.vehicle_id, item).await
    }

    async fn count_storage_items(&self, vehicle_id: i64) -> Result<i64, CoreError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM virtual_vehicle_storage WHERE vehicle_id = ?")
                .bind(vehicle_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

    // ========================================================================
    // Tasks
    // ========================================================================

    async fn insert_task(&self, task: &Task) -> Result<i64, CoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO tasks (
                latitude, longitude, altitude, state, task_order, tolerance, distance_to_target,
                creation_time, execution_start, execution_end, sensor_values, sensors, vehicle_id
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(task.position.latitude)
        .bind(task.position.longitude)
        .bind(task.position.altitude)
        .bind(task.state.as_str())
        .bind(task.order)
        .bind(task.tolerance)
        .bind(task.distance_to_target)
        .bind(task.creation_time)
        .bind(task.execution_start)
        .bind(task.execution_end)
        .bind(&task.sensor_values)
        .bind(sensors_json(&task.sensors)?)
        .bind(task.vehicle_id)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn update_task(&self, task: &Task) -> Result<(), CoreError> {
        let mut conn = self.pool.acquire().await?;
        write_task(&mut conn, task).await
    }

    async fn get_task(&self, id: i64) -> Result<Option<Task>, CoreError> {
        let sql = format!("SELECT {} FROM tasks WHERE id = ?", TASK_COLUMNS);
        let row = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Task::try_from).transpose()
    }

    async fn find_running_task(&self) -> Result<Option<Task>, CoreError> {
        let sql = format!(
            "SELECT {} FROM tasks WHERE state = ? ORDER BY task_order ASC, id ASC LIMIT 1",
            TASK_COLUMNS
        );
        let row = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(TaskState::Running.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Task::try_from).transpose()
    }

    async fn list_tasks_in_state(&self, state: TaskState) -> Result<Vec<Task>, CoreError> {
        let sql = format!(
            "SELECT {} FROM tasks WHERE state = ? \
             ORDER BY task_order ASC, creation_time ASC, id ASC",
            TASK_COLUMNS
        );
        let rows = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Task::try_from).collect()
    }

    async fn update_tasks(&self, tasks: &[Task]) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;
        for task in tasks {
            write_task(&mut tx, task).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // ========================================================================
    // Health
    // ========================================================================

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        let (one,): (i64,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(one == 1)
    }
}
