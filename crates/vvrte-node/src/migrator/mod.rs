// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Chunked transfer of virtual vehicles between real vehicles.
//!
//! ```text
//!  sender                                        receiver
//!  ──────                                        ────────
//!  migration-send job
//!    find_chunk(n) ──── "migration" ──────────►  queue_chunk → migration-receive job
//!                                                  store_chunk: decode, validate, commit
//!  ack_chunk  ◄──────── "migration-ack" ───────    {"uuid", "chunk": n}
//!  migration-continue job
//!    n+1 … until the last chunk, then delete locally
//! ```
//!
//! Every step runs as a job on the migration queue, so a vehicle is never
//! transferred by two workers at once.

pub mod archive;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use vvrte_core::CoreError;
use vvrte_core::communication::{
    CommunicationService, MIGRATION_ACK_CONNECTOR, MIGRATION_CONNECTOR,
};
use vvrte_core::entities::{
    RealVehicle, VirtualVehicle, VirtualVehicleState, VirtualVehicleStorage,
};
use vvrte_core::jobs::{JobService, MIGRATION_QUEUE, job_parameters};
use vvrte_core::persistence::Persistence;
use vvrte_core::time::TimeService;

use crate::error::Result;
use crate::launcher::Launcher;

pub use archive::{ChunkProperties, MigrationChunk, StorageEntry};

/// Job mode transferring the vehicle's current chunk.
pub const MODE_SEND: &str = "migration-send";
/// Job mode re-delivering the final chunk of a completed transfer.
pub const MODE_SEND_ACK: &str = "migration-send-ack";
/// Job mode storing a received chunk.
pub const MODE_RECEIVE: &str = "migration-receive";
/// Job mode handling an acknowledgement.
pub const MODE_CONTINUE: &str = "migration-continue";

/// Default number of storage entries per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 20;

/// Acknowledgement of one stored chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkAck {
    pub uuid: String,
    pub chunk: i32,
}

/// Submit the send job of a vehicle unless one is already pending.
pub(crate) async fn submit_send_job(jobs: &JobService, vehicle_id: i64) -> Result<i64> {
    Ok(jobs
        .add_job_if_not_exists(MIGRATION_QUEUE, &job_parameters(MODE_SEND, vehicle_id), None)
        .await?)
}

/// Moves virtual vehicles to and from other real vehicles.
pub struct Migrator {
    persistence: Arc<dyn Persistence>,
    jobs: Arc<JobService>,
    communication: Arc<dyn CommunicationService>,
    time: Arc<dyn TimeService>,
    launcher: Arc<Launcher>,
    chunk_size: usize,
}

impl Migrator {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        jobs: Arc<JobService>,
        communication: Arc<dyn CommunicationService>,
        time: Arc<dyn TimeService>,
        launcher: Arc<Launcher>,
        chunk_size: usize,
    ) -> Self {
        Self {
            persistence,
            jobs,
            communication,
            time,
            launcher,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Queue the transfer of a vehicle to its migration destination.
    pub async fn initiate_migration(&self, vehicle_id: i64) -> Result<i64> {
        info!(vehicle_id, "Initiating migration");
        submit_send_job(&self.jobs, vehicle_id).await
    }

    /// Accept an incoming chunk for asynchronous storage.
    pub async fn queue_chunk(&self, data: Vec<u8>) -> Result<i64> {
        self.queue_payload("chunk", MODE_RECEIVE, data).await
    }

    /// Accept an incoming acknowledgement for asynchronous handling.
    pub async fn ack_chunk(&self, data: Vec<u8>) -> Result<i64> {
        self.queue_payload("ack", MODE_CONTINUE, data).await
    }

    async fn queue_payload(&self, field: &str, mode: &str, data: Vec<u8>) -> Result<i64> {
        if data.is_empty() {
            return Err(CoreError::Validation {
                field: field.to_string(),
                message: "payload must not be empty".to_string(),
            }
            .into());
        }
        let parameters = format!("mode={}", mode);
        Ok(self.jobs.add_job(MIGRATION_QUEUE, &parameters, Some(data)).await?)
    }

    // ========================================================================
    // Send side
    // ========================================================================

    /// Build chunk `chunk_number` from the storage page following `last_name`.
    ///
    /// The chunk is the last one when the page is shorter than the chunk size.
    /// Code and continuation travel in chunk 0 only.
    pub async fn find_chunk(
        &self,
        vehicle: &VirtualVehicle,
        last_name: &str,
        chunk_number: i32,
    ) -> Result<MigrationChunk> {
        let items = self
            .persistence
            .list_storage_items_after(vehicle.id, last_name, self.chunk_size)
            .await?;
        let last = items.len() < self.chunk_size;
        self.build_chunk(vehicle, items, chunk_number, last).await
    }

    async fn build_chunk(
        &self,
        vehicle: &VirtualVehicle,
        items: Vec<VirtualVehicleStorage>,
        chunk_number: i32,
        last_chunk: bool,
    ) -> Result<MigrationChunk> {
        let source = self.persistence.find_own_real_vehicle().await?.map(|rv| rv.name);
        let first = chunk_number == 0;

        Ok(MigrationChunk {
            properties: ChunkProperties {
                name: vehicle.name.clone(),
                uuid: vehicle.uuid.clone(),
                api_version: vehicle.api_version,
                pre_migration_state: vehicle.pre_migration_state,
                state_info: vehicle.state_info.clone(),
                chunk_number,
                migration_source: source,
                start_time: vehicle.start_time,
                end_time: vehicle.end_time,
                last_chunk,
            },
            code: vehicle.code.clone().filter(|_| first),
            continuation: vehicle.continuation.clone().filter(|_| first),
            storage: items
                .into_iter()
                .map(|item| StorageEntry {
                    name: item.name,
                    modification_time: item.modification_time,
                    content: item.content,
                })
                .collect(),
        })
    }

    /// Transfer the current chunk of a vehicle. Runs as the send job.
    #[instrument(skip(self))]
    pub async fn send(&self, vehicle_id: i64) -> Result<()> {
        let vehicle = self.load(vehicle_id).await?;
        self.send_current_chunk(vehicle).await
    }

    /// Re-deliver the final chunk so the destination acknowledges again.
    #[instrument(skip(self))]
    pub async fn resend_final_chunk(&self, vehicle_id: i64) -> Result<()> {
        let vehicle = self.load(vehicle_id).await?;
        if vehicle.state != VirtualVehicleState::MigrationCompletedSnd {
            warn!(vehicle_id, state = %vehicle.state, "Vehicle is no longer awaiting its final acknowledgement");
            return Ok(());
        }
        self.send_current_chunk(vehicle).await
    }

    async fn send_current_chunk(&self, mut vehicle: VirtualVehicle) -> Result<()> {
        let destination = match vehicle.migration_destination_id {
            Some(id) => self.persistence.get_real_vehicle(id).await?,
            None => None,
        };
        let Some(destination) = destination else {
            let error = CoreError::NoDestination {
                vehicle: vehicle.uuid.clone(),
            };
            warn!(vehicle_id = vehicle.id, "Migration has no destination");
            vehicle.state = VirtualVehicleState::MigrationInterruptedSnd;
            vehicle.state_info = Some(error.to_string());
            self.save(&mut vehicle).await?;
            return Err(error.into());
        };

        // First claim of an episode: the cursor may still hold the chunk
        // number of the transfer that brought the vehicle here.
        if vehicle.pre_migration_state.is_none() {
            vehicle.pre_migration_state = Some(vehicle.state);
            vehicle.chunk_number = 0;
        }
        if vehicle.migration_start_time.is_none() {
            vehicle.migration_start_time = Some(self.time.now());
        }

        let chunk = self.current_chunk(&vehicle).await?;
        vehicle.state = if chunk.properties.last_chunk {
            VirtualVehicleState::MigrationCompletedSnd
        } else {
            VirtualVehicleState::MigratingSnd
        };
        self.save(&mut vehicle).await?;

        let payload = chunk.encode(self.time.now())?;
        info!(
            vehicle_id = vehicle.id,
            destination = %destination.name,
            chunk = vehicle.chunk_number,
            last = chunk.properties.last_chunk,
            bytes = payload.len(),
            "Sending migration chunk"
        );

        let failure = match self
            .communication
            .transfer(&destination, MIGRATION_CONNECTOR, &payload)
            .await
        {
            Ok(response) if response.is_ok() => return Ok(()),
            Ok(response) => response.content_text(),
            Err(e) => e.to_string(),
        };

        warn!(vehicle_id = vehicle.id, destination = %destination.name, error = %failure, "Migration chunk transfer failed");
        vehicle.state = VirtualVehicleState::MigrationInterruptedSnd;
        vehicle.state_info = Some(failure.clone());
        self.save(&mut vehicle).await?;
        Err(CoreError::transfer(failure).into())
    }

    async fn current_chunk(&self, vehicle: &VirtualVehicle) -> Result<MigrationChunk> {
        if vehicle.chunk_number <= 0 {
            return self.find_chunk(vehicle, "", 0).await;
        }
        let offset = vehicle.chunk_number as usize * self.chunk_size - 1;
        match self
            .persistence
            .storage_item_name_at(vehicle.id, offset)
            .await?
        {
            Some(cursor) => self.find_chunk(vehicle, &cursor, vehicle.chunk_number).await,
            None => {
                self.build_chunk(vehicle, Vec::new(), vehicle.chunk_number, true)
                    .await
            }
        }
    }

    /// Handle an acknowledgement. Runs as the continue job.
    #[instrument(skip(self, data))]
    pub async fn continue_migration(&self, data: &[u8]) -> Result<()> {
        let ack: ChunkAck = serde_json::from_slice(data)?;

        let Some(mut vehicle) = self.persistence.find_virtual_vehicle_by_uuid(&ack.uuid).await?
        else {
            warn!(uuid = %ack.uuid, chunk = ack.chunk, "Acknowledgement for unknown vehicle");
            return Ok(());
        };

        if vehicle.chunk_number != ack.chunk {
            warn!(
                vehicle_id = vehicle.id,
                expected = vehicle.chunk_number,
                received = ack.chunk,
                "Ignoring stale acknowledgement"
            );
            return Ok(());
        }

        match vehicle.state {
            VirtualVehicleState::MigrationCompletedSnd => {
                self.persistence.delete_virtual_vehicle(vehicle.id).await?;
                info!(vehicle_id = vehicle.id, uuid = %vehicle.uuid, "Migration confirmed, vehicle removed");
                Ok(())
            }
            VirtualVehicleState::MigratingSnd => {
                vehicle.chunk_number += 1;
                self.send_current_chunk(vehicle).await
            }
            state => {
                warn!(vehicle_id = vehicle.id, %state, "Ignoring acknowledgement in unexpected state");
                Ok(())
            }
        }
    }

    // ========================================================================
    // Receive side
    // ========================================================================

    /// Store a received chunk and acknowledge it. Runs as the receive job.
    ///
    /// The archive is decoded and validated completely before anything is
    /// written; a malformed chunk leaves the local state untouched.
    #[instrument(skip(self, data), fields(bytes = data.len()))]
    pub async fn store_chunk(&self, data: &[u8]) -> Result<()> {
        let chunk = MigrationChunk::decode(data)?;
        let properties = &chunk.properties;

        let source = match &properties.migration_source {
            Some(name) => self.persistence.find_real_vehicle_by_name(name).await?,
            None => None,
        };

        let existing = self
            .persistence
            .find_virtual_vehicle_by_uuid(&properties.uuid)
            .await?;

        let mut vehicle = match existing {
            None if properties.chunk_number > 0 => {
                return Err(CoreError::transfer(format!(
                    "chunk {} of unknown virtual vehicle {}",
                    properties.chunk_number, properties.uuid
                ))
                .into());
            }
            None => self.vehicle_from_chunk(&chunk),
            Some(vehicle) if Self::is_repeated_final_chunk(&vehicle, properties) => {
                info!(vehicle_id = vehicle.id, chunk = properties.chunk_number, "Repeating acknowledgement of final chunk");
                if let Err(error) = self.acknowledge(&vehicle, properties, source.as_ref()).await {
                    warn!(vehicle_id = vehicle.id, error = %error, "Repeating acknowledgement failed");
                }
                return Ok(());
            }
            Some(vehicle) => {
                if !vehicle.state.is_in(VirtualVehicleState::STATES_FOR_MIGRATION_RCV)
                    || vehicle.migration_destination_id.is_some()
                {
                    return Err(CoreError::transfer(format!(
                        "virtual vehicle {} is in state {} and cannot receive chunk {}",
                        vehicle.uuid, vehicle.state, properties.chunk_number
                    ))
                    .into());
                }
                let mut vehicle = vehicle;
                vehicle.state = VirtualVehicleState::MigratingRcv;
                if chunk.code.is_some() {
                    vehicle.code = chunk.code.clone();
                }
                if chunk.continuation.is_some() {
                    vehicle.continuation = chunk.continuation.clone();
                }
                vehicle
            }
        };

        vehicle.chunk_number = properties.chunk_number;
        vehicle.migration_source_id = source.as_ref().map(|rv| rv.id);
        vehicle.update_time = Some(self.time.now());

        let items: Vec<VirtualVehicleStorage> = chunk
            .storage
            .iter()
            .map(|entry| VirtualVehicleStorage {
                id: 0,
                vehicle_id: vehicle.id,
                name: entry.name.clone(),
                modification_time: entry.modification_time,
                content: entry.content.clone(),
            })
            .collect();

        vehicle.id = self
            .persistence
            .store_vehicle_with_storage(&vehicle, &items)
            .await?;
        info!(
            vehicle_id = vehicle.id,
            uuid = %vehicle.uuid,
            chunk = properties.chunk_number,
            entries = items.len(),
            "Migration chunk stored"
        );

        if let Err(error) = self.acknowledge(&vehicle, properties, source.as_ref()).await {
            warn!(vehicle_id = vehicle.id, error = %error, "Acknowledging migration chunk failed");
            vehicle.state = VirtualVehicleState::MigrationInterruptedRcv;
            vehicle.state_info = Some(error.to_string());
            self.save(&mut vehicle).await?;
            return Ok(());
        }

        if !properties.last_chunk {
            return Ok(());
        }

        vehicle.state = match vehicle.pre_migration_state {
            Some(state) if state.is_in(VirtualVehicleState::NO_CHANGE_AFTER_MIGRATION) => state,
            _ => VirtualVehicleState::MigrationCompletedRcv,
        };
        vehicle.pre_migration_state = None;
        self.save(&mut vehicle).await?;
        info!(vehicle_id = vehicle.id, state = %vehicle.state, "Migration received completely");

        self.launcher.state_change(&vehicle).await
    }

    fn vehicle_from_chunk(&self, chunk: &MigrationChunk) -> VirtualVehicle {
        let properties = &chunk.properties;
        let mut vehicle = VirtualVehicle::new(
            properties.name.clone(),
            properties.api_version,
            String::new(),
        );
        vehicle.uuid = properties.uuid.clone();
        vehicle.code = chunk.code.clone();
        vehicle.continuation = chunk.continuation.clone();
        vehicle.state = VirtualVehicleState::MigratingRcv;
        vehicle.pre_migration_state = properties.pre_migration_state;
        vehicle.state_info = properties.state_info.clone();
        vehicle.start_time = properties.start_time;
        vehicle.end_time = properties.end_time;
        vehicle.migration_start_time = Some(self.time.now());
        vehicle
    }

    fn is_repeated_final_chunk(vehicle: &VirtualVehicle, properties: &ChunkProperties) -> bool {
        properties.last_chunk
            && vehicle.chunk_number == properties.chunk_number
            && !vehicle.state.is_in(VirtualVehicleState::STATES_FOR_MIGRATION_RCV)
            && vehicle.migration_destination_id.is_none()
    }

    async fn acknowledge(
        &self,
        vehicle: &VirtualVehicle,
        properties: &ChunkProperties,
        source: Option<&RealVehicle>,
    ) -> std::result::Result<(), CoreError> {
        let ack_failure = |reason: String| CoreError::AckFailure {
            vehicle: vehicle.uuid.clone(),
            reason,
        };

        let source = source.ok_or_else(|| {
            ack_failure(format!(
                "unknown migration source '{}'",
                properties.migration_source.as_deref().unwrap_or_default()
            ))
        })?;

        let ack = serde_json::to_vec(&ChunkAck {
            uuid: vehicle.uuid.clone(),
            chunk: properties.chunk_number,
        })?;

        match self
            .communication
            .transfer(source, MIGRATION_ACK_CONNECTOR, &ack)
            .await
        {
            Ok(response) if response.is_ok() => Ok(()),
            Ok(response) => Err(ack_failure(response.content_text())),
            Err(e) => Err(ack_failure(e.to_string())),
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

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
