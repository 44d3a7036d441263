// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! VVRTE Core - jobs, entities and persistence for the virtual vehicle runtime
//!
//! Virtual vehicles are interruptible script units that run on real vehicles
//! (drones, boats, ground stations) and migrate between them when the task
//! they serve needs a different area or sensor set. This crate holds the parts
//! of the runtime that know nothing about execution policy.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         vvrte-node                               │
//! │      Launcher · Migrator · Mapper · Scheduler · HTTP surface     │
//! └──────────────────────────────────────────────────────────────────┘
//!           │ submits jobs               │ transfers chunks/ACKs
//!           ▼                            ▼
//! ┌──────────────────────────┐   ┌──────────────────────────┐
//! │  jobs::JobService         │   │ communication::          │
//! │  "vehicle" + "migration"  │   │ CommunicationService     │
//! │  bounded, id-exclusive    │   └──────────────────────────┘
//! └──────────────────────────┘
//!           │
//!           ▼
//! ┌──────────────────────────┐
//! │ persistence::Persistence │
//! │   (SQLite via sqlx)      │
//! └──────────────────────────┘
//! ```
//!
//! # Job queues
//!
//! | Queue | Work |
//! |-------|------|
//! | `vehicle` | one script slice of a virtual vehicle (`mode=vv-run`) |
//! | `migration` | sending, receiving and acknowledging chunks |
//!
//! Each queue has a fixed worker pool and refuses a second submission of a
//! job id that is still in flight ([`error::CoreError::AlreadyRunning`]).
//!
//! # Persistence
//!
//! Every status change is committed on its own. Receiving a migration chunk
//! is the exception: [`persistence::Persistence::store_vehicle_with_storage`]
//! applies the vehicle record and its storage entries in one transaction.

/// Payload delivery between real vehicles.
pub mod communication;

/// Environment configuration.
pub mod config;

/// Domain records.
pub mod entities;

/// Error types.
pub mod error;

/// WGS84 conversions, distances and geofences.
pub mod geodesy;

/// Job queues and the job service.
pub mod jobs;

/// Database migrations.
pub mod migrations;

/// Persistence layer.
pub mod persistence;

/// Injectable clock.
pub mod time;

pub use error::{CoreError, Result};
