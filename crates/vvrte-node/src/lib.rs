// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! VVRTE Node - execution policy of one real vehicle
//!
//! Where [`vvrte_core`] provides queues, records and persistence, this crate
//! decides what happens to virtual vehicles on this real vehicle:
//!
//! ```text
//!             ┌────────────┐ yield  ┌──────────┐ decide ┌──────────┐
//!  start ───► │  Launcher  │ ◄───── │  Script  │ ─────► │  Mapper  │
//!             └────────────┘        │ runtime  │        └──────────┘
//!                   │ migrate       └──────────┘
//!                   ▼
//!             ┌────────────┐  chunks / ACKs   ┌──────────────────────┐
//!             │  Migrator  │ ◄──────────────► │ other real vehicles  │
//!             └────────────┘                  └──────────────────────┘
//! ```
//!
//! - [`launcher`]: lifecycle requests and script yields.
//! - [`migrator`]: the chunked transfer protocol.
//! - [`mapper`]: local execution or migration for a task.
//! - [`scheduler`]: ordering of the tasks this real vehicle executes.
//! - [`stuck_migration_monitor`]: periodic recovery.
//! - [`runtime`]: everything wired together.

pub mod error;
#[cfg(feature = "http")]
pub mod http;
pub mod job_factories;
pub mod launcher;
pub mod mapper;
pub mod migrator;
pub mod runtime;
pub mod scheduler;
pub mod script;
pub mod stuck_migration_monitor;

pub use error::{Error, Result};
