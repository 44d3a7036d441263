// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Script runtime seam.
//!
//! The launcher never interprets vehicle code. It asks a [`ScriptRuntime`] for
//! a [`ScriptWorker`], runs it until it yields, and then reads the snapshot,
//! the result text and the [`ApplicationState`] the script left behind.
//!
//! Two runtimes ship with the node:
//!
//! - [`MockScriptRuntime`]: replays queued outcomes per vehicle name.
//! - [`ProcessScriptRuntime`]: drives an external interpreter over stdin/stdout.

mod mock;
mod process;

pub use mock::{CreatedWorker, MockScriptRuntime, ScriptOutcome};
pub use process::ProcessScriptRuntime;

use std::sync::Arc;

use async_trait::async_trait;
use vvrte_core::entities::{Task, VirtualVehicle, VirtualVehicleState};

use crate::error::Result;
use crate::mapper::{Mapper, MappingDecision};

/// States a worker may yield with.
pub const YIELD_STATES: &[VirtualVehicleState] = &[
    VirtualVehicleState::TaskCompletionAwaited,
    VirtualVehicleState::Interrupted,
    VirtualVehicleState::Finished,
    VirtualVehicleState::Defective,
];

/// Everything a worker needs to execute one slice of a vehicle.
///
/// The vehicle travels with the worker, so completion is always correlated
/// to its owner.
pub struct WorkerContext {
    pub vehicle: VirtualVehicle,
    /// Resume from `vehicle.continuation` instead of starting over.
    pub use_continuation: bool,
    pub mapper: Arc<Mapper>,
}

/// What the script asked for before it yielded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplicationState {
    /// A task to execute locally.
    pub task: Option<Task>,
    /// A placement decision requiring migration.
    pub decision: Option<MappingDecision>,
}

/// One paused-or-finished execution of a vehicle's script.
#[async_trait]
pub trait ScriptWorker: Send {
    /// Run until the script yields. Returns one of [`YIELD_STATES`].
    async fn run(&mut self) -> Result<VirtualVehicleState>;

    /// Paused-execution snapshot, present after TASK_COMPLETION_AWAITED or INTERRUPTED.
    fn snapshot(&self) -> Option<Vec<u8>>;

    /// Human-readable result text.
    fn result(&self) -> Option<String>;

    fn application_state(&self) -> ApplicationState;
}

/// Creates script workers.
#[async_trait]
pub trait ScriptRuntime: Send + Sync {
    async fn create_worker(&self, context: WorkerContext) -> Result<Box<dyn ScriptWorker>>;
}

/// Ask the mapper about a task the script wants to execute.
///
/// A local decision becomes [`ApplicationState::task`], a migration decision
/// becomes [`ApplicationState::decision`].
pub async fn resolve_task_request(mapper: &Mapper, task: Task) -> Result<ApplicationState> {
    let decision = mapper.decide(&task).await?;
    if decision.migrate {
        Ok(ApplicationState {
            task: None,
            decision: Some(decision),
        })
    } else {
        Ok(ApplicationState {
            task: Some(task),
            decision: None,
        })
    }
}
