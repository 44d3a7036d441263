// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock script runtime for testing.
//!
//! Replays outcomes queued per vehicle name instead of executing code. A
//! vehicle without queued outcomes finishes immediately.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use vvrte_core::entities::{Task, VirtualVehicleState};

use super::{
    ApplicationState, ScriptRuntime, ScriptWorker, WorkerContext, resolve_task_request,
};
use crate::error::{Error, Result};
use crate::mapper::{Mapper, MappingDecision};

/// One scripted yield.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptOutcome {
    pub state: VirtualVehicleState,
    pub snapshot: Option<Vec<u8>>,
    pub result: Option<String>,
    /// Task handed to the mapper while running, like a script asking for a measurement.
    pub task_request: Option<Task>,
    /// Placement decision reported as is.
    pub decision: Option<MappingDecision>,
}

impl ScriptOutcome {
    fn new(state: VirtualVehicleState, snapshot: Option<Vec<u8>>) -> Self {
        Self {
            state,
            snapshot,
            result: None,
            task_request: None,
            decision: None,
        }
    }

    pub fn finished() -> Self {
        Self::new(VirtualVehicleState::Finished, None)
    }

    pub fn defective(result: impl Into<String>) -> Self {
        Self::new(VirtualVehicleState::Defective, None).with_result(result)
    }

    pub fn interrupted(snapshot: impl Into<Vec<u8>>) -> Self {
        Self::new(VirtualVehicleState::Interrupted, Some(snapshot.into()))
    }

    pub fn awaiting_task(snapshot: impl Into<Vec<u8>>) -> Self {
        Self::new(VirtualVehicleState::TaskCompletionAwaited, Some(snapshot.into()))
    }

    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }

    pub fn with_task_request(mut self, task: Task) -> Self {
        self.task_request = Some(task);
        self
    }

    pub fn with_decision(mut self, decision: MappingDecision) -> Self {
        self.decision = Some(decision);
        self
    }
}

/// A worker creation observed by the mock.
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedWorker {
    pub vehicle_name: String,
    pub uuid: String,
    pub use_continuation: bool,
    pub continuation: Option<Vec<u8>>,
}

/// Script runtime replaying queued outcomes.
#[derive(Clone, Default)]
pub struct MockScriptRuntime {
    outcomes: Arc<Mutex<HashMap<String, VecDeque<ScriptOutcome>>>>,
    failing: Arc<Mutex<HashSet<String>>>,
    created: Arc<Mutex<Vec<CreatedWorker>>>,
}

impl MockScriptRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next outcome for vehicles named `vehicle_name`.
    pub async fn push_outcome(&self, vehicle_name: &str, outcome: ScriptOutcome) {
        self.outcomes
            .lock()
            .await
            .entry(vehicle_name.to_string())
            .or_default()
            .push_back(outcome);
    }

    /// Make worker creation fail for vehicles named `vehicle_name`.
    pub async fn fail_creation_for(&self, vehicle_name: &str) {
        self.failing.lock().await.insert(vehicle_name.to_string());
    }

    /// Every worker created so far, in order.
    pub async fn created_workers(&self) -> Vec<CreatedWorker> {
        self.created.lock().await.clone()
    }
}

#[async_trait]
impl ScriptRuntime for MockScriptRuntime {
    async fn create_worker(&self, context: WorkerContext) -> Result<Box<dyn ScriptWorker>> {
        let vehicle = context.vehicle;

        if self.failing.lock().await.contains(&vehicle.name) {
            return Err(Error::Script(format!(
                "Cannot create worker for '{}'",
                vehicle.name
            )));
        }

        self.created.lock().await.push(CreatedWorker {
            vehicle_name: vehicle.name.clone(),
            uuid: vehicle.uuid.clone(),
            use_continuation: context.use_continuation,
            continuation: vehicle.continuation.clone(),
        });

        let outcome = self
            .outcomes
            .lock()
            .await
            .get_mut(&vehicle.name)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(ScriptOutcome::finished);

        Ok(Box::new(MockWorker {
            outcome,
            mapper: context.mapper,
            application_state: ApplicationState::default(),
        }))
    }
}

struct MockWorker {
    outcome: ScriptOutcome,
    mapper: Arc<Mapper>,
    application_state: ApplicationState,
}

#[async_trait]
impl ScriptWorker for MockWorker {
    async fn run(&mut self) -> Result<VirtualVehicleState> {
        if let Some(task) = self.outcome.task_request.take() {
            self.application_state = resolve_task_request(&self.mapper, task).await?;
        }
        if let Some(decision) = self.outcome.decision.take() {
            self.application_state.decision = Some(decision);
        }
        Ok(self.outcome.state)
    }

    fn snapshot(&self) -> Option<Vec<u8>> {
        self.outcome.snapshot.clone()
    }

    fn result(&self) -> Option<String> {
        self.outcome.result.clone()
    }

    fn application_state(&self) -> ApplicationState {
        self.application_state.clone()
    }
}
