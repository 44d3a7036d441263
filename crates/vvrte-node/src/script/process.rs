// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Script runtime driving an external interpreter process.
//!
//! Each slice spawns the configured command once. The request is written to
//! stdin as one JSON document, the response is read from stdout:
//!
//! ```text
//! stdin:  {"name", "uuid", "api_version", "code", "continuation": base64|null}
//! stdout: {"state", "result"?, "snapshot": base64?, "task"?: {latitude, longitude,
//!          altitude, tolerance?, sensors?}}
//! ```

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument};
use vvrte_core::entities::{DEFAULT_TOLERANCE, SensorDefinition, Task, VirtualVehicle, VirtualVehicleState};
use vvrte_core::geodesy::PolarCoordinate;
use vvrte_core::time::TimeService;

use super::{
    ApplicationState, ScriptRuntime, ScriptWorker, WorkerContext, YIELD_STATES,
    resolve_task_request,
};
use crate::error::{Error, Result};
use crate::mapper::Mapper;

#[derive(Debug, Serialize)]
struct ScriptRequest<'a> {
    name: &'a str,
    uuid: &'a str,
    api_version: i32,
    code: &'a str,
    continuation: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ScriptResponse {
    state: VirtualVehicleState,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    snapshot: Option<String>,
    #[serde(default)]
    task: Option<TaskRequest>,
}

#[derive(Debug, Deserialize)]
struct TaskRequest {
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    altitude: f64,
    #[serde(default)]
    tolerance: Option<f64>,
    #[serde(default)]
    sensors: Vec<SensorDefinition>,
}

/// Runs vehicle code through an external interpreter.
pub struct ProcessScriptRuntime {
    program: String,
    args: Vec<String>,
    time: Arc<dyn TimeService>,
}

impl ProcessScriptRuntime {
    /// `command` is split on whitespace into program and arguments.
    pub fn new(command: &str, time: Arc<dyn TimeService>) -> Result<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| Error::Script("empty script command".to_string()))?;
        Ok(Self {
            program,
            args: parts.collect(),
            time,
        })
    }
}

#[async_trait]
impl ScriptRuntime for ProcessScriptRuntime {
    async fn create_worker(&self, context: WorkerContext) -> Result<Box<dyn ScriptWorker>> {
        if context.vehicle.code.as_deref().is_none_or(str::is_empty) {
            return Err(Error::Script(format!(
                "Virtual vehicle '{}' has no code",
                context.vehicle.name
            )));
        }
        if context.use_continuation && context.vehicle.continuation.is_none() {
            return Err(Error::Script(format!(
                "Virtual vehicle '{}' has no continuation to resume from",
                context.vehicle.name
            )));
        }

        Ok(Box::new(ProcessWorker {
            program: self.program.clone(),
            args: self.args.clone(),
            time: self.time.clone(),
            vehicle: context.vehicle,
            use_continuation: context.use_continuation,
            mapper: context.mapper,
            snapshot: None,
            result: None,
            application_state: ApplicationState::default(),
        }))
    }
}

struct ProcessWorker {
    program: String,
    args: Vec<String>,
    time: Arc<dyn TimeService>,
    vehicle: VirtualVehicle,
    use_continuation: bool,
    mapper: Arc<Mapper>,
    snapshot: Option<Vec<u8>>,
    result: Option<String>,
    application_state: ApplicationState,
}

impl ProcessWorker {
    async fn exchange(&self) -> Result<ScriptResponse> {
        let request = ScriptRequest {
            name: &self.vehicle.name,
            uuid: &self.vehicle.uuid,
            api_version: self.vehicle.api_version,
            code: self.vehicle.code.as_deref().unwrap_or_default(),
            continuation: self
                .vehicle
                .continuation
                .as_ref()
                .filter(|_| self.use_continuation)
                .map(|c| BASE64.encode(c)),
        };
        let input = serde_json::to_vec(&request)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&input).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(Error::Script(format!(
                "interpreter exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(serde_json::from_slice(&output.stdout)?)
    }
}

#[async_trait]
impl ScriptWorker for ProcessWorker {
    #[instrument(skip(self), fields(vehicle = %self.vehicle.uuid))]
    async fn run(&mut self) -> Result<VirtualVehicleState> {
        let response = self.exchange().await?;

        if !response.state.is_in(YIELD_STATES) {
            return Err(Error::Script(format!(
                "interpreter yielded unexpected state {}",
                response.state
            )));
        }

        self.result = response.result;
        self.snapshot = response
            .snapshot
            .map(|s| BASE64.decode(s.as_bytes()))
            .transpose()
            .map_err(|e| Error::Script(format!("invalid snapshot encoding: {}", e)))?;

        if let Some(request) = response.task {
            let mut task = Task::new(
                PolarCoordinate::new(request.latitude, request.longitude, request.altitude),
                request.sensors,
                self.time.now(),
            );
            task.tolerance = request.tolerance.unwrap_or(DEFAULT_TOLERANCE);
            self.application_state = resolve_task_request(&self.mapper, task).await?;
        }

        debug!(state = %response.state, "Interpreter yielded");
        Ok(response.state)
    }

    fn snapshot(&self) -> Option<Vec<u8>> {
        self.snapshot.clone()
    }

    fn result(&self) -> Option<String> {
        self.result.clone()
    }

    fn application_state(&self) -> ApplicationState {
        self.application_state.clone()
    }
}
