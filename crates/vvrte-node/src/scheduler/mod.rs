// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task scheduling.
//!
//! Tasks move through three pools: pending (INIT), scheduled (SCHEDULED,
//! ranked 1..n) and running (RUNNING, rank 0). [`TaskScheduler::schedule`]
//! only consults the configured [`SchedulingStrategy`] when nothing is running
//! and the scheduled pool is empty.

pub mod algorithms;

use std::sync::Arc;

use tracing::{info, instrument, warn};
use vvrte_core::entities::{Task, TaskState};
use vvrte_core::geodesy::PolarCoordinate;
use vvrte_core::persistence::Persistence;
use vvrte_core::time::TimeService;
use vvrte_core::CoreError;

use crate::error::Result;

pub use algorithms::strategy_by_name;

/// A replaceable ordering policy.
pub trait SchedulingStrategy: Send + Sync {
    /// Move tasks from `pending` into `scheduled`, in execution order.
    ///
    /// `position` is where the real vehicle currently is. Returns false when
    /// no schedule could be produced.
    fn schedule(
        &self,
        position: &PolarCoordinate,
        depots: &[PolarCoordinate],
        scheduled: &mut Vec<Task>,
        pending: &mut Vec<Task>,
    ) -> bool;
}

/// Orders tasks into the run queue and hands out the next one.
pub struct TaskScheduler {
    persistence: Arc<dyn Persistence>,
    time: Arc<dyn TimeService>,
    strategy: Option<Box<dyn SchedulingStrategy>>,
}

impl TaskScheduler {
    /// Create a scheduler using the strategy registered under `strategy_name`.
    ///
    /// An unknown name is logged; such a scheduler never orders pending tasks.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        time: Arc<dyn TimeService>,
        strategy_name: &str,
    ) -> Self {
        let strategy = strategy_by_name(strategy_name);
        if strategy.is_none() {
            warn!(strategy = strategy_name, "Unknown scheduling strategy");
        }
        Self {
            persistence,
            time,
            strategy,
        }
    }

    /// Create a scheduler with an explicit strategy.
    pub fn with_strategy(
        persistence: Arc<dyn Persistence>,
        time: Arc<dyn TimeService>,
        strategy: Box<dyn SchedulingStrategy>,
    ) -> Self {
        Self {
            persistence,
            time,
            strategy: Some(strategy),
        }
    }

    /// Return the task to execute next, or `None` when there is nothing to do.
    ///
    /// A running task is returned untouched. Otherwise the head of the
    /// scheduled pool is promoted to RUNNING; the strategy is only asked to
    /// fill that pool from the pending tasks when it is empty.
    #[instrument(skip(self, position, depots))]
    pub async fn schedule(
        &self,
        position: &PolarCoordinate,
        depots: &[PolarCoordinate],
    ) -> Result<Option<Task>> {
        if let Some(running) = self.persistence.find_running_task().await? {
            return Ok(Some(running));
        }

        let mut scheduled = self.persistence.list_tasks_in_state(TaskState::Scheduled).await?;

        if scheduled.is_empty() {
            let mut pending = self.persistence.list_tasks_in_state(TaskState::Init).await?;
            if pending.is_empty() {
                return Ok(None);
            }

            let Some(strategy) = &self.strategy else {
                warn!(pending = pending.len(), "No scheduling strategy available");
                return Ok(None);
            };

            if !strategy.schedule(position, depots, &mut scheduled, &mut pending) {
                warn!("Scheduling strategy produced no schedule");
                return Ok(None);
            }

            for (index, task) in scheduled.iter_mut().enumerate() {
                task.state = TaskState::Scheduled;
                task.order = index as i32 + 1;
            }
            self.persistence.update_tasks(&scheduled).await?;
        }

        if scheduled.is_empty() {
            return Ok(None);
        }

        let mut head = scheduled.remove(0);
        head.state = TaskState::Running;
        head.order = 0;
        head.execution_start = Some(self.time.now());

        for (index, task) in scheduled.iter_mut().enumerate() {
            task.order = index as i32 + 1;
        }

        let mut changed = Vec::with_capacity(scheduled.len() + 1);
        changed.push(head.clone());
        changed.extend(scheduled);
        self.persistence.update_tasks(&changed).await?;

        info!(task_id = head.id, "Task promoted to running");
        Ok(Some(head))
    }

    /// Record the sensor values of a task and mark it COMPLETED.
    pub async fn complete(&self, task_id: i64, sensor_values: Option<Vec<u8>>) -> Result<Task> {
        let mut task = self
            .persistence
            .get_task(task_id)
            .await?
            .ok_or_else(|| CoreError::not_found("task", task_id))?;

        task.state = TaskState::Completed;
        task.execution_end = Some(self.time.now());
        task.sensor_values = sensor_values;
        self.persistence.update_task(&task).await?;

        info!(task_id, "Task completed");
        Ok(task)
    }
}
