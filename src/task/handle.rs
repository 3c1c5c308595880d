//! The handle a work body receives
//!
//! Bodies report progress, poll for cancellation and request subtasks
//! through a [`TaskHandle`]. The handle only lives for the duration of the
//! body call, so spawning after the body returned is impossible by
//! construction.

use crate::task::root::RootCore;
use crate::task::strategy::ReportStrategy;
use crate::task::tracker::{TaskTracker, Weighting};
use crate::task::types::*;
use crate::task::unit::{SubtaskRequest, TaskUnit, UnitKind};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A work body: runs once on an executor thread with a handle to its unit
pub type TaskBody = Box<dyn FnOnce(&TaskHandle<'_>) -> anyhow::Result<()> + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandleScope {
    /// Body of a regular unit
    Unit,
    /// One step inside a flattened unit; progress is absorbed locally
    FlattenedStep,
}

/// Interface between a running work body and the task tree
pub struct TaskHandle<'a> {
    unit: &'a Arc<TaskUnit>,
    root: &'a Arc<RootCore>,
    progress: &'a TaskTracker,
    scope: HandleScope,
}

impl<'a> TaskHandle<'a> {
    pub(crate) fn new(
        unit: &'a Arc<TaskUnit>,
        root: &'a Arc<RootCore>,
        progress: &'a TaskTracker,
        scope: HandleScope,
    ) -> Self {
        Self {
            unit,
            root,
            progress,
            scope,
        }
    }

    /// Identifier of the unit running this body
    pub fn id(&self) -> TaskId {
        self.unit.id()
    }

    /// Name of the task tree this unit belongs to
    pub fn task_name(&self) -> &str {
        self.root.name()
    }

    pub fn status(&self) -> String {
        self.unit.tracker().status()
    }

    pub fn set_status(&self, status: impl Into<String>) {
        self.unit.tracker().set_status(status);
    }

    /// Report one completed part
    pub fn increment(&self) -> Result<()> {
        self.increment_by(1)
    }

    /// Report `parts` completed parts
    pub fn increment_by(&self, parts: u64) -> Result<()> {
        self.unit.publish(self.root);
        self.progress.increment(parts)
    }

    /// Raise completed parts to `parts`
    pub fn set(&self, parts: u64) -> Result<()> {
        self.unit.publish(self.root);
        self.progress.set(parts)
    }

    /// Declare how many parts of work this body will report.
    ///
    /// Legal only before the unit is first published, and never on a
    /// lightweight unit.
    pub fn set_total(&self, total: u64) -> Result<()> {
        if matches!(self.unit.kind(), UnitKind::Lightweight) {
            return Err(TaskError::protocol(
                "lightweight tasks cannot change their total",
            ));
        }
        if self.scope == HandleScope::Unit && self.unit.is_published() {
            return Err(TaskError::protocol(
                "total cannot change after the task was published",
            ));
        }
        self.progress.set_total(total)
    }

    pub fn parts_completed(&self) -> u64 {
        self.progress.parts_completed()
    }

    pub fn total_parts(&self) -> u64 {
        self.progress.total_parts()
    }

    /// Fail with [`TaskError::Cancelled`] if the task was cancelled
    pub fn check_cancel(&self) -> Result<()> {
        if self.poll_cancel() {
            Err(TaskError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Check whether the task was cancelled or this unit interrupted
    pub fn poll_cancel(&self) -> bool {
        self.root.is_cancelled() || self.unit.is_interrupted()
    }

    pub fn is_interrupted(&self) -> bool {
        self.unit.is_interrupted()
    }

    /// Sleep for `duration`, waking early with [`TaskError::Cancelled`] when
    /// the unit is interrupted.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        loop {
            self.check_cancel()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::park_timeout(deadline - now);
        }
    }

    /// Request a sequential subtask using the default report strategy
    pub fn spawn<F>(&self, body: F) -> Result<()>
    where
        F: FnOnce(&TaskHandle<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.request(false, None, false, Box::new(body))
    }

    /// Request a subtask that runs alongside its siblings
    pub fn spawn_parallel<F>(&self, body: F) -> Result<()>
    where
        F: FnOnce(&TaskHandle<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.request(true, None, false, Box::new(body))
    }

    /// Request a subtask contributing exactly `weight` parts to this unit
    pub fn spawn_weighted<F>(&self, parallel: bool, weight: u64, body: F) -> Result<()>
    where
        F: FnOnce(&TaskHandle<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        if weight >= MAX_PARTS {
            return Err(TaskError::invalid(format!(
                "subtask weight {} is at or above the maximum of {}",
                weight, MAX_PARTS
            )));
        }
        self.request(parallel, Some(Weighting::Fixed(weight)), false, Box::new(body))
    }

    /// Request a subtask reporting through `strategy`
    pub fn spawn_with_strategy<F>(
        &self,
        parallel: bool,
        strategy: ReportStrategy,
        body: F,
    ) -> Result<()>
    where
        F: FnOnce(&TaskHandle<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.request(
            parallel,
            Some(Weighting::Strategy(strategy)),
            false,
            Box::new(body),
        )
    }

    /// Request a lightweight subtask, which can neither spawn nor set a total
    pub fn spawn_light<F>(&self, parallel: bool, body: F) -> Result<()>
    where
        F: FnOnce(&TaskHandle<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.request(parallel, None, true, Box::new(body))
    }

    /// Start coalescing the following sequential requests into one unit
    pub fn begin_flatten(&self) -> Result<()> {
        self.ensure_can_spawn()?;
        self.unit.begin_flatten()
    }

    /// Close the run of requests opened by [`begin_flatten`](Self::begin_flatten)
    pub fn end_flatten(&self) -> Result<()> {
        self.ensure_can_spawn()?;
        self.unit.end_flatten()
    }

    fn request(
        &self,
        parallel: bool,
        weighting: Option<Weighting>,
        lightweight: bool,
        body: TaskBody,
    ) -> Result<()> {
        self.ensure_can_spawn()?;
        self.unit.enqueue(SubtaskRequest {
            body,
            parallel,
            weighting,
            lightweight,
        })
    }

    fn ensure_can_spawn(&self) -> Result<()> {
        if self.scope == HandleScope::FlattenedStep {
            return Err(TaskError::protocol(
                "flattened subtasks cannot spawn subtasks",
            ));
        }
        if self.unit.tracker().state() != TaskState::Running {
            return Err(TaskError::protocol(
                "subtasks can only be requested while the body is running",
            ));
        }
        Ok(())
    }
}
