//! Per-unit progress ledger
//!
//! Every numeric field is updated with compare-and-swap retry loops. Writers
//! are the owning unit's thread (progress) and arbitrary threads driving
//! failure or forwarding child progress, so no field is ever guarded by a
//! lock except the status text.

use crate::task::lock;
use crate::task::strategy::ReportStrategy;
use crate::task::types::*;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// How a child tracker's ceiling is derived
#[derive(Debug, Clone)]
pub enum Weighting {
    /// Fixed number of parts, regardless of the child's total
    Fixed(u64),
    /// Ceiling recomputed from the child's total
    Strategy(ReportStrategy),
}

impl Weighting {
    pub(crate) fn ceiling_for(&self, total: u64) -> Result<u64> {
        match self {
            Weighting::Fixed(parts) => Ok(*parts),
            Weighting::Strategy(strategy) => strategy.parts_to_report(total),
        }
    }
}

#[derive(Debug)]
struct ParentLink {
    tracker: Arc<TaskTracker>,
    weighting: Weighting,
}

/// Progress and state record of one task unit
#[derive(Debug)]
pub struct TaskTracker {
    status: Mutex<String>,
    state: AtomicU8,
    /// Total declared through `set_total`, without the completion part
    declared: AtomicU64,
    total: AtomicU64,
    completed: AtomicU64,
    parent: Option<ParentLink>,
    ceiling: AtomicU64,
    reported: AtomicU64,
}

impl TaskTracker {
    /// Create a top-level tracker with no parent
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: Mutex::new(status.into()),
            state: AtomicU8::new(TaskState::Unstarted as u8),
            declared: AtomicU64::new(0),
            total: AtomicU64::new(1),
            completed: AtomicU64::new(0),
            parent: None,
            ceiling: AtomicU64::new(0),
            reported: AtomicU64::new(0),
        }
    }

    /// Create a tracker reporting into `parent`.
    ///
    /// The parent's total grows by the initial ceiling.
    pub fn child_of(
        parent: &Arc<TaskTracker>,
        status: impl Into<String>,
        weighting: Weighting,
    ) -> Result<Self> {
        let ceiling = weighting.ceiling_for(1)?;
        parent.adjust_total(ceiling as i128);
        Ok(Self {
            parent: Some(ParentLink {
                tracker: Arc::clone(parent),
                weighting,
            }),
            ceiling: AtomicU64::new(ceiling),
            ..Self::new(status)
        })
    }

    /// A running tracker connected to nothing, used to absorb progress that
    /// must not be forwarded.
    pub(crate) fn detached() -> Self {
        let tracker = Self::new(String::new());
        tracker
            .state
            .store(TaskState::Running as u8, Ordering::Release);
        tracker
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn status(&self) -> String {
        lock(&self.status).clone()
    }

    pub fn set_status(&self, status: impl Into<String>) {
        *lock(&self.status) = status.into();
    }

    pub fn parts_completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Total parts, including the implicit completion part
    pub fn total_parts(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }

    /// Parts this tracker will contribute to its parent once complete
    pub fn parts_to_report(&self) -> u64 {
        self.ceiling.load(Ordering::Acquire)
    }

    /// Parts already forwarded to the parent
    pub fn parts_reported(&self) -> u64 {
        self.reported.load(Ordering::Acquire)
    }

    pub fn percentage(&self) -> f64 {
        let total = self.total_parts();
        if total == 0 {
            return 0.0;
        }
        self.parts_completed() as f64 * 100.0 / total as f64
    }

    /// Add `parts` completed parts, clamped to the total
    pub fn increment(&self, parts: u64) -> Result<()> {
        self.ensure_progress_allowed("increment")?;
        if parts < 1 {
            return Err(TaskError::invalid("increment requires at least one part"));
        }
        self.add_completed(parts);
        self.forward();
        Ok(())
    }

    /// Raise completed parts to `parts`, clamped to the total.
    ///
    /// Completed parts never move backwards; a lower value is ignored.
    pub fn set(&self, parts: u64) -> Result<()> {
        self.ensure_progress_allowed("set")?;
        let mut current = self.completed.load(Ordering::Acquire);
        loop {
            let target = parts.min(self.total_parts()).max(current);
            if target == current {
                return Ok(());
            }
            match self.completed.compare_exchange_weak(
                current,
                target,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.forward();
        Ok(())
    }

    /// Declare the number of parts of work, excluding the completion part.
    ///
    /// Only legal before anything has been reported. When the tracker reports
    /// to a parent through a strategy, the ceiling is recomputed and the
    /// parent's total adjusted accordingly.
    pub fn set_total(&self, total: u64) -> Result<()> {
        if total >= MAX_PARTS {
            return Err(TaskError::invalid(format!(
                "total of {} parts exceeds the maximum of {}",
                total,
                MAX_PARTS - 1
            )));
        }
        if self.parts_completed() > 0 || self.parts_reported() > 0 {
            return Err(TaskError::protocol(
                "total cannot change after progress has been reported",
            ));
        }
        if self.state().is_terminal() {
            return Err(TaskError::protocol(
                "total cannot change on a finished tracker",
            ));
        }

        let previous = self.declared.load(Ordering::Acquire);
        let new_total = self.total_parts() as i128 - previous as i128 + total as i128;

        if let Some(link) = &self.parent {
            let ceiling = link.weighting.ceiling_for(new_total.max(1) as u64)?;
            let old_ceiling = self.ceiling.swap(ceiling, Ordering::AcqRel);
            link.tracker
                .adjust_total(ceiling as i128 - old_ceiling as i128);
        }

        self.declared.store(total, Ordering::Release);
        self.adjust_total(total as i128 - previous as i128);
        Ok(())
    }

    /// Move to `target`, enforcing the unit state machine.
    ///
    /// Returns the state that was replaced. Reaching `Completed` forces
    /// completed parts up to the total.
    pub fn set_state(&self, target: TaskState) -> Result<TaskState> {
        let legal: &[TaskState] = match target {
            TaskState::Unstarted => &[],
            TaskState::Running => &[TaskState::Unstarted],
            TaskState::CompletionPending => &[TaskState::Running],
            TaskState::Completed => &[TaskState::CompletionPending],
            TaskState::Failed => &[
                TaskState::Unstarted,
                TaskState::Running,
                TaskState::CompletionPending,
            ],
        };

        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let from = TaskState::from_u8(current);
            if !legal.contains(&from) {
                return Err(TaskError::protocol(format!(
                    "illegal state transition {:?} -> {:?}",
                    from, target
                )));
            }
            match self.state.compare_exchange_weak(
                current,
                target as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if target == TaskState::Completed {
                        self.fill_completion();
                    }
                    return Ok(from);
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn ensure_progress_allowed(&self, operation: &str) -> Result<()> {
        let state = self.state();
        if state.accepts_progress() {
            Ok(())
        } else {
            Err(TaskError::protocol(format!(
                "cannot {} progress on a tracker in state {:?}",
                operation, state
            )))
        }
    }

    fn add_completed(&self, parts: u64) {
        let mut current = self.completed.load(Ordering::Acquire);
        loop {
            let target = current.saturating_add(parts).min(self.total_parts());
            if target == current {
                return;
            }
            match self.completed.compare_exchange_weak(
                current,
                target,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    fn fill_completion(&self) {
        let mut current = self.completed.load(Ordering::Acquire);
        loop {
            let total = self.total_parts();
            if current >= total {
                break;
            }
            match self.completed.compare_exchange_weak(
                current,
                total,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.forward();
    }

    /// Grow or shrink the total; never below completed parts or one.
    fn adjust_total(&self, delta: i128) {
        if delta == 0 {
            return;
        }
        let mut current = self.total.load(Ordering::Acquire);
        loop {
            let floor = self.parts_completed().max(1) as i128;
            let target = (current as i128 + delta)
                .max(floor)
                .min(MAX_PARTS as i128) as u64;
            if target == current {
                return;
            }
            match self.total.compare_exchange_weak(
                current,
                target,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Push newly earned parts up the chain of ancestors.
    ///
    /// Walks upward in a loop so tree depth never grows the stack; each
    /// level forwards only the positive delta it claims from `reported`.
    fn forward(&self) {
        let mut child = self;
        while let Some(link) = &child.parent {
            let delta = child.claim_unreported();
            if delta == 0 {
                return;
            }
            let parent = link.tracker.as_ref();
            if parent.state().is_terminal() {
                return;
            }
            parent.add_completed(delta);
            child = parent;
        }
    }

    /// Claim the difference between the rescaled progress and what was
    /// already forwarded. Zero when there is nothing new to report.
    fn claim_unreported(&self) -> u64 {
        let mut previous = self.reported.load(Ordering::Acquire);
        loop {
            let ceiling = self.ceiling.load(Ordering::Acquire);
            let total = self.total_parts().max(1);
            let done = self.parts_completed();
            let target = ((done as u128 * ceiling as u128) / total as u128).min(ceiling as u128)
                as u64;
            if target <= previous {
                return 0;
            }
            match self.reported.compare_exchange_weak(
                previous,
                target,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return target - previous,
                Err(actual) => previous = actual,
            }
        }
    }
}
