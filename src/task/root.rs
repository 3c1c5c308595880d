//! Task roots: what observers hold
//!
//! A root owns the first unit of a tree, the cancellation flag, the single
//! retained failure cause and the display stack. It becomes terminal exactly
//! once, when the last counted branch of the tree has unwound, and wakes
//! every waiter at that moment.

use crate::task::display::{ActiveTask, DisplayStack, ProgressReport};
use crate::task::executor::Executor;
use crate::task::lock;
use crate::task::tracker::TaskTracker;
use crate::task::types::*;
use crate::task::unit::{Branch, TaskUnit};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct WaitState {
    /// Bumped by `interrupt_waiters`
    interrupts: u64,
}

pub(crate) struct RootCore {
    name: String,
    executor: Arc<dyn Executor>,
    first: Arc<TaskUnit>,
    state: AtomicU8,
    cancelled: AtomicBool,
    cause: OnceLock<TaskError>,
    running_branches: AtomicUsize,
    display: Mutex<DisplayStack>,
    monitor: Mutex<WaitState>,
    finished: Condvar,
    notify: tokio::sync::Notify,
    handlers: Vec<Arc<dyn TaskEventHandler>>,
}

impl RootCore {
    pub(crate) fn new(
        name: String,
        executor: Arc<dyn Executor>,
        first: Arc<TaskUnit>,
        handlers: Vec<Arc<dyn TaskEventHandler>>,
    ) -> Self {
        Self {
            name,
            executor,
            first,
            state: AtomicU8::new(RootState::Unstarted as u8),
            cancelled: AtomicBool::new(false),
            cause: OnceLock::new(),
            running_branches: AtomicUsize::new(0),
            display: Mutex::new(DisplayStack::new()),
            monitor: Mutex::new(WaitState::default()),
            finished: Condvar::new(),
            notify: tokio::sync::Notify::new(),
            handlers,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn state(&self) -> RootState {
        RootState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn tracker(&self) -> &Arc<TaskTracker> {
        self.first.tracker()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Hand a unit to the executor. The job keeps the root alive while the
    /// unit is in flight.
    pub(crate) fn submit(self: &Arc<Self>, unit: Arc<TaskUnit>) {
        let root = Arc::clone(self);
        self.executor.execute(Box::new(move || unit.run(&root)));
    }

    fn start(self: &Arc<Self>) -> Result<()> {
        if self
            .state
            .compare_exchange(
                RootState::Unstarted as u8,
                RootState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(TaskError::protocol(format!(
                "task '{}' was already started",
                self.name
            )));
        }

        info!("Starting task '{}'", self.name);
        self.pre_publish(self.first.branch());

        if self.is_cancelled() {
            debug!("Task '{}' was cancelled before it started", self.name);
            self.record_failure(TaskError::Cancelled);
            self.first.fail(self, TaskError::Cancelled);
            return Ok(());
        }

        self.submit(Arc::clone(&self.first));
        Ok(())
    }

    /// Request cancellation of the whole tree. Only the first caller
    /// cascades; later calls are no-ops.
    pub(crate) fn cancel(&self) -> bool {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        debug!("Cancelling task '{}'", self.name);
        self.first.cancel();
        true
    }

    fn record_failure(&self, cause: TaskError) -> bool {
        self.cause.set(cause).is_ok()
    }

    /// A unit failed: retain the first cause and cancel everything else
    pub(crate) fn fail(&self, cause: TaskError) {
        let cancellation = cause.is_cancellation();
        if self.record_failure(cause) && !cancellation {
            warn!("Task '{}' failing, cancelling remaining units", self.name);
        }
        self.cancel();
    }

    pub(crate) fn failure_cause(&self) -> Option<TaskError> {
        self.cause.get().cloned()
    }

    /// Count a branch as running, once
    pub(crate) fn pre_publish(&self, branch: &Branch) {
        if !branch.counted.swap(true, Ordering::AcqRel) {
            self.running_branches.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Show `tracker` as the current unit of `branch`
    pub(crate) fn show(&self, branch: &Branch, tracker: Arc<TaskTracker>) {
        let mut display = lock(&self.display);
        if branch.ended.load(Ordering::Acquire) {
            return;
        }
        branch.visible.store(true, Ordering::Release);
        display.publish(branch.id, branch.depth, tracker);
    }

    /// End `branch`, removing it from the display stack. Returns `false` if
    /// the branch had already ended.
    pub(crate) fn unpublish(&self, branch: &Branch) -> bool {
        let mut display = lock(&self.display);
        if branch.ended.swap(true, Ordering::AcqRel) {
            return false;
        }
        if branch.visible.swap(false, Ordering::AcqRel) {
            display.unpublish(branch.id);
        }
        true
    }

    /// An ended branch stops counting; the last one makes the root terminal
    pub(crate) fn branch_ended(&self, branch: &Branch) {
        if !branch.counted.load(Ordering::Acquire) {
            return;
        }
        if self.running_branches.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finish();
        }
    }

    fn finish(&self) {
        let completed =
            self.tracker().state() == TaskState::Completed && self.cause.get().is_none();
        let target = if completed {
            RootState::Completed
        } else {
            self.record_failure(TaskError::Cancelled);
            RootState::Failed
        };

        {
            let _guard = lock(&self.monitor);
            if self
                .state
                .compare_exchange(
                    RootState::Running as u8,
                    target as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                return;
            }
            self.finished.notify_all();
        }
        self.notify.notify_waiters();

        info!("Task '{}' finished: {:?}", self.name, target);
        self.emit(TaskEvent::RootFinished {
            name: self.name.clone(),
            state: target,
            at: chrono::Utc::now(),
        });
    }

    pub(crate) fn emit(&self, event: TaskEvent) {
        for handler in &self.handlers {
            handler.handle_event(&event);
        }
    }

    fn snapshot(&self) -> Arc<[ActiveTask]> {
        lock(&self.display).snapshot()
    }

    fn wait(&self, interruptible: bool) -> Result<bool> {
        let mut guard = lock(&self.monitor);
        let seen = guard.interrupts;
        loop {
            let state = self.state();
            if state.is_terminal() {
                return Ok(state == RootState::Completed);
            }
            if interruptible && guard.interrupts != seen {
                return Err(TaskError::Interrupted);
            }
            guard = self
                .finished
                .wait(guard)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    fn wait_timeout(&self, timeout: Duration) -> Option<bool> {
        let deadline = Instant::now() + timeout;
        let mut guard = lock(&self.monitor);
        loop {
            let state = self.state();
            if state.is_terminal() {
                return Some(state == RootState::Completed);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            guard = self
                .finished
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .0;
        }
    }

    fn interrupt_waiters(&self) {
        let mut guard = lock(&self.monitor);
        guard.interrupts = guard.interrupts.wrapping_add(1);
        self.finished.notify_all();
    }

    async fn wait_async(&self) -> bool {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let state = self.state();
            if state.is_terminal() {
                return state == RootState::Completed;
            }
            notified.await;
        }
    }
}

/// Handle held by the caller that owns a task tree
///
/// Cloning is cheap; every clone observes and controls the same tree.
#[derive(Clone)]
pub struct TaskRoot {
    core: Arc<RootCore>,
}

impl TaskRoot {
    pub(crate) fn from_core(core: Arc<RootCore>) -> Self {
        Self { core }
    }

    /// Name given at build time
    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// Identifier of the first unit
    pub fn id(&self) -> TaskId {
        self.core.first.id()
    }

    /// Submit the first unit to the executor.
    ///
    /// Fails if the task was already started. If it was cancelled before
    /// starting, the body never runs and the task fails with
    /// [`TaskError::Cancelled`].
    pub fn start(&self) -> Result<()> {
        self.core.start()
    }

    /// Cancel the task tree. Returns `true` for the call that actually
    /// triggered cancellation.
    pub fn cancel(&self) -> bool {
        self.core.cancel()
    }

    pub fn is_cancelled(&self) -> bool {
        self.core.is_cancelled()
    }

    pub fn state(&self) -> RootState {
        self.core.state()
    }

    pub fn status(&self) -> String {
        self.core.tracker().status()
    }

    pub fn parts_completed(&self) -> u64 {
        self.core.tracker().parts_completed()
    }

    pub fn total_parts(&self) -> u64 {
        self.core.tracker().total_parts()
    }

    pub fn percentage(&self) -> f64 {
        self.core.tracker().percentage()
    }

    pub fn is_completed(&self) -> bool {
        self.state() == RootState::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.state() == RootState::Failed
    }

    /// Completed or failed
    pub fn is_stopped(&self) -> bool {
        self.state().is_terminal()
    }

    /// The single retained failure cause, if any
    pub fn failure_cause(&self) -> Option<TaskError> {
        self.core.failure_cause()
    }

    /// Non-blocking outcome: `Ok` once completed, otherwise an
    /// [`TaskError::Execution`] wrapping the cause.
    pub fn outcome(&self) -> Result<()> {
        match self.state() {
            RootState::Completed => Ok(()),
            RootState::Failed => Err(TaskError::execution(
                self.failure_cause().unwrap_or(TaskError::Cancelled),
            )),
            RootState::Unstarted | RootState::Running => {
                Err(TaskError::execution(TaskError::NotFinished))
            }
        }
    }

    /// Block until the task is terminal. Returns whether it completed.
    ///
    /// Returns [`TaskError::Interrupted`] if
    /// [`interrupt_waiters`](Self::interrupt_waiters) is called meanwhile.
    /// Blocks forever on a task that is never started.
    pub fn wait(&self) -> Result<bool> {
        self.core.wait(true)
    }

    /// Block until the task is terminal, ignoring waiter interrupts
    pub fn wait_uninterruptibly(&self) -> bool {
        match self.core.wait(false) {
            Ok(completed) => completed,
            Err(_) => self.is_completed(),
        }
    }

    /// Block for at most `timeout`. `None` means the task is still running;
    /// timing out never cancels it.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<bool> {
        self.core.wait_timeout(timeout)
    }

    /// Wait for the task to be terminal without blocking a runtime thread
    pub async fn wait_async(&self) -> bool {
        self.core.wait_async().await
    }

    /// Wake every thread parked in [`wait`](Self::wait) with
    /// [`TaskError::Interrupted`]
    pub fn interrupt_waiters(&self) {
        self.core.interrupt_waiters()
    }

    /// Currently active units, from the first unit to the deepest leaf
    pub fn active_tasks(&self) -> Arc<[ActiveTask]> {
        self.core.snapshot()
    }

    /// Plain copies of the active units for presentation layers
    pub fn progress_reports(&self) -> Vec<ProgressReport> {
        self.active_tasks().iter().map(ActiveTask::report).collect()
    }
}

impl std::fmt::Debug for TaskRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRoot")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("parts_completed", &self.parts_completed())
            .field("total_parts", &self.total_parts())
            .finish()
    }
}
