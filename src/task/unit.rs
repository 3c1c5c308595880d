//! Task units: the executable nodes of a task tree
//!
//! A unit runs its body once on an executor thread, then materializes the
//! subtasks the body requested and completes when every branch it spawned
//! has finished. States move
//! `Unstarted -> Running -> CompletionPending -> Completed`, or to `Failed`
//! from any non-terminal state; terminal states are sticky, so every side
//! effect of a terminal transition happens exactly once.
//!
//! Units are linked without ownership cycles: a parent owns its children,
//! each unit owns the next unit of its sequential chain, and the back link
//! to the parent is weak. The owning root is passed along as context by the
//! job that runs a unit rather than stored in it.

use crate::task::handle::{HandleScope, TaskBody, TaskHandle};
use crate::task::lock;
use crate::task::root::RootCore;
use crate::task::strategy::ReportStrategy;
use crate::task::tracker::{TaskTracker, Weighting};
use crate::task::types::*;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread::{self, Thread};
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// The closed set of unit flavors
///
/// Only composite units carry the spawn queue, child list and default
/// strategy; lightweight and flattened units skip that allocation.
pub(crate) enum UnitKind {
    /// May spawn subtasks
    Composite(Box<Composite>),
    /// Cannot spawn or change its total
    Lightweight,
    /// Synthetic unit running a coalesced run of bodies in sequence
    Flattened,
}

pub(crate) struct Composite {
    queue: Mutex<SpawnQueue>,
    /// Emptied once the unit is terminal so a deep tree drops level by level
    children: Mutex<Vec<Arc<TaskUnit>>>,
    default_strategy: ReportStrategy,
}

impl UnitKind {
    fn composite(default_strategy: ReportStrategy) -> Self {
        UnitKind::Composite(Box::new(Composite {
            queue: Mutex::new(SpawnQueue::default()),
            children: Mutex::new(Vec::new()),
            default_strategy,
        }))
    }
}

pub(crate) enum Body {
    Single(TaskBody),
    Flattened(Vec<TaskBody>),
}

pub(crate) struct SubtaskRequest {
    pub(crate) body: TaskBody,
    pub(crate) parallel: bool,
    pub(crate) weighting: Option<Weighting>,
    pub(crate) lightweight: bool,
}

#[derive(Default)]
pub(crate) struct FlatRequest {
    bodies: Vec<TaskBody>,
    weightings: Vec<Option<Weighting>>,
}

impl FlatRequest {
    fn push(&mut self, request: SubtaskRequest) {
        self.weightings.push(request.weighting);
        self.bodies.push(request.body);
    }

    /// Fixed weight of the synthetic unit: the sum of what each body would
    /// have contributed as its own unit that never declared a total.
    /// Unweighted bodies use `default`.
    fn weighting(&self, default: &ReportStrategy) -> Result<Weighting> {
        let mut parts: u64 = 0;
        for weighting in &self.weightings {
            let ceiling = match weighting {
                Some(weighting) => weighting.ceiling_for(1)?,
                None => default.parts_to_report(1)?,
            };
            parts = parts.saturating_add(ceiling);
        }
        Ok(Weighting::Fixed(parts.min(MAX_PARTS - 1)))
    }
}

enum SpawnRequest {
    Single(SubtaskRequest),
    Flattened(FlatRequest),
}

impl SpawnRequest {
    fn parallel(&self) -> bool {
        match self {
            SpawnRequest::Single(request) => request.parallel,
            SpawnRequest::Flattened(_) => false,
        }
    }
}

#[derive(Default)]
pub(crate) struct SpawnQueue {
    requests: Vec<SpawnRequest>,
    flattening: Option<FlatRequest>,
}

/// A sequential chain of units sharing one display level.
///
/// Counted once in the root's running-branch counter and ended exactly once,
/// either by the last unit of the chain completing or by any unit failing.
pub(crate) struct Branch {
    pub(crate) id: TaskId,
    pub(crate) depth: usize,
    pub(crate) visible: AtomicBool,
    pub(crate) counted: AtomicBool,
    pub(crate) ended: AtomicBool,
}

impl Branch {
    fn new(id: TaskId, depth: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            depth,
            visible: AtomicBool::new(false),
            counted: AtomicBool::new(false),
            ended: AtomicBool::new(false),
        })
    }
}

pub(crate) struct TaskUnit {
    id: TaskId,
    kind: UnitKind,
    body: Mutex<Option<Body>>,
    tracker: Arc<TaskTracker>,
    branch: Arc<Branch>,
    /// Only chain heads may open a new display level
    head: bool,
    published: AtomicBool,
    /// Branches spawned by this unit still running, plus one token held by
    /// the unit itself until its own submissions are done
    outstanding: AtomicUsize,
    next: OnceLock<Arc<TaskUnit>>,
    parent: Option<Weak<TaskUnit>>,
    thread: Mutex<Option<Thread>>,
    interrupted: AtomicBool,
}

impl TaskUnit {
    /// The first unit of a task tree
    pub(crate) fn first(
        body: TaskBody,
        lightweight: bool,
        tracker: Arc<TaskTracker>,
        default_strategy: ReportStrategy,
    ) -> Arc<Self> {
        let id = Uuid::new_v4();
        let kind = if lightweight {
            UnitKind::Lightweight
        } else {
            UnitKind::composite(default_strategy)
        };
        Arc::new(Self::with_parts(
            id,
            kind,
            Body::Single(body),
            tracker,
            Branch::new(id, 0),
            true,
            None,
        ))
    }

    fn with_parts(
        id: TaskId,
        kind: UnitKind,
        body: Body,
        tracker: Arc<TaskTracker>,
        branch: Arc<Branch>,
        head: bool,
        parent: Option<Weak<TaskUnit>>,
    ) -> Self {
        Self {
            id,
            kind,
            body: Mutex::new(Some(body)),
            tracker,
            branch,
            head,
            published: AtomicBool::new(false),
            outstanding: AtomicUsize::new(1),
            next: OnceLock::new(),
            parent,
            thread: Mutex::new(None),
            interrupted: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn kind(&self) -> &UnitKind {
        &self.kind
    }

    pub(crate) fn tracker(&self) -> &Arc<TaskTracker> {
        &self.tracker
    }

    pub(crate) fn branch(&self) -> &Arc<Branch> {
        &self.branch
    }

    pub(crate) fn is_published(&self) -> bool {
        self.published.load(Ordering::Acquire)
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Execute this unit. Called on an executor thread.
    pub(crate) fn run(self: &Arc<Self>, root: &Arc<RootCore>) {
        if let Err(e) = self.tracker.set_state(TaskState::Running) {
            error!("Refusing to run task unit {}: {}", self.id, e);
            return;
        }
        *lock(&self.thread) = Some(thread::current());
        root.pre_publish(&self.branch);

        if root.is_cancelled() {
            self.detach_thread();
            self.fail(root, TaskError::Cancelled);
            return;
        }

        debug!("Task unit {} started", self.id);
        root.emit(TaskEvent::Started {
            task_id: self.id,
            at: chrono::Utc::now(),
        });

        let outcome = self.invoke_body(root);
        self.detach_thread();
        if let Err(cause) = outcome {
            self.fail(root, cause);
            return;
        }

        self.publish(root);

        if root.is_cancelled() {
            self.fail(root, TaskError::Cancelled);
            return;
        }
        if let Err(e) = self.tracker.set_state(TaskState::CompletionPending) {
            debug!("Task unit {} stopped before completion: {}", self.id, e);
            return;
        }

        let ready = match self.materialize(root) {
            Ok(ready) => ready,
            Err(cause) => {
                self.fail(root, cause);
                return;
            }
        };
        for unit in ready {
            root.submit(unit);
        }

        self.release(root);
    }

    fn invoke_body(self: &Arc<Self>, root: &Arc<RootCore>) -> Result<()> {
        let Some(body) = lock(&self.body).take() else {
            return Err(TaskError::protocol("task body already consumed"));
        };
        match body {
            Body::Single(body) => {
                let handle = TaskHandle::new(self, root, &self.tracker, HandleScope::Unit);
                guarded(|| body(&handle))
            }
            Body::Flattened(bodies) => {
                for body in bodies {
                    if root.is_cancelled() {
                        return Err(TaskError::Cancelled);
                    }
                    let scratch = TaskTracker::detached();
                    let handle =
                        TaskHandle::new(self, root, &scratch, HandleScope::FlattenedStep);
                    guarded(|| body(&handle))?;
                    self.publish(root);
                    self.tracker.increment(1)?;
                }
                Ok(())
            }
        }
    }

    /// Make this unit visible in the display stack, once.
    pub(crate) fn publish(&self, root: &RootCore) {
        if self.published.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.head || self.branch.visible.load(Ordering::Acquire) {
            root.show(&self.branch, Arc::clone(&self.tracker));
        }
    }

    pub(crate) fn enqueue(&self, request: SubtaskRequest) -> Result<()> {
        let mut queue = self.queue()?;
        if let Some(flat) = queue.flattening.as_mut() {
            if request.parallel {
                return Err(TaskError::protocol(
                    "parallel subtasks cannot be requested while flattening",
                ));
            }
            flat.push(request);
            return Ok(());
        }
        queue.requests.push(SpawnRequest::Single(request));
        Ok(())
    }

    pub(crate) fn begin_flatten(&self) -> Result<()> {
        let mut queue = self.queue()?;
        if queue.flattening.is_some() {
            return Err(TaskError::protocol("flattening cannot be nested"));
        }
        queue.flattening = Some(FlatRequest::default());
        Ok(())
    }

    pub(crate) fn end_flatten(&self) -> Result<()> {
        let mut queue = self.queue()?;
        let Some(flat) = queue.flattening.take() else {
            return Err(TaskError::protocol("end_flatten without begin_flatten"));
        };
        if !flat.bodies.is_empty() {
            queue.requests.push(SpawnRequest::Flattened(flat));
        }
        Ok(())
    }

    fn queue(&self) -> Result<std::sync::MutexGuard<'_, SpawnQueue>> {
        match &self.kind {
            UnitKind::Composite(composite) => Ok(lock(&composite.queue)),
            UnitKind::Lightweight => Err(TaskError::protocol(
                "lightweight tasks cannot spawn subtasks",
            )),
            UnitKind::Flattened => Err(TaskError::protocol(
                "flattened tasks cannot spawn subtasks",
            )),
        }
    }

    /// Turn queued requests into units. Returns the units to submit now:
    /// every parallel fork and the head of the sequential chain.
    fn materialize(self: &Arc<Self>, root: &Arc<RootCore>) -> Result<Vec<Arc<TaskUnit>>> {
        let UnitKind::Composite(composite) = &self.kind else {
            return Ok(Vec::new());
        };
        let requests = {
            let mut queue = lock(&composite.queue);
            if queue.flattening.is_some() {
                return Err(TaskError::protocol(
                    "begin_flatten was never closed by end_flatten",
                ));
            }
            std::mem::take(&mut queue.requests)
        };
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let depth = self.branch.depth + 1;
        let mut created = Vec::with_capacity(requests.len());
        let mut ready = Vec::new();
        let mut branches = Vec::new();
        let mut chain: Option<(Arc<Branch>, Arc<TaskUnit>)> = None;

        for request in requests {
            let id = Uuid::new_v4();
            let parallel = request.parallel();
            let (kind, body, weighting, flattened_len) = match request {
                SpawnRequest::Single(single) => {
                    let kind = if single.lightweight {
                        UnitKind::Lightweight
                    } else {
                        UnitKind::composite(composite.default_strategy.clone())
                    };
                    (kind, Body::Single(single.body), single.weighting, None)
                }
                SpawnRequest::Flattened(flat) => {
                    let weighting = flat.weighting(&composite.default_strategy)?;
                    let len = flat.bodies.len() as u64;
                    (
                        UnitKind::Flattened,
                        Body::Flattened(flat.bodies),
                        Some(weighting),
                        Some(len),
                    )
                }
            };
            let weighting = weighting
                .unwrap_or_else(|| Weighting::Strategy(composite.default_strategy.clone()));
            let tracker = TaskTracker::child_of(&self.tracker, String::new(), weighting)?;
            if let Some(len) = flattened_len {
                tracker.set_total(len)?;
            }
            let tracker = Arc::new(tracker);

            let (branch, head) = match (&chain, parallel) {
                (Some((branch, _)), false) => (Arc::clone(branch), false),
                _ => (Branch::new(id, depth), true),
            };

            let unit = Arc::new(Self::with_parts(
                id,
                kind,
                body,
                tracker,
                Arc::clone(&branch),
                head,
                Some(Arc::downgrade(self)),
            ));

            if head {
                branches.push(Arc::clone(&branch));
                ready.push(Arc::clone(&unit));
            }
            if !parallel {
                if let Some((_, tail)) = &chain {
                    let _ = tail.next.set(Arc::clone(&unit));
                }
                chain = Some((branch, Arc::clone(&unit)));
            }
            created.push(unit);
        }

        debug!(
            "Task unit {} materialized {} subtasks in {} branches",
            self.id,
            created.len(),
            branches.len()
        );

        self.outstanding.fetch_add(branches.len(), Ordering::AcqRel);
        for branch in &branches {
            root.pre_publish(branch);
        }
        lock(&composite.children).extend(created);
        Ok(ready)
    }

    /// Drop the token this unit holds on its own completion
    fn release(self: &Arc<Self>, root: &Arc<RootCore>) {
        if self.drop_token() {
            self.finish(root);
        }
    }

    /// Returns `true` for the caller that took the last outstanding token
    fn drop_token(&self) -> bool {
        self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1
    }

    fn finish(self: &Arc<Self>, root: &Arc<RootCore>) {
        if self.settle(root) {
            self.end_branch(root);
        }
    }

    /// Terminal transition once every branch spawned by this unit ended.
    /// Returns whether this unit's branch must end now.
    fn settle(self: &Arc<Self>, root: &Arc<RootCore>) -> bool {
        if root.is_cancelled() {
            return self.mark_failed(root, TaskError::Cancelled);
        }
        if self.tracker.set_state(TaskState::Completed).is_err() {
            return false;
        }

        debug!("Task unit {} completed", self.id);
        let now = chrono::Utc::now();
        root.emit(TaskEvent::Stopped {
            task_id: self.id,
            at: now,
        });
        root.emit(TaskEvent::Completed {
            task_id: self.id,
            at: now,
        });
        self.drop_children();

        match self.next.get() {
            // Hop through the executor so chain length never grows the stack
            Some(next) => {
                root.submit(Arc::clone(next));
                false
            }
            None => true,
        }
    }

    /// Move to `Failed` and unwind this unit's branch.
    pub(crate) fn fail(self: &Arc<Self>, root: &Arc<RootCore>, cause: TaskError) {
        if self.mark_failed(root, cause) {
            self.end_branch(root);
        }
    }

    /// Record the failure and fail the rest of the chain. Returns `false`
    /// if the unit was already terminal.
    fn mark_failed(self: &Arc<Self>, root: &Arc<RootCore>, cause: TaskError) -> bool {
        if self.tracker.set_state(TaskState::Failed).is_err() {
            return false;
        }

        if cause.is_cancellation() {
            debug!("Task unit {} cancelled", self.id);
        } else {
            warn!("Task unit {} failed: {}", self.id, cause);
        }
        let now = chrono::Utc::now();
        root.emit(TaskEvent::Stopped {
            task_id: self.id,
            at: now,
        });
        root.emit(TaskEvent::Failed {
            task_id: self.id,
            cause: cause.clone(),
            at: now,
        });
        self.drop_children();

        root.fail(cause);

        let mut ahead = self.next.get();
        while let Some(unit) = ahead {
            if unit.tracker.set_state(TaskState::Failed).is_ok() {
                root.emit(TaskEvent::Stopped {
                    task_id: unit.id,
                    at: now,
                });
                root.emit(TaskEvent::Failed {
                    task_id: unit.id,
                    cause: TaskError::Cancelled,
                    at: now,
                });
            }
            ahead = unit.next.get();
        }
        true
    }

    /// End this unit's branch and walk up through every ancestor whose last
    /// branch this was. A loop rather than recursion, so nesting depth never
    /// grows the stack.
    fn end_branch(self: &Arc<Self>, root: &Arc<RootCore>) {
        let mut ended = Vec::new();
        let mut current = Some(Arc::clone(self));
        while let Some(unit) = current.take() {
            if !root.unpublish(&unit.branch) {
                break;
            }
            ended.push(Arc::clone(&unit.branch));
            current = unit
                .parent
                .as_ref()
                .and_then(Weak::upgrade)
                .filter(|parent| parent.drop_token() && parent.settle(root));
        }
        // Every unit walked above is terminal by now
        for branch in &ended {
            root.branch_ended(branch);
        }
    }

    /// Interrupt every running unit of this subtree and flag it cancelled.
    /// Iterative for the same reason as `end_branch`.
    pub(crate) fn cancel(self: &Arc<Self>) {
        let mut pending = vec![Arc::clone(self)];
        while let Some(unit) = pending.pop() {
            unit.interrupt();
            if let UnitKind::Composite(composite) = &unit.kind {
                pending.extend(lock(&composite.children).iter().cloned());
            }
        }
    }

    fn interrupt(&self) {
        if self.tracker.state() != TaskState::Running {
            return;
        }
        // Flag and unpark under the slot lock, so `detach_thread` either sees
        // the token or prevents it.
        let slot = lock(&self.thread);
        if let Some(thread) = slot.as_ref() {
            self.interrupted.store(true, Ordering::Release);
            thread.unpark();
        }
    }

    /// Forget the execution thread, then clear the interrupt flag and consume
    /// any unpark token it left so it cannot wake an unrelated job later
    /// scheduled on this worker.
    fn detach_thread(&self) {
        let thread = lock(&self.thread).take();
        self.interrupted.store(false, Ordering::Release);
        if thread.is_some_and(|t| t.id() == thread::current().id()) {
            thread::park_timeout(Duration::ZERO);
        }
    }

    /// Terminal units release their subtree; every child is terminal by now
    fn drop_children(&self) {
        if let UnitKind::Composite(composite) = &self.kind {
            let children = std::mem::take(&mut *lock(&composite.children));
            drop(children);
        }
    }
}

/// Run a body, turning errors and panics into a recorded cause
fn guarded<F>(body: F) -> Result<()>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => Err(TaskError::from_body(error)),
        Err(payload) => {
            let message = if let Some(text) = payload.downcast_ref::<&str>() {
                (*text).to_string()
            } else if let Some(text) = payload.downcast_ref::<String>() {
                text.clone()
            } else {
                "non-string panic payload".to_string()
            };
            Err(TaskError::Panicked(message))
        }
    }
}
