//! Display stack of currently active units
//!
//! Mutated only by units publishing or unpublishing themselves, read by any
//! observer. The ordered snapshot is rebuilt lazily when the stack is dirty
//! and handed out as an immutable shared slice.

use crate::task::tracker::TaskTracker;
use crate::task::types::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One visible level of the task tree
#[derive(Debug, Clone)]
pub struct ActiveTask {
    id: TaskId,
    depth: usize,
    tracker: Arc<TaskTracker>,
}

impl ActiveTask {
    /// Identifier of the level (the id of its chain head)
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Nesting depth, zero for the first unit
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn status(&self) -> String {
        self.tracker.status()
    }

    pub fn state(&self) -> TaskState {
        self.tracker.state()
    }

    pub fn parts_completed(&self) -> u64 {
        self.tracker.parts_completed()
    }

    pub fn total_parts(&self) -> u64 {
        self.tracker.total_parts()
    }

    pub fn percentage(&self) -> f64 {
        self.tracker.percentage()
    }

    /// Plain copy of the current values
    pub fn report(&self) -> ProgressReport {
        ProgressReport {
            id: self.id,
            depth: self.depth,
            status: self.status(),
            state: self.state(),
            parts_completed: self.parts_completed(),
            total_parts: self.total_parts(),
            percentage: self.percentage(),
        }
    }
}

/// Serializable progress line for presentation layers
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ProgressReport {
    pub id: TaskId,
    pub depth: usize,
    pub status: String,
    pub state: TaskState,
    pub parts_completed: u64,
    pub total_parts: u64,
    pub percentage: f64,
}

#[derive(Debug)]
struct Entry {
    seq: u64,
    task: ActiveTask,
}

#[derive(Debug)]
pub(crate) struct DisplayStack {
    entries: Vec<Entry>,
    next_seq: u64,
    dirty: bool,
    snapshot: Arc<[ActiveTask]>,
}

impl DisplayStack {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_seq: 0,
            dirty: false,
            snapshot: Arc::from(Vec::new()),
        }
    }

    /// Show `tracker` for level `id`, replacing whatever the level showed
    pub(crate) fn publish(&mut self, id: TaskId, depth: usize, tracker: Arc<TaskTracker>) {
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.task.id == id) {
            entry.task.tracker = tracker;
        } else {
            let seq = self.next_seq;
            self.next_seq += 1;
            self.entries.push(Entry {
                seq,
                task: ActiveTask { id, depth, tracker },
            });
        }
        self.dirty = true;
    }

    pub(crate) fn unpublish(&mut self, id: TaskId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.task.id != id);
        let removed = self.entries.len() != before;
        self.dirty |= removed;
        removed
    }

    pub(crate) fn snapshot(&mut self) -> Arc<[ActiveTask]> {
        if self.dirty {
            self.entries
                .sort_by(|a, b| a.task.depth.cmp(&b.task.depth).then(a.seq.cmp(&b.seq)));
            self.snapshot = self
                .entries
                .iter()
                .map(|entry| entry.task.clone())
                .collect::<Vec<_>>()
                .into();
            self.dirty = false;
        }
        Arc::clone(&self.snapshot)
    }
}
