//! # progtree
//!
//! Hierarchical, cancellable task execution with composable progress
//! tracking. Background work runs on an external executor while observers
//! follow fine-grained progress and get deterministic failure and
//! cancellation semantics.
//!
//! ## Architecture Overview
//!
//! - **[`task`]**: the execution core
//!   - report strategies deciding how much of a subtask's progress reaches
//!     its parent
//!   - lock-free trackers aggregating progress up a tree that grows at
//!     runtime
//!   - task units running the per-node state machine
//!   - task roots exposing waits, status and the active display stack
//! - **[`config`]**: TOML configuration for builders
//! - **[`cli`]**: a small demonstration front end
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use progtree::{ReportStrategy, TaskBuilder, ThreadExecutor};
//!
//! fn main() -> anyhow::Result<()> {
//!     let root = TaskBuilder::new(ThreadExecutor::new())
//!         .name("export")
//!         .default_strategy(ReportStrategy::constant(100)?)
//!         .build(|task| {
//!             task.set_status("Exporting");
//!             for chunk in 0..2 {
//!                 task.spawn(move |sub| {
//!                     sub.set_total(10)?;
//!                     for _ in 0..10 {
//!                         sub.check_cancel()?;
//!                         sub.increment()?;
//!                     }
//!                     sub.set_status(format!("chunk {} done", chunk));
//!                     Ok(())
//!                 })?;
//!             }
//!             Ok(())
//!         });
//!
//!     root.start()?;
//!     let completed = root.wait()?;
//!     println!("completed: {}, {:.0}%", completed, root.percentage());
//!     Ok(())
//! }
//! ```

/// Task execution and progress tracking core.
///
/// Provides trackers, report strategies, task units, roots and the handle
/// work bodies use to report progress and spawn subtasks.
pub mod task;

/// Configuration loading for task builders.
pub mod config;

/// Command line front end used by the `progtree` binary.
pub mod cli;

pub use config::{StrategyConfig, TaskConfig};
pub use task::{
    ActiveTask, Executor, LoggingEventHandler, ProgressReport, ReportStrategy, ResultTask,
    RootState, TaskBuilder, TaskError, TaskEvent, TaskEventHandler, TaskHandle, TaskId,
    TaskRoot, TaskState, TaskTracker, ThreadExecutor, TokioExecutor,
};
