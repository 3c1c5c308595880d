//! CLI-specific functionality
//!
//! Argument parsing and a demonstration tree that exercises parallel
//! branches, sequential chains, flattening and cancellation while polling
//! the display stack.

pub mod args;
pub mod demo;

pub use args::{Args, Commands, ExecutionMode, RunConfig};
pub use demo::{DemoPlan, build_demo, run_demo};
