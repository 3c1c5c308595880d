//! Command line argument parsing
//!
//! Subcommands:
//! - `run`: Run a demonstration task tree and watch its progress
//! - `show-config`: Print the default configuration as TOML

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug)]
pub enum ExecutionMode {
    Run(RunConfig),
    ShowConfig,
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub config_file: Option<PathBuf>,
    pub branches: usize,
    pub steps: u64,
    pub step_delay: Duration,
    pub poll_interval: Duration,
    pub cancel_after: Option<Duration>,
    pub fail_branch: Option<usize>,
    pub json: bool,
}

#[derive(Debug, Parser)]
#[command(name = "progtree")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run a task tree in the background and watch its progress")]
#[command(long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run a demonstration task tree
    Run {
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
        /// Number of parallel branches
        #[arg(short = 'b', long = "branches", default_value_t = 3)]
        branches: usize,
        /// Steps reported by each stage
        #[arg(short = 's', long = "steps", default_value_t = 10)]
        steps: u64,
        /// Delay per step in milliseconds
        #[arg(long = "step-ms", default_value_t = 50)]
        step_ms: u64,
        /// Display refresh interval in milliseconds
        #[arg(long = "poll-ms", default_value_t = 200)]
        poll_ms: u64,
        /// Cancel the whole tree after this many milliseconds
        #[arg(long = "cancel-after-ms", value_name = "MS")]
        cancel_after_ms: Option<u64>,
        /// Make the given branch fail halfway through
        #[arg(long = "fail-branch", value_name = "INDEX")]
        fail_branch: Option<usize>,
        /// Print progress as JSON lines
        #[arg(long = "json")]
        json: bool,
    },
    /// Print the default configuration as TOML
    ShowConfig,
}

impl Args {
    pub fn parse() -> Self {
        Parser::parse()
    }

    pub fn mode(&self) -> Result<ExecutionMode, String> {
        match &self.command {
            Some(Commands::Run {
                config,
                branches,
                steps,
                step_ms,
                poll_ms,
                cancel_after_ms,
                fail_branch,
                json,
            }) => {
                if *branches == 0 {
                    return Err("At least one branch is required".to_string());
                }
                Ok(ExecutionMode::Run(RunConfig {
                    config_file: config.clone(),
                    branches: *branches,
                    steps: *steps,
                    step_delay: Duration::from_millis(*step_ms),
                    poll_interval: Duration::from_millis((*poll_ms).max(10)),
                    cancel_after: cancel_after_ms.map(Duration::from_millis),
                    fail_branch: *fail_branch,
                    json: *json,
                }))
            }
            Some(Commands::ShowConfig) => Ok(ExecutionMode::ShowConfig),
            None => Err(
                "No command specified. Use 'progtree --help' to see available commands."
                    .to_string(),
            ),
        }
    }
}
