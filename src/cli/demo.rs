//! Demonstration task tree and a polling progress display

use crate::cli::args::RunConfig;
use crate::config::TaskConfig;
use crate::task::{Executor, TaskBuilder, TaskHandle, TaskRoot, TokioExecutor};
use anyhow::{Context, Result, bail};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Shape of the demonstration tree
#[derive(Debug, Clone)]
pub struct DemoPlan {
    pub branches: usize,
    pub steps: u64,
    pub step_delay: Duration,
    pub fail_branch: Option<usize>,
}

impl From<&RunConfig> for DemoPlan {
    fn from(config: &RunConfig) -> Self {
        Self {
            branches: config.branches,
            steps: config.steps,
            step_delay: config.step_delay,
            fail_branch: config.fail_branch,
        }
    }
}

/// Build a tree of parallel branches, each running two sequential stages
/// followed by a flattened run of cleanup steps.
pub fn build_demo(builder: TaskBuilder, plan: DemoPlan) -> TaskRoot {
    builder.build(move |task| {
        task.set_status("Planning branches");
        for index in 0..plan.branches {
            let plan = plan.clone();
            task.spawn_parallel(move |branch| {
                branch.set_status(format!("Branch {}", index));
                for stage in ["scan", "transform"] {
                    let plan = plan.clone();
                    branch.spawn(move |sub| run_stage(sub, index, stage, &plan))?;
                }
                branch.begin_flatten()?;
                for step in 0..3 {
                    let delay = plan.step_delay;
                    branch.spawn(move |sub| {
                        sub.set_status(format!("Cleanup {} of branch {}", step + 1, index));
                        sub.sleep(delay)?;
                        Ok(())
                    })?;
                }
                branch.end_flatten()?;
                Ok(())
            })?;
        }
        task.set_status("Running branches");
        Ok(())
    })
}

fn run_stage(sub: &TaskHandle<'_>, index: usize, stage: &str, plan: &DemoPlan) -> Result<()> {
    sub.set_total(plan.steps)?;
    for step in 0..plan.steps {
        sub.set_status(format!(
            "Branch {} {}: step {}/{}",
            index,
            stage,
            step + 1,
            plan.steps
        ));
        sub.sleep(plan.step_delay)?;
        if plan.fail_branch == Some(index) && step == plan.steps / 2 {
            bail!("simulated failure in branch {} during {}", index, stage);
        }
        sub.increment()?;
    }
    Ok(())
}

/// Run the demonstration tree on the current tokio runtime, printing the
/// display stack until it finishes. Returns whether the tree completed.
pub async fn run_demo(config: RunConfig) -> Result<bool> {
    let task_config = match &config.config_file {
        Some(path) => TaskConfig::from_toml_file(path)?,
        None => TaskConfig::default(),
    };
    let executor: Arc<dyn Executor> = Arc::new(TokioExecutor::current());
    let builder = TaskBuilder::from_config(executor, &task_config)
        .context("Invalid task configuration")?;
    let root = build_demo(builder, DemoPlan::from(&config));

    info!("Starting demo tree '{}'", root.name());
    root.start()?;

    if let Some(delay) = config.cancel_after {
        let canceller = root.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if canceller.cancel() {
                info!("Cancelled demo tree after {:?}", delay);
            }
        });
    }

    let mut ticker = tokio::time::interval(config.poll_interval);
    let completed = loop {
        tokio::select! {
            completed = root.wait_async() => break completed,
            _ = ticker.tick() => print_progress(&root, config.json)?,
        }
    };

    print_progress(&root, config.json)?;
    match root.outcome() {
        Ok(()) => println!("Completed: {} ({:.1}%)", root.status(), root.percentage()),
        Err(e) => println!("Failed: {}", e),
    }
    Ok(completed)
}

fn print_progress(root: &TaskRoot, json: bool) -> Result<()> {
    if json {
        let reports = root.progress_reports();
        println!("{}", serde_json::to_string(&reports)?);
        return Ok(());
    }
    println!(
        "[{:>5.1}%] {} ({}/{})",
        root.percentage(),
        root.status(),
        root.parts_completed(),
        root.total_parts()
    );
    for active in root.active_tasks().iter().skip(1) {
        println!(
            "{}[{:>5.1}%] {}",
            "  ".repeat(active.depth()),
            active.percentage(),
            active.status()
        );
    }
    Ok(())
}
