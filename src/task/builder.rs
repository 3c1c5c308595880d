use crate::config::TaskConfig;
use crate::task::executor::Executor;
use crate::task::handle::TaskHandle;
use crate::task::root::{RootCore, TaskRoot};
use crate::task::strategy::ReportStrategy;
use crate::task::tracker::TaskTracker;
use crate::task::types::*;
use crate::task::unit::TaskUnit;
use crate::task::variants::ResultTask;
use crate::task::LoggingEventHandler;
use std::sync::{Arc, OnceLock};

/// Wires the first unit of a task tree to its root before start
pub struct TaskBuilder {
    executor: Arc<dyn Executor>,
    name: String,
    status: Option<String>,
    default_strategy: ReportStrategy,
    handlers: Vec<Arc<dyn TaskEventHandler>>,
}

impl TaskBuilder {
    /// Create a builder submitting work to `executor`
    pub fn new<E>(executor: E) -> Self
    where
        E: Executor + 'static,
    {
        Self::with_shared_executor(Arc::new(executor))
    }

    /// Create a builder sharing an executor with other task trees
    pub fn with_shared_executor(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor,
            name: "task".to_string(),
            status: None,
            default_strategy: ReportStrategy::default(),
            handlers: Vec::new(),
        }
    }

    /// Seed name, default strategy and event logging from configuration
    pub fn from_config(executor: Arc<dyn Executor>, config: &TaskConfig) -> Result<Self> {
        let mut builder = Self::with_shared_executor(executor)
            .name(config.name.clone())
            .default_strategy(config.default_strategy.to_strategy()?);
        if config.event_logging {
            builder = builder.event_handler(Arc::new(LoggingEventHandler));
        }
        Ok(builder)
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Initial status text; defaults to the name
    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Strategy used by subtasks spawned without an explicit weight or
    /// strategy
    pub fn default_strategy(mut self, strategy: ReportStrategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    pub fn event_handler(mut self, handler: Arc<dyn TaskEventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Build a composable task whose body may spawn subtasks
    pub fn build<F>(self, body: F) -> TaskRoot
    where
        F: FnOnce(&TaskHandle<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.assemble(Box::new(body), false)
    }

    /// Build a lightweight task: it cannot spawn subtasks or change its
    /// total, and carries no spawn queue, child list or default strategy
    pub fn build_lightweight<F>(self, body: F) -> TaskRoot
    where
        F: FnOnce(&TaskHandle<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.assemble(Box::new(body), true)
    }

    /// Build a task whose body produces a value
    pub fn build_with_result<T, F>(self, body: F) -> ResultTask<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&TaskHandle<'_>) -> anyhow::Result<T> + Send + 'static,
    {
        let slot = Arc::new(OnceLock::new());
        let writer = Arc::clone(&slot);
        let root = self.build(move |handle| {
            let value = body(handle)?;
            if writer.set(value).is_err() {
                return Err(TaskError::protocol("task result was already set").into());
            }
            Ok(())
        });
        ResultTask::new(root, slot)
    }

    fn assemble(self, body: crate::task::TaskBody, lightweight: bool) -> TaskRoot {
        let status = self.status.unwrap_or_else(|| self.name.clone());
        let tracker = Arc::new(TaskTracker::new(status));
        let first = TaskUnit::first(body, lightweight, tracker, self.default_strategy);
        let core = RootCore::new(self.name, self.executor, first, self.handlers);
        TaskRoot::from_core(Arc::new(core))
    }
}
