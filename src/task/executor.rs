//! Executor seam
//!
//! The task core never schedules CPU time itself. It hands units of work to
//! an [`Executor`], which must eventually run each job on some thread and
//! offers no other guarantee.

use tracing::error;

/// A unit of work handed to an executor
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs submitted jobs on some thread
pub trait Executor: Send + Sync {
    fn execute(&self, job: Job);
}

impl<F> Executor for F
where
    F: Fn(Job) + Send + Sync,
{
    fn execute(&self, job: Job) {
        self(job)
    }
}

/// Runs every job on a freshly spawned OS thread
#[derive(Debug, Clone, Default)]
pub struct ThreadExecutor {
    name_prefix: Option<String>,
}

impl ThreadExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name spawned threads `<prefix>-worker`
    pub fn with_name_prefix(prefix: impl Into<String>) -> Self {
        Self {
            name_prefix: Some(prefix.into()),
        }
    }
}

impl Executor for ThreadExecutor {
    fn execute(&self, job: Job) {
        let mut builder = std::thread::Builder::new();
        if let Some(prefix) = &self.name_prefix {
            builder = builder.name(format!("{}-worker", prefix));
        }
        if let Err(e) = builder.spawn(job) {
            error!("Failed to spawn worker thread, job dropped: {}", e);
        }
    }
}

/// Delegates to a tokio runtime's blocking pool
#[derive(Debug, Clone)]
pub struct TokioExecutor {
    handle: tokio::runtime::Handle,
}

impl TokioExecutor {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Use the runtime of the calling context.
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }
}

impl Executor for TokioExecutor {
    fn execute(&self, job: Job) {
        // Task bodies block; keep them off the async worker threads.
        drop(self.handle.spawn_blocking(job));
    }
}
