//! Result-bearing tasks

use crate::task::root::TaskRoot;
use crate::task::types::*;
use std::ops::Deref;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// A task whose body produces a value of type `T`
///
/// The value is assigned once, when the body returns, and is readable only
/// after the whole tree completed. Dereferences to the underlying
/// [`TaskRoot`] for control and observation.
pub struct ResultTask<T> {
    root: TaskRoot,
    slot: Arc<OnceLock<T>>,
}

impl<T> ResultTask<T> {
    pub(crate) fn new(root: TaskRoot, slot: Arc<OnceLock<T>>) -> Self {
        Self { root, slot }
    }

    pub fn root(&self) -> &TaskRoot {
        &self.root
    }

    /// Borrow the result without blocking.
    ///
    /// Before completion, after a failure, or when no value was produced
    /// this yields [`TaskError::Execution`] wrapping the cause.
    pub fn result_ref(&self) -> Result<&T> {
        self.root.outcome()?;
        self.slot
            .get()
            .ok_or_else(|| TaskError::execution(TaskError::MissingResult))
    }

    /// Block until the task is terminal, then borrow the result
    pub fn wait_result_ref(&self) -> Result<&T> {
        self.root.wait_uninterruptibly();
        self.result_ref()
    }
}

impl<T: Clone> ResultTask<T> {
    /// Clone of the result; see [`result_ref`](Self::result_ref)
    pub fn result(&self) -> Result<T> {
        self.result_ref().cloned()
    }

    /// Block until the task is terminal, then clone the result
    pub fn wait_result(&self) -> Result<T> {
        self.wait_result_ref().cloned()
    }

    /// Wait at most `timeout` for the result.
    ///
    /// A timeout yields [`TaskError::Execution`] wrapping
    /// [`TaskError::NotFinished`]; the task keeps running.
    pub fn wait_result_timeout(&self, timeout: Duration) -> Result<T> {
        self.root.wait_timeout(timeout);
        self.result()
    }

    /// Await the result from async code
    pub async fn result_async(&self) -> Result<T> {
        self.root.wait_async().await;
        self.result()
    }
}

impl<T> Deref for ResultTask<T> {
    type Target = TaskRoot;

    fn deref(&self) -> &TaskRoot {
        &self.root
    }
}

impl<T> Clone for ResultTask<T> {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
            slot: Arc::clone(&self.slot),
        }
    }
}
