//! Fan-out/fan-in with first-error semantics.
//!
//! Several handlers and both reconciler jobs fan work out over spawned tasks
//! and need the joined outcome: every subtask runs to completion, the first
//! error surfaces. Side effects already issued by siblings are not rolled
//! back; downstream consumers are idempotent.

use std::future::Future;

use tokio::task::JoinHandle;

use crate::error::{ControllerError, ControllerResult};

/// A group of spawned subtasks joined with first-error semantics.
pub struct TaskGroup {
    handles: Vec<JoinHandle<ControllerResult<()>>>,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self {
            handles: Vec::new(),
        }
    }

    /// Spawn a subtask onto the runtime. It begins running immediately.
    pub fn spawn<F>(&mut self, fut: F)
    where
        F: Future<Output = ControllerResult<()>> + Send + 'static,
    {
        self.handles.push(tokio::spawn(fut));
    }

    /// Wait for every subtask and return the first error, if any.
    pub async fn wait(self) -> ControllerResult<()> {
        let mut first_err = None;
        for handle in self.handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
                Err(join_err) => {
                    if join_err.is_panic() {
                        std::panic::resume_unwind(join_err.into_panic());
                    }
                    // Cancelled task: runtime is shutting down.
                    if first_err.is_none() {
                        first_err = Some(ControllerError::Shutdown);
                    }
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}
