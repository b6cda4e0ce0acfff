//! Scheduling of operation tasks.
//!
//! The manager never awaits an operation; it hands the task to a
//! [`Launcher`]. The default [`TrackedLauncher`] spawns onto the current
//! tokio runtime and tracks tasks so shutdown can wait for them.

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio_util::task::TaskTracker;

use crate::error::LaunchError;

/// A boxed operation task.
pub type OperationFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Runs operation tasks independently of the polling loop.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Start `task` in the background.
    ///
    /// On error the task was not started.
    fn launch(&self, task: OperationFuture) -> Result<(), LaunchError>;

    /// Refuse further launches.
    fn close(&self);

    /// Wait until every launched task has finished. Only returns once
    /// the launcher is closed.
    async fn wait(&self);

    /// Number of tasks still running.
    fn active(&self) -> usize;
}

/// Spawns onto the ambient tokio runtime through a [`TaskTracker`].
#[derive(Debug, Clone, Default)]
pub struct TrackedLauncher {
    tracker: TaskTracker,
}

impl TrackedLauncher {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Launcher for TrackedLauncher {
    fn launch(&self, task: OperationFuture) -> Result<(), LaunchError> {
        if self.tracker.is_closed() {
            return Err(LaunchError::Closed);
        }
        let handle = Handle::try_current().map_err(|e| LaunchError::NoRuntime(e.to_string()))?;
        self.tracker.spawn_on(task, &handle);
        Ok(())
    }

    fn close(&self) {
        self.tracker.close();
    }

    async fn wait(&self) {
        self.tracker.wait().await;
    }

    fn active(&self) -> usize {
        self.tracker.len()
    }
}
