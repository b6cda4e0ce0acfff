//! Operation manager error types.

use thiserror::Error;

/// Reasons an operation task could not be scheduled.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("launcher is closed (shutdown in progress)")]
    Closed,

    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),

    #[error("launcher rejected task: {0}")]
    Rejected(String),
}
