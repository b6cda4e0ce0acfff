//! Collaborator error types.

use thiserror::Error;

/// Errors talking to the message broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker not connected")]
    NotConnected,

    #[error("broker request failed: {0}")]
    Request(String),

    #[error("broker returned status {status} for {path}")]
    Status { status: u16, path: String },

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("invalid broker response: {0}")]
    Decode(String),

    #[error("broker request timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Errors invoking a compute-lifecycle operation.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("failed to launch `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{program}` exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("lifecycle call cancelled")]
    Cancelled,
}

/// Errors delivering a notification.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),

    #[error("failed to encode notification: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors from the shared HTTP/1 request helper.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("invalid url {0:?}")]
    InvalidUrl(String),

    #[error("connection to {address} failed: {reason}")]
    Connect { address: String, reason: String },

    #[error("request failed: {0}")]
    Request(String),

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl From<HttpError> for BrokerError {
    fn from(e: HttpError) -> Self {
        match e {
            HttpError::Timeout(d) => BrokerError::Timeout(d),
            other => BrokerError::Request(other.to_string()),
        }
    }
}

impl From<HttpError> for NotifyError {
    fn from(e: HttpError) -> Self {
        NotifyError::Delivery(e.to_string())
    }
}
