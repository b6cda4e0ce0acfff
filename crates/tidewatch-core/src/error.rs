//! Configuration error types.

use thiserror::Error;

/// Result type alias for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or validating configuration.
///
/// All of these are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration for `{field}`: {value:?}")]
    InvalidDuration { field: &'static str, value: String },

    #[error("`{0}` must be greater than zero")]
    ZeroDuration(&'static str),

    #[error(
        "stuck operation threshold ({stuck:?}) must exceed the operation timeout plus cancel grace ({operation:?} + {cancel_grace:?})"
    )]
    StuckThresholdTooLow {
        stuck: std::time::Duration,
        operation: std::time::Duration,
        cancel_grace: std::time::Duration,
    },

    #[error(
        "operation timeout ({operation:?}) must exceed the restart verification window ({verification:?})"
    )]
    VerificationExceedsOperation {
        verification: std::time::Duration,
        operation: std::time::Duration,
    },

    #[error("workload mapping must contain at least one workload")]
    NoWorkloads,

    #[error("queue {queue:?} is assigned to both {first:?} and {second:?}")]
    QueueOwnedTwice {
        queue: String,
        first: String,
        second: String,
    },

    #[error("queue {queue:?} is listed more than once for workload {workload:?}")]
    DuplicateQueue { workload: String, queue: String },

    #[error("lifecycle command `{0}` must not be empty")]
    EmptyCommand(&'static str),

    #[error("environment variable {0} (broker.password_env) is not set")]
    MissingEnv(String),
}
