//! tidewatch-core: shared types and configuration for tidewatch.
//!
//! Holds the data that flows between the broker, the decision engine and
//! the operation manager: queue observations, verdicts, the static
//! workload → queues mapping, and the validated daemon configuration.

pub mod config;
pub mod error;
pub mod types;

pub use config::{
    BrokerConfig, LifecycleConfig, NotifyConfig, PollingConfig, TidewatchConfig, TimeoutConfig,
    parse_duration,
};
pub use error::{ConfigError, ConfigResult};
pub use types::*;
