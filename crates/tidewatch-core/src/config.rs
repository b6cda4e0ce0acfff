//! tidewatch.toml configuration parser.
//!
//! The file is deserialized into raw string-typed sections, then
//! validated into [`TidewatchConfig`]. Any problem is a [`ConfigError`]
//! and prevents the daemon from starting.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ConfigError, ConfigResult};
use crate::types::WorkloadMapping;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    polling: RawPolling,
    #[serde(default)]
    timeouts: RawTimeouts,
    broker: RawBroker,
    lifecycle: RawLifecycle,
    #[serde(default)]
    notify: RawNotify,
    workloads: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawPolling {
    interval: String,
}

impl Default for RawPolling {
    fn default() -> Self {
        Self {
            interval: "30s".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawTimeouts {
    idle: String,
    restart_verification: String,
    verification_poll: String,
    stop_start_delay: String,
    operation: String,
    stuck_operation: String,
    cancel_grace: String,
    shutdown_grace: String,
}

impl Default for RawTimeouts {
    fn default() -> Self {
        Self {
            idle: "10m".to_string(),
            restart_verification: "5m".to_string(),
            verification_poll: "10s".to_string(),
            stop_start_delay: "5s".to_string(),
            operation: "15m".to_string(),
            stuck_operation: "30m".to_string(),
            cancel_grace: "30s".to_string(),
            shutdown_grace: "30s".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawBroker {
    url: String,
    #[serde(default = "default_vhost")]
    vhost: String,
    #[serde(default = "default_username")]
    username: String,
    password: Option<String>,
    password_env: Option<String>,
    #[serde(default = "default_request_timeout")]
    request_timeout: String,
}

fn default_vhost() -> String {
    "/".to_string()
}

fn default_username() -> String {
    "guest".to_string()
}

fn default_request_timeout() -> String {
    "10s".to_string()
}

#[derive(Debug, Deserialize)]
struct RawLifecycle {
    start: Vec<String>,
    stop: Vec<String>,
    restart: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct RawNotify {
    recipient: Option<String>,
    webhook_url: Option<String>,
}

/// How often the reconciliation loop runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollingConfig {
    pub interval: Duration,
}

/// Timing knobs for decisions and lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// How long every consumer-bearing queue must stay empty before a stop.
    pub idle: Duration,
    /// How long a restart waits for consumers to reappear.
    pub restart_verification: Duration,
    /// Delay between consumer checks during verification.
    pub verification_poll: Duration,
    /// Pause between the stop and start halves of a restart.
    pub stop_start_delay: Duration,
    /// Upper bound on one lifecycle operation before it is cancelled.
    pub operation: Duration,
    /// Age after which an in-flight record is force-removed by the sweep.
    pub stuck_operation: Duration,
    /// How long a timed-out operation may take to observe cancellation.
    pub cancel_grace: Duration,
    /// How long shutdown waits for in-flight operations.
    pub shutdown_grace: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(600),
            restart_verification: Duration::from_secs(300),
            verification_poll: Duration::from_secs(10),
            stop_start_delay: Duration::from_secs(5),
            operation: Duration::from_secs(900),
            stuck_operation: Duration::from_secs(1800),
            cancel_grace: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// RabbitMQ management API connection settings.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Base URL of the management API, e.g. `http://rabbit:15672`.
    pub url: String,
    pub vhost: String,
    pub username: String,
    pub password: String,
    pub request_timeout: Duration,
}

/// Argv templates for the compute-lifecycle commands.
///
/// `{workload}` in any argument is replaced with the workload id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleConfig {
    pub start: Vec<String>,
    pub stop: Vec<String>,
    /// Dedicated restart command. When absent a restart is stop, delay, start.
    pub restart: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyConfig {
    pub recipient: String,
    /// Webhook receiving notifications as JSON. Log-only when unset.
    pub webhook_url: Option<String>,
}

/// Fully validated daemon configuration.
#[derive(Debug, Clone)]
pub struct TidewatchConfig {
    pub polling: PollingConfig,
    pub timeouts: TimeoutConfig,
    pub broker: BrokerConfig,
    pub lifecycle: LifecycleConfig,
    pub notify: NotifyConfig,
    pub workloads: WorkloadMapping,
}

impl TidewatchConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let raw: RawConfig = toml::from_str(content)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> ConfigResult<Self> {
        let polling = PollingConfig {
            interval: non_zero("polling.interval", &raw.polling.interval)?,
        };

        let t = &raw.timeouts;
        let timeouts = TimeoutConfig {
            idle: non_zero("timeouts.idle", &t.idle)?,
            restart_verification: duration("timeouts.restart_verification", &t.restart_verification)?,
            verification_poll: non_zero("timeouts.verification_poll", &t.verification_poll)?,
            stop_start_delay: duration("timeouts.stop_start_delay", &t.stop_start_delay)?,
            operation: non_zero("timeouts.operation", &t.operation)?,
            stuck_operation: non_zero("timeouts.stuck_operation", &t.stuck_operation)?,
            cancel_grace: duration("timeouts.cancel_grace", &t.cancel_grace)?,
            shutdown_grace: duration("timeouts.shutdown_grace", &t.shutdown_grace)?,
        };
        // A timed-out operation holds its claim for up to `cancel_grace`
        // more; the sweep must not free the workload inside that window.
        let released_by = timeouts.operation.saturating_add(timeouts.cancel_grace);
        if timeouts.stuck_operation <= released_by {
            return Err(ConfigError::StuckThresholdTooLow {
                stuck: timeouts.stuck_operation,
                operation: timeouts.operation,
                cancel_grace: timeouts.cancel_grace,
            });
        }
        if timeouts.operation <= timeouts.restart_verification {
            return Err(ConfigError::VerificationExceedsOperation {
                verification: timeouts.restart_verification,
                operation: timeouts.operation,
            });
        }

        let password = match (raw.broker.password, raw.broker.password_env) {
            (_, Some(var)) => std::env::var(&var).map_err(|_| ConfigError::MissingEnv(var))?,
            (Some(password), None) => password,
            (None, None) => "guest".to_string(),
        };
        let broker = BrokerConfig {
            url: raw.broker.url.trim_end_matches('/').to_string(),
            vhost: raw.broker.vhost,
            username: raw.broker.username,
            password,
            request_timeout: non_zero("broker.request_timeout", &raw.broker.request_timeout)?,
        };

        let lifecycle = LifecycleConfig {
            start: non_empty("lifecycle.start", raw.lifecycle.start)?,
            stop: non_empty("lifecycle.stop", raw.lifecycle.stop)?,
            restart: raw
                .lifecycle
                .restart
                .map(|argv| non_empty("lifecycle.restart", argv))
                .transpose()?,
        };

        let notify = NotifyConfig {
            recipient: raw
                .notify
                .recipient
                .unwrap_or_else(|| "operations".to_string()),
            webhook_url: raw.notify.webhook_url,
        };

        if raw.workloads.is_empty() {
            return Err(ConfigError::NoWorkloads);
        }
        let workloads = WorkloadMapping::new(raw.workloads)?;

        Ok(Self {
            polling,
            timeouts,
            broker,
            lifecycle,
            notify,
            workloads,
        })
    }
}

fn duration(field: &'static str, value: &str) -> ConfigResult<Duration> {
    parse_duration(value).ok_or_else(|| ConfigError::InvalidDuration {
        field,
        value: value.to_string(),
    })
}

fn non_zero(field: &'static str, value: &str) -> ConfigResult<Duration> {
    let d = duration(field, value)?;
    if d.is_zero() {
        return Err(ConfigError::ZeroDuration(field));
    }
    Ok(d)
}

fn non_empty(field: &'static str, argv: Vec<String>) -> ConfigResult<Vec<String>> {
    if argv.first().is_none_or(|program| program.trim().is_empty()) {
        return Err(ConfigError::EmptyCommand(field));
    }
    Ok(argv)
}

/// Parse a duration string like "500ms", "30s", "5m", "1h".
///
/// A bare number is read as seconds. Values that overflow are rejected.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let (number, scale) = if let Some(ms) = s.strip_suffix("ms") {
        return ms.trim().parse::<u64>().ok().map(Duration::from_millis);
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, 1)
    } else if let Some(mins) = s.strip_suffix('m') {
        (mins, 60)
    } else if let Some(hours) = s.strip_suffix('h') {
        (hours, 3600)
    } else {
        (s, 1)
    };
    let n = number.trim().parse::<u64>().ok()?;
    n.checked_mul(scale).map(Duration::from_secs)
}
