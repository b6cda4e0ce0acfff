//! Notification collaborator.
//!
//! Every finished lifecycle operation produces one [`Notification`].
//! Subjects distinguish the operation (`Restart`/`Stop`) and the outcome
//! (`SUCCESS`/`WARNING`/`FAILURE`).

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, info, warn};

use tidewatch_core::OperationKind;

use crate::error::NotifyError;
use crate::http::{self, HttpRequest};

/// How a lifecycle operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Success,
    /// Restart only: consumers did not come back within the verification window.
    Warning,
    Failure,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => f.write_str("SUCCESS"),
            Outcome::Warning => f.write_str("WARNING"),
            Outcome::Failure => f.write_str("FAILURE"),
        }
    }
}

/// A structured message about one lifecycle operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub workload: String,
    pub operation: OperationKind,
    pub outcome: Outcome,
}

impl Notification {
    pub fn new(
        recipient: impl Into<String>,
        workload: &str,
        operation: OperationKind,
        outcome: Outcome,
        body: impl Into<String>,
    ) -> Self {
        Self {
            recipient: recipient.into(),
            subject: format!("[tidewatch] {operation} {outcome}: {workload}"),
            body: body.into(),
            workload: workload.to_string(),
            operation,
            outcome,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Emits notifications as structured log events only.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, n: &Notification) -> Result<(), NotifyError> {
        match n.outcome {
            Outcome::Success => info!(
                recipient = %n.recipient,
                workload = %n.workload,
                subject = %n.subject,
                body = %n.body,
                "notification"
            ),
            Outcome::Warning => warn!(
                recipient = %n.recipient,
                workload = %n.workload,
                subject = %n.subject,
                body = %n.body,
                "notification"
            ),
            Outcome::Failure => error!(
                recipient = %n.recipient,
                workload = %n.workload,
                subject = %n.subject,
                body = %n.body,
                "notification"
            ),
        }
        Ok(())
    }
}

/// Posts notifications as JSON to a webhook, and logs them.
pub struct WebhookNotifier {
    url: String,
    timeout: Duration,
    log: LogNotifier,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
            log: LogNotifier,
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, n: &Notification) -> Result<(), NotifyError> {
        self.log.notify(n).await?;

        let body = serde_json::to_vec(n)?;
        let resp = http::send(HttpRequest::post_json(&self.url, body), self.timeout).await?;
        if !resp.is_success() {
            return Err(NotifyError::Delivery(format!(
                "webhook returned status {}",
                resp.status
            )));
        }
        Ok(())
    }
}
