//! tidewatch-clients: external collaborators of the reconciliation loop.
//!
//! Each collaborator is a trait consumed by `tidewatch-ops`, plus the
//! concrete implementation the daemon wires in:
//!
//! ```text
//! Broker           → RabbitMqBroker   (management HTTP API)
//! ComputeLifecycle → CommandLifecycle (argv templates via tokio::process)
//! Notifier         → LogNotifier, WebhookNotifier
//! ```
//!
//! All long-running calls accept a `CancellationToken` and return
//! promptly once it fires.

pub mod broker;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod notify;

pub use broker::{Broker, RabbitMqBroker};
pub use error::{BrokerError, HttpError, LifecycleError, NotifyError};
pub use lifecycle::{CommandLifecycle, ComputeLifecycle};
pub use notify::{LogNotifier, Notification, Notifier, Outcome, WebhookNotifier};
