//! Operation manager: the reconciliation loop driver.
//!
//! Each cycle sweeps stuck records, polls the broker, asks the decision
//! engine for verdicts and launches one operation per actionable
//! workload that is not already busy. The loop never waits on an
//! operation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use tidewatch_clients::{Broker, ComputeLifecycle, Notification, Notifier, Outcome};
use tidewatch_core::{OperationKind, TimeoutConfig, Verdict, WorkloadMapping};
use tidewatch_decision::DecisionEngine;

use crate::action::{self, OperationContext, OperationOutcome};
use crate::launcher::{Launcher, TrackedLauncher};
use crate::registry::{InFlight, OperationClaim, OperationRegistry};

/// External collaborators the manager drives.
#[derive(Clone)]
pub struct Collaborators {
    pub broker: Arc<dyn Broker>,
    pub lifecycle: Arc<dyn ComputeLifecycle>,
    pub notifier: Arc<dyn Notifier>,
}

/// Loop settings.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub polling_interval: Duration,
    pub timeouts: TimeoutConfig,
    pub recipient: String,
}

/// What happened to one actionable verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    Launched,
    AlreadyInFlight,
    LaunchFailed,
}

/// Summary of one polling cycle.
#[derive(Debug, Default)]
pub struct CycleReport {
    /// Stuck records force-removed at the start of the cycle.
    pub swept: Vec<InFlight>,
    /// Broker failure that ended the cycle early.
    pub broker_error: Option<String>,
    pub verdicts: BTreeMap<String, Verdict>,
    pub dispatched: BTreeMap<String, DispatchResult>,
}

/// Drives the polling loop and owns the in-flight registry.
pub struct OperationManager {
    engine: DecisionEngine,
    registry: OperationRegistry,
    launcher: Arc<dyn Launcher>,
    ctx: OperationContext,
    polling_interval: Duration,
}

impl OperationManager {
    pub fn new(
        mapping: Arc<WorkloadMapping>,
        config: ManagerConfig,
        collaborators: Collaborators,
    ) -> Self {
        let engine = DecisionEngine::new(Arc::clone(&mapping), config.timeouts.idle);
        let ctx = OperationContext {
            broker: collaborators.broker,
            lifecycle: collaborators.lifecycle,
            notifier: collaborators.notifier,
            idle: engine.idle_tracker(),
            mapping,
            recipient: config.recipient,
            timeouts: config.timeouts,
        };

        Self {
            engine,
            registry: OperationRegistry::new(),
            launcher: Arc::new(TrackedLauncher::new()),
            ctx,
            polling_interval: config.polling_interval,
        }
    }

    /// Replace the task launcher.
    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    pub fn engine(&self) -> &DecisionEngine {
        &self.engine
    }

    pub fn in_flight(&self) -> Vec<InFlight> {
        self.registry.in_flight()
    }

    /// Run one reconciliation cycle.
    ///
    /// Broker failures end the cycle early and are retried next cycle.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport {
            swept: self.registry.sweep_stuck(self.ctx.timeouts.stuck_operation),
            ..CycleReport::default()
        };

        let broker = &self.ctx.broker;
        if !broker.is_connected()
            && let Err(e) = broker.reconnect().await
        {
            warn!(error = %e, "broker unavailable, skipping cycle");
            report.broker_error = Some(e.to_string());
            return report;
        }

        let observations = match broker.list_queues().await {
            Ok(obs) => obs,
            Err(e) => {
                warn!(error = %e, "failed to list queues, skipping cycle");
                report.broker_error = Some(e.to_string());
                return report;
            }
        };

        let now = Instant::now().into_std();
        report.verdicts = self.engine.decide_at(&observations, now);

        for (workload, verdict) in &report.verdicts {
            if let Some(kind) = verdict.operation() {
                let result = self.dispatch(workload, kind);
                report.dispatched.insert(workload.clone(), result);
            }
        }

        debug!(
            observations = observations.len(),
            workloads = report.verdicts.len(),
            dispatched = report.dispatched.len(),
            in_flight = self.registry.len(),
            swept = report.swept.len(),
            "cycle complete"
        );
        report
    }

    /// Claim `workload` and launch `kind` for it in the background.
    pub fn dispatch(&self, workload: &str, kind: OperationKind) -> DispatchResult {
        let Some(claim) = self.registry.claim(workload, kind) else {
            return DispatchResult::AlreadyInFlight;
        };
        let id = claim.id();

        let task = Box::pin(run_operation(self.ctx.clone(), claim));
        match self.launcher.launch(task) {
            Ok(()) => {
                info!(%workload, operation = %kind, "operation launched");
                DispatchResult::Launched
            }
            Err(e) => {
                // The task never ran; free the slot here rather than
                // relying on the rejected task's guard.
                self.registry.release(workload, id);
                error!(%workload, operation = %kind, error = %e, "failed to launch operation");
                DispatchResult::LaunchFailed
            }
        }
    }

    /// Run cycles every polling interval until `shutdown` flips, then
    /// drain in-flight operations.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.polling_interval.as_secs(),
            workloads = self.ctx.mapping.len(),
            "reconciliation loop started"
        );

        let mut interval = tokio::time::interval(self.polling_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_cycle().await;
                }
                _ = shutdown.changed() => {
                    info!("reconciliation loop shutting down");
                    break;
                }
            }
        }

        self.shutdown().await;
    }

    /// Stop launching, cancel everything in flight and wait up to the
    /// shutdown grace period.
    pub async fn shutdown(&self) {
        self.launcher.close();
        self.registry.cancel_all();

        let grace = self.ctx.timeouts.shutdown_grace;
        let pending = self.launcher.active();
        if pending > 0 {
            info!(pending, grace_secs = grace.as_secs(), "waiting for in-flight operations");
        }

        match tokio::time::timeout(grace, self.launcher.wait()).await {
            Ok(()) => info!("all operations finished"),
            Err(_) => warn!(
                remaining = self.launcher.active(),
                in_flight = ?self.registry.in_flight(),
                "operations still running after shutdown grace period"
            ),
        }
    }
}

/// Body of one launched operation task.
///
/// The claim lives for the whole task, so the record is released on
/// every exit path, including a timeout.
async fn run_operation(ctx: OperationContext, claim: OperationClaim) {
    let workload = claim.workload_id().to_string();
    let kind = claim.kind();
    let cancel = claim.token().clone();
    let timeout = ctx.timeouts.operation;

    let work = action::execute(&ctx, &workload, kind, &cancel);
    tokio::pin!(work);

    let outcome = tokio::select! {
        outcome = &mut work => outcome,
        _ = tokio::time::sleep(timeout) => {
            error!(
                %workload,
                operation = %kind,
                timeout_secs = timeout.as_secs(),
                "operation timed out, forcing cancellation"
            );
            cancel.cancel();
            if tokio::time::timeout(ctx.timeouts.cancel_grace, &mut work).await.is_err() {
                warn!(
                    %workload,
                    operation = %kind,
                    "operation did not observe cancellation, abandoning it"
                );
            }
            OperationOutcome::TimedOut(timeout)
        }
    };

    notify_outcome(&ctx, &workload, kind, &outcome).await;
    drop(claim);
}

/// Log and notify the result of an operation.
async fn notify_outcome(
    ctx: &OperationContext,
    workload: &str,
    kind: OperationKind,
    outcome: &OperationOutcome,
) {
    let (level, body) = match outcome {
        OperationOutcome::Succeeded { elapsed } => {
            let body = match kind {
                OperationKind::Restart => format!(
                    "{workload} restarted; consumers present on all queues after {}s",
                    elapsed.as_secs()
                ),
                OperationKind::Stop => {
                    format!("{workload} stopped after {}s", elapsed.as_secs())
                }
            };
            (Outcome::Success, body)
        }
        OperationOutcome::Unverified { missing } => (
            Outcome::Warning,
            format!(
                "{workload} restarted but no consumers reappeared within {}s on: {}",
                ctx.timeouts.restart_verification.as_secs(),
                missing.join(", ")
            ),
        ),
        OperationOutcome::Failed(e) => (
            Outcome::Failure,
            format!("{kind} of {workload} failed: {e}"),
        ),
        OperationOutcome::Cancelled => (
            Outcome::Failure,
            format!("{kind} of {workload} was cancelled before completing"),
        ),
        OperationOutcome::TimedOut(after) => (
            Outcome::Failure,
            format!("{kind} of {workload} timed out after {}s", after.as_secs()),
        ),
    };

    match level {
        Outcome::Success => info!(%workload, operation = %kind, "operation succeeded"),
        Outcome::Warning => warn!(%workload, operation = %kind, "operation unverified"),
        Outcome::Failure => {
            error!(%workload, operation = %kind, outcome = ?outcome, "operation failed")
        }
    }

    let notification = Notification::new(&ctx.recipient, workload, kind, level, body);
    if let Err(e) = ctx.notifier.notify(&notification).await {
        warn!(%workload, error = %e, "failed to deliver notification");
    }
}
