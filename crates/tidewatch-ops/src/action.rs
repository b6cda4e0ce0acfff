//! Lifecycle operations: the body of every launched task.
//!
//! [`execute`] clears the workload's idle markers, invokes the
//! lifecycle collaborator and, for restarts, waits for consumers to come
//! back. Every wait is raced against the operation's cancellation token.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tidewatch_clients::{Broker, ComputeLifecycle, LifecycleError, Notifier};
use tidewatch_core::{OperationKind, TimeoutConfig, WorkloadMapping};
use tidewatch_decision::IdleTracker;

/// Everything an operation task needs, cheap to clone per launch.
#[derive(Clone)]
pub struct OperationContext {
    pub broker: Arc<dyn Broker>,
    pub lifecycle: Arc<dyn ComputeLifecycle>,
    pub notifier: Arc<dyn Notifier>,
    pub idle: IdleTracker,
    pub mapping: Arc<WorkloadMapping>,
    pub recipient: String,
    pub timeouts: TimeoutConfig,
}

/// How one lifecycle operation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    /// The lifecycle call succeeded (and, for restarts, consumers returned).
    Succeeded { elapsed: Duration },
    /// Restart issued but these queues still had no consumer.
    Unverified { missing: Vec<String> },
    /// The lifecycle call failed.
    Failed(String),
    /// Cancelled before finishing (shutdown or sweep).
    Cancelled,
    /// Exceeded the operation timeout and was cancelled.
    TimedOut(Duration),
}

/// Run one lifecycle operation for `workload_id` to completion.
pub async fn execute(
    ctx: &OperationContext,
    workload_id: &str,
    kind: OperationKind,
    cancel: &CancellationToken,
) -> OperationOutcome {
    let started = Instant::now();
    let queues = ctx.mapping.queues_of(workload_id);

    let cleared = ctx.idle.clear(queues.iter().map(String::as_str));
    info!(
        workload = %workload_id,
        operation = %kind,
        idle_markers_cleared = cleared,
        "operation starting"
    );

    let call = match kind {
        OperationKind::Restart => ctx.lifecycle.restart(workload_id, cancel).await,
        OperationKind::Stop => ctx.lifecycle.stop(workload_id, cancel).await,
    };
    match call {
        Ok(()) => {}
        Err(LifecycleError::Cancelled) => return OperationOutcome::Cancelled,
        Err(e) => return OperationOutcome::Failed(e.to_string()),
    }

    if kind == OperationKind::Stop {
        return OperationOutcome::Succeeded {
            elapsed: started.elapsed(),
        };
    }

    match verify_consumers(ctx, workload_id, queues, cancel).await {
        Verification::Verified => OperationOutcome::Succeeded {
            elapsed: started.elapsed(),
        },
        Verification::Missing(missing) => OperationOutcome::Unverified { missing },
        Verification::Cancelled => OperationOutcome::Cancelled,
    }
}

enum Verification {
    Verified,
    Missing(Vec<String>),
    Cancelled,
}

/// Poll consumer counts until every queue has a consumer or the
/// verification window closes.
async fn verify_consumers(
    ctx: &OperationContext,
    workload_id: &str,
    queues: &[String],
    cancel: &CancellationToken,
) -> Verification {
    let deadline = Instant::now() + ctx.timeouts.restart_verification;

    loop {
        let mut missing = Vec::new();
        for queue in queues {
            let count = tokio::select! {
                count = ctx.broker.consumer_count(queue) => count,
                _ = cancel.cancelled() => return Verification::Cancelled,
            };
            match count {
                Ok(n) if n > 0 => {}
                Ok(_) => missing.push(queue.clone()),
                Err(e) => {
                    debug!(workload = %workload_id, %queue, error = %e, "consumer check failed");
                    missing.push(queue.clone());
                }
            }
        }

        if missing.is_empty() {
            debug!(workload = %workload_id, "consumers present on all queues");
            return Verification::Verified;
        }

        let now = Instant::now();
        if now >= deadline {
            warn!(
                workload = %workload_id,
                missing = ?missing,
                "consumers did not reappear within verification window"
            );
            return Verification::Missing(missing);
        }

        let pause = ctx.timeouts.verification_poll.min(deadline - now);
        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = cancel.cancelled() => return Verification::Cancelled,
        }
    }
}
