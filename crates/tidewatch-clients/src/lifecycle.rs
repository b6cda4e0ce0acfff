//! Compute-lifecycle collaborator.
//!
//! Starting and stopping workloads is delegated to the hosting platform.
//! [`CommandLifecycle`] shells out to configured argv templates (a cloud
//! CLI, `kubectl scale`, a script), so tidewatch never embeds a vendor SDK.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use tidewatch_core::LifecycleConfig;

use crate::error::LifecycleError;

const WORKLOAD_PLACEHOLDER: &str = "{workload}";

/// Long-running lifecycle calls against the hosting platform.
///
/// Both operations may take minutes and must be safe to call again after
/// a failure. Implementations return [`LifecycleError::Cancelled`] soon
/// after `cancel` fires.
#[async_trait]
pub trait ComputeLifecycle: Send + Sync {
    async fn restart(
        &self,
        workload_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), LifecycleError>;

    async fn stop(&self, workload_id: &str, cancel: &CancellationToken)
    -> Result<(), LifecycleError>;
}

/// Lifecycle backed by external commands.
pub struct CommandLifecycle {
    config: LifecycleConfig,
    stop_start_delay: Duration,
}

impl CommandLifecycle {
    pub fn new(config: LifecycleConfig, stop_start_delay: Duration) -> Self {
        Self {
            config,
            stop_start_delay,
        }
    }
}

#[async_trait]
impl ComputeLifecycle for CommandLifecycle {
    async fn restart(
        &self,
        workload_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), LifecycleError> {
        if let Some(restart) = &self.config.restart {
            return run_command(restart, workload_id, cancel).await;
        }

        run_command(&self.config.stop, workload_id, cancel).await?;

        debug!(
            workload = %workload_id,
            delay_secs = self.stop_start_delay.as_secs_f64(),
            "waiting between stop and start"
        );
        tokio::select! {
            _ = tokio::time::sleep(self.stop_start_delay) => {}
            _ = cancel.cancelled() => return Err(LifecycleError::Cancelled),
        }

        run_command(&self.config.start, workload_id, cancel).await
    }

    async fn stop(
        &self,
        workload_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), LifecycleError> {
        run_command(&self.config.stop, workload_id, cancel).await
    }
}

/// Expand `{workload}` in every argument of the template.
fn render_argv(template: &[String], workload_id: &str) -> Vec<String> {
    template
        .iter()
        .map(|arg| arg.replace(WORKLOAD_PLACEHOLDER, workload_id))
        .collect()
}

/// Run one command to completion, killing it if `cancel` fires first.
async fn run_command(
    template: &[String],
    workload_id: &str,
    cancel: &CancellationToken,
) -> Result<(), LifecycleError> {
    let argv = render_argv(template, workload_id);
    let Some((program, args)) = argv.split_first() else {
        return Err(LifecycleError::Spawn {
            program: String::new(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
        });
    };

    info!(workload = %workload_id, command = %argv.join(" "), "running lifecycle command");

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| LifecycleError::Spawn {
            program: program.clone(),
            source,
        })?;

    // Dropping the wait future drops the child, which kills it.
    let output = tokio::select! {
        output = child.wait_with_output() => output.map_err(|source| LifecycleError::Spawn {
            program: program.clone(),
            source,
        })?,
        _ = cancel.cancelled() => {
            debug!(workload = %workload_id, %program, "lifecycle command cancelled");
            return Err(LifecycleError::Cancelled);
        }
    };

    if output.status.success() {
        Ok(())
    } else {
        Err(LifecycleError::Failed {
            program: program.clone(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}
