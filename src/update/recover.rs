//! Executing a [`RecreatePlan`]: recreate, verify, roll back on failure.
//!
//! The same routine runs in-process for upgrades and inside the detached
//! helper container started by `apply`.

use log::{error, info, warn};

use super::plan::RecreatePlan;
use crate::runtime::{DockerCli, DockerError};

/// How a plan ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanOutcome {
    /// The target image is running and verified.
    Running,
    /// The forward step failed and the container was put back on the old image.
    RolledBack { error: String },
    /// Both the forward step and the rollback failed. The container may be stopped.
    RollbackFailed { error: String, rollback_error: String },
    /// The forward step failed and there was nothing to roll back to.
    Failed { error: String },
}

impl PlanOutcome {
    pub fn is_running(&self) -> bool {
        matches!(self, PlanOutcome::Running)
    }

    /// One-line description suitable for an operator.
    pub fn describe(&self) -> String {
        match self {
            PlanOutcome::Running => "running".to_string(),
            PlanOutcome::RolledBack { error } => {
                format!("recreate failed, rolled back: {}", error)
            }
            PlanOutcome::RollbackFailed {
                error,
                rollback_error,
            } => format!(
                "recreate failed: {}; rollback failed: {}",
                error, rollback_error
            ),
            PlanOutcome::Failed { error } => format!("recreate failed: {}", error),
        }
    }
}

/// Remove the existing container, start the replacement, rejoin extra
/// networks and wait until it is stably running.
pub async fn recreate(
    docker: &DockerCli,
    name: &str,
    args: &[String],
    extra_networks: &[String],
) -> Result<(), DockerError> {
    docker.remove(name).await;
    let id = docker.run(args).await?;
    info!("Started {} ({})", name, short_id(&id));
    for network in extra_networks {
        docker.connect_network(network, name).await?;
    }
    docker.wait_running(name).await
}

pub async fn execute_plan(docker: &DockerCli, plan: &RecreatePlan) -> PlanOutcome {
    let name = plan.container_name.as_str();
    let error = match recreate(docker, name, &plan.args, &plan.extra_networks).await {
        Ok(()) => {
            info!("{} is running {}", name, plan.target_image);
            return PlanOutcome::Running;
        }
        Err(e) => e.to_string(),
    };

    let Some(rollback_args) = plan.rollback_args.as_ref() else {
        error!("Recreating {} failed with no rollback available: {}", name, error);
        return PlanOutcome::Failed { error };
    };

    warn!("Recreating {} failed ({}), rolling back", name, error);
    if let Some(image) = plan.rollback_image.as_deref() {
        // The prior image is normally still cached locally.
        if let Err(e) = docker.pull(image).await {
            warn!("Could not refresh {} before rollback: {}", image, e);
        }
    }
    match recreate(docker, name, rollback_args, &plan.rollback_extra_networks).await {
        Ok(()) => {
            info!("Rolled {} back", name);
            PlanOutcome::RolledBack { error }
        }
        Err(e) => {
            error!("Rollback of {} failed: {}", name, e);
            PlanOutcome::RollbackFailed {
                error,
                rollback_error: e.to_string(),
            }
        }
    }
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}
