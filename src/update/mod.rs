//! Image lifecycle for the managed gateway container.
//!
//! Every operation reports a [`LifecycleOutcome`] rather than an error so
//! callers can tell "failed but restored" from "failed and left broken".

use bollard::models::ContainerInspectResponse;
use log::{info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::runtime::docker::configured_image;
use crate::runtime::{DockerCli, DockerError};

pub mod plan;
pub mod recover;
pub mod reference;
pub mod releases;
pub mod version;

pub use plan::{build_docker_run_args, RecreatePlan, RunSpec};
pub use recover::{execute_plan, PlanOutcome};
pub use reference::ImageRef;
pub use releases::{HttpFetch, ReqwestFetch, UpdateCheck};

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error(transparent)]
    Docker(#[from] DockerError),

    #[error(transparent)]
    Release(#[from] releases::ReleaseError),

    #[error("container {0} has no image reference")]
    NoImage(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Upgrade,
    Rollback,
    Pull,
    Apply,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleOutcome {
    pub ok: bool,
    pub action: Action,
    pub message: String,
    pub rolled_back: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback_error: Option<String>,
}

impl LifecycleOutcome {
    fn new(action: Action, ok: bool, message: impl Into<String>) -> Self {
        Self {
            ok,
            action,
            message: message.into(),
            rolled_back: false,
            previous_image: None,
            target_image: None,
            rollback_error: None,
        }
    }

    fn images(mut self, previous: Option<&str>, target: Option<&str>) -> Self {
        self.previous_image = previous.map(str::to_string);
        self.target_image = target.map(str::to_string);
        self
    }
}

/// Settings for the detached recovery helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperSettings {
    /// Executable inside the image that understands `recover --plan`.
    pub entrypoint: String,
    pub docker_socket: String,
}

impl Default for HelperSettings {
    fn default() -> Self {
        Self {
            entrypoint: "openclaw-manager".into(),
            docker_socket: "/var/run/docker.sock".into(),
        }
    }
}

/// Docker tag grammar: `[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}`.
pub fn is_valid_tag(tag: &str) -> bool {
    let mut chars = tag.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() || c == '_' => {}
        _ => return false,
    }
    tag.len() <= 128 && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

pub struct ImageLifecycleManager {
    docker: DockerCli,
    container_name: String,
    helper: HelperSettings,
}

impl ImageLifecycleManager {
    pub fn new(docker: DockerCli, container_name: impl Into<String>) -> Self {
        Self {
            docker,
            container_name: container_name.into(),
            helper: HelperSettings::default(),
        }
    }

    pub fn with_helper(mut self, helper: HelperSettings) -> Self {
        self.helper = helper;
        self
    }

    /// Current image reference of the managed container.
    pub async fn current_image(&self) -> Result<String, UpdateError> {
        let detail = self.docker.inspect(&self.container_name).await?;
        configured_image(&detail).ok_or_else(|| UpdateError::NoImage(self.container_name.clone()))
    }

    /// Switch to `tag` of the current repository, rolling back on failure.
    pub async fn upgrade_to_tag(&self, tag: &str) -> LifecycleOutcome {
        let (detail, current) = match self.snapshot(Action::Upgrade).await {
            Ok(found) => found,
            Err(outcome) => return outcome,
        };
        let target = match self.target_for_tag(Action::Upgrade, tag, current.as_deref()) {
            Ok(target) => target,
            Err(outcome) => return outcome,
        };
        self.replace(Action::Upgrade, &detail, current.as_deref(), &target)
            .await
    }

    /// Switch to an explicit image reference, rolling back on failure.
    pub async fn rollback_to(&self, image: &str) -> LifecycleOutcome {
        let image = image.trim();
        if ImageRef::parse(image).is_none() {
            return LifecycleOutcome::new(
                Action::Rollback,
                false,
                format!("invalid image reference '{}'", image),
            );
        }
        let (detail, current) = match self.snapshot(Action::Rollback).await {
            Ok(found) => found,
            Err(outcome) => return outcome,
        };
        self.replace(Action::Rollback, &detail, current.as_deref(), image)
            .await
    }

    /// Fetch `tag` without touching the container.
    pub async fn pull_only(&self, tag: &str) -> LifecycleOutcome {
        let (_, current) = match self.snapshot(Action::Pull).await {
            Ok(found) => found,
            Err(outcome) => return outcome,
        };
        let target = match self.target_for_tag(Action::Pull, tag, current.as_deref()) {
            Ok(target) => target,
            Err(outcome) => return outcome,
        };
        let outcome = match self.docker.pull(&target).await {
            Ok(()) => LifecycleOutcome::new(Action::Pull, true, format!("pulled {}", target)),
            Err(e) => LifecycleOutcome::new(Action::Pull, false, e.to_string()),
        };
        outcome.images(current.as_deref(), Some(&target))
    }

    /// Pull `tag`, then hand recreate and rollback to a detached helper
    /// container so the swap survives this process being replaced.
    pub async fn apply_with_helper(&self, tag: &str) -> LifecycleOutcome {
        let (detail, current) = match self.snapshot(Action::Apply).await {
            Ok(found) => found,
            Err(outcome) => return outcome,
        };
        let target = match self.target_for_tag(Action::Apply, tag, current.as_deref()) {
            Ok(target) => target,
            Err(outcome) => return outcome,
        };
        if let Err(e) = self.docker.pull(&target).await {
            return LifecycleOutcome::new(Action::Apply, false, e.to_string())
                .images(current.as_deref(), Some(&target));
        }

        let plan =
            RecreatePlan::from_snapshot(&detail, &self.container_name, &target, current.as_deref());
        let encoded = match plan.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                return LifecycleOutcome::new(Action::Apply, false, e.to_string())
                    .images(current.as_deref(), Some(&target))
            }
        };
        let helper_image = current.as_deref().unwrap_or(&target);
        let args = self.helper_args(helper_image, &encoded);
        let outcome = match self.docker.run(&args).await {
            Ok(id) => {
                info!("Recovery helper {} started from {}", id, helper_image);
                LifecycleOutcome::new(Action::Apply, true, format!("helper started: {}", id))
            }
            Err(e) => LifecycleOutcome::new(Action::Apply, false, e.to_string()),
        };
        outcome.images(current.as_deref(), Some(&target))
    }

    pub async fn check_for_updates(
        &self,
        fetch: &dyn HttpFetch,
        token: Option<&str>,
    ) -> Result<UpdateCheck, UpdateError> {
        let image = self.current_image().await?;
        Ok(releases::check_image_for_updates(fetch, &image, token).await?)
    }

    fn helper_args(&self, image: &str, encoded_plan: &str) -> Vec<String> {
        let socket = &self.helper.docker_socket;
        vec![
            "run".to_string(),
            "-d".to_string(),
            "--rm".to_string(),
            "-v".to_string(),
            format!("{}:{}", socket, socket),
            "--entrypoint".to_string(),
            self.helper.entrypoint.clone(),
            image.to_string(),
            "recover".to_string(),
            "--plan".to_string(),
            encoded_plan.to_string(),
        ]
    }

    async fn snapshot(
        &self,
        action: Action,
    ) -> Result<(ContainerInspectResponse, Option<String>), LifecycleOutcome> {
        match self.docker.inspect(&self.container_name).await {
            Ok(detail) => {
                let current = configured_image(&detail);
                Ok((detail, current))
            }
            Err(e) => Err(LifecycleOutcome::new(action, false, e.to_string())),
        }
    }

    fn target_for_tag(
        &self,
        action: Action,
        tag: &str,
        current: Option<&str>,
    ) -> Result<String, LifecycleOutcome> {
        let tag = tag.trim();
        if !is_valid_tag(tag) {
            return Err(LifecycleOutcome::new(
                action,
                false,
                format!("invalid tag '{}'", tag),
            ));
        }
        current
            .and_then(ImageRef::parse)
            .map(|r| r.with_tag(tag))
            .ok_or_else(|| {
                LifecycleOutcome::new(
                    action,
                    false,
                    format!("cannot resolve current image of {}", self.container_name),
                )
            })
    }

    /// Pull, recreate and verify, rolling back to `current` on failure.
    async fn replace(
        &self,
        action: Action,
        detail: &ContainerInspectResponse,
        current: Option<&str>,
        target: &str,
    ) -> LifecycleOutcome {
        if let Err(e) = self.docker.pull(target).await {
            warn!("Not touching {}: {}", self.container_name, e);
            return LifecycleOutcome::new(action, false, e.to_string())
                .images(current, Some(target));
        }

        let plan = RecreatePlan::from_snapshot(detail, &self.container_name, target, current);
        let result = execute_plan(&self.docker, &plan).await;
        let mut outcome = LifecycleOutcome::new(action, result.is_running(), result.describe())
            .images(current, Some(target));
        match result {
            PlanOutcome::Running => {
                outcome.message = format!("{} is running {}", self.container_name, target);
            }
            PlanOutcome::RolledBack { .. } => outcome.rolled_back = true,
            PlanOutcome::RollbackFailed { rollback_error, .. } => {
                outcome.rollback_error = Some(rollback_error)
            }
            PlanOutcome::Failed { .. } => {}
        }
        outcome
    }
}
