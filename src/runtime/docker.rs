use std::sync::Arc;
use std::time::Duration;

use bollard::models::{ContainerInspectResponse, ContainerStateStatusEnum};
use log::{debug, info, warn};
use thiserror::Error;
use tokio::time::sleep;

use super::{CommandOutput, CommandRunner};

/// Poll and retry pacing for container operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleTiming {
    /// How many times `wait_running` samples the container state.
    pub verify_attempts: u32,
    pub verify_interval: Duration,
    pub pull_attempts: u32,
    /// Pull retry `n` waits `n * pull_backoff_unit`.
    pub pull_backoff_unit: Duration,
}

impl Default for LifecycleTiming {
    fn default() -> Self {
        Self {
            verify_attempts: 10,
            verify_interval: Duration::from_secs(1),
            pull_attempts: 3,
            pull_backoff_unit: Duration::from_secs(1),
        }
    }
}

impl LifecycleTiming {
    /// No waiting at all; for tests and dry runs.
    pub fn immediate() -> Self {
        Self {
            verify_interval: Duration::ZERO,
            pull_backoff_unit: Duration::ZERO,
            ..Self::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum DockerError {
    #[error("container {0} not found")]
    NotFound(String),

    #[error("could not parse docker inspect output for {name}: {source}")]
    Parse {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("docker {action} failed: {message}")]
    Command {
        action: &'static str,
        message: String,
    },

    #[error("container {name} did not stay running (last state: {state})")]
    NotRunning { name: String, state: String },
}

/// Drives the `docker` CLI through a [`CommandRunner`].
#[derive(Clone)]
pub struct DockerCli {
    runner: Arc<dyn CommandRunner>,
    program: String,
    timing: LifecycleTiming,
}

impl DockerCli {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            program: "docker".into(),
            timing: LifecycleTiming::default(),
        }
    }

    pub fn with_timing(mut self, timing: LifecycleTiming) -> Self {
        self.timing = timing;
        self
    }

    async fn docker(&self, args: &[String]) -> CommandOutput {
        self.runner.run(&self.program, args).await
    }

    /// `docker inspect`, decoded into the engine's own response model.
    pub async fn inspect(&self, name: &str) -> Result<ContainerInspectResponse, DockerError> {
        let out = self.docker(&["inspect".into(), name.into()]).await;
        if !out.ok {
            let message = failure_text(&out);
            if message.to_ascii_lowercase().contains("no such") {
                return Err(DockerError::NotFound(name.to_string()));
            }
            return Err(DockerError::Command {
                action: "inspect",
                message,
            });
        }
        let mut details: Vec<ContainerInspectResponse> = serde_json::from_str(out.stdout.trim())
            .map_err(|source| DockerError::Parse {
                name: name.to_string(),
                source,
            })?;
        if details.is_empty() {
            return Err(DockerError::NotFound(name.to_string()));
        }
        Ok(details.swap_remove(0))
    }

    /// Pull with linear backoff between attempts.
    pub async fn pull(&self, image: &str) -> Result<(), DockerError> {
        let attempts = self.timing.pull_attempts.max(1);
        let mut last = String::new();
        for attempt in 1..=attempts {
            let out = self.docker(&["pull".into(), image.into()]).await;
            if out.ok {
                info!("Pulled {}", image);
                return Ok(());
            }
            last = failure_text(&out);
            warn!(
                "Pull of {} failed (attempt {}/{}): {}",
                image, attempt, attempts, last
            );
            if attempt < attempts {
                sleep(self.timing.pull_backoff_unit * attempt).await;
            }
        }
        Err(DockerError::Command {
            action: "pull",
            message: last,
        })
    }

    /// Stop and remove; a missing container is not an error.
    pub async fn remove(&self, name: &str) {
        let stop = self.docker(&["stop".into(), name.into()]).await;
        if !stop.ok {
            debug!("docker stop {}: {}", name, failure_text(&stop));
        }
        let rm = self.docker(&["rm".into(), "-f".into(), name.into()]).await;
        if !rm.ok {
            debug!("docker rm {}: {}", name, failure_text(&rm));
        }
    }

    /// Create and start a container; `args` start with `run`.
    pub async fn run(&self, args: &[String]) -> Result<String, DockerError> {
        let out = self.docker(args).await;
        if !out.ok {
            return Err(DockerError::Command {
                action: "run",
                message: failure_text(&out),
            });
        }
        Ok(out.stdout.trim().to_string())
    }

    /// Join an extra network; already being a member counts as success.
    pub async fn connect_network(&self, network: &str, name: &str) -> Result<(), DockerError> {
        let out = self
            .docker(&["network".into(), "connect".into(), network.into(), name.into()])
            .await;
        if out.ok {
            return Ok(());
        }
        let message = failure_text(&out);
        let lower = message.to_ascii_lowercase();
        if lower.contains("already exists") || lower.contains("already connected") {
            debug!("{} is already on network {}", name, network);
            return Ok(());
        }
        Err(DockerError::Command {
            action: "network connect",
            message,
        })
    }

    /// Wait until the container is seen running on two consecutive samples
    /// with an unchanged (or unreported) restart count.
    pub async fn wait_running(&self, name: &str) -> Result<(), DockerError> {
        let mut stable_samples = 0u32;
        let mut last_restarts: Option<i64> = None;
        let mut last_state = String::from("unknown");

        for sample in 0..self.timing.verify_attempts {
            if sample > 0 {
                sleep(self.timing.verify_interval).await;
            }
            let detail = match self.inspect(name).await {
                Ok(detail) => detail,
                Err(e) => {
                    stable_samples = 0;
                    last_state = e.to_string();
                    continue;
                }
            };
            last_state = state_label(&detail);
            if !is_running(&detail) {
                stable_samples = 0;
                continue;
            }
            let restarts = detail.restart_count;
            if stable_samples > 0 && (restarts.is_none() || restarts == last_restarts) {
                stable_samples += 1;
            } else {
                stable_samples = 1;
            }
            last_restarts = restarts;
            if stable_samples >= 2 {
                return Ok(());
            }
        }
        Err(DockerError::NotRunning {
            name: name.to_string(),
            state: last_state,
        })
    }
}

/// Image reference the container was created from (not the image id).
pub fn configured_image(detail: &ContainerInspectResponse) -> Option<String> {
    detail
        .config
        .as_ref()
        .and_then(|c| c.image.clone())
        .filter(|image| !image.is_empty())
}

pub fn is_running(detail: &ContainerInspectResponse) -> bool {
    match detail.state.as_ref() {
        Some(state) => matches!(state.status, Some(ContainerStateStatusEnum::RUNNING)),
        None => false,
    }
}

fn state_label(detail: &ContainerInspectResponse) -> String {
    detail
        .state
        .as_ref()
        .and_then(|s| s.status.as_ref())
        .map(ToString::to_string)
        .unwrap_or_else(|| "unknown".to_string())
}

fn failure_text(out: &CommandOutput) -> String {
    if !out.message.trim().is_empty() {
        out.message.trim().to_string()
    } else if !out.stderr.trim().is_empty() {
        out.stderr.trim().to_string()
    } else {
        match out.code {
            Some(code) => format!("exit code {}", code),
            None => "command failed".to_string(),
        }
    }
}
