use async_trait::async_trait;
use serde::Serialize;

pub mod docker;
pub mod process;
pub use docker::{DockerCli, DockerError, LifecycleTiming};
pub use process::ProcessRunner;

/// Outcome of one external command. Failures are values, not errors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    pub ok: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Short human-readable summary, best source for error messages.
    pub message: String,
}

impl CommandOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            ok: true,
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
            message: String::new(),
        }
    }

    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        let stderr = stderr.into();
        Self {
            ok: false,
            code: Some(code),
            message: stderr.trim().to_string(),
            stdout: String::new(),
            stderr,
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` to completion and capture its output.
    async fn run(&self, program: &str, args: &[String]) -> CommandOutput;
}
