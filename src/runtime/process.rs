use async_trait::async_trait;
use log::debug;
use tokio::process::Command;

use super::{CommandOutput, CommandRunner};

/// Runs real child processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[String]) -> CommandOutput {
        debug!("Running {} {}", program, args.join(" "));
        match Command::new(program).args(args).output().await {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                let ok = output.status.success();
                let message = if ok {
                    String::new()
                } else if !stderr.trim().is_empty() {
                    stderr.trim().to_string()
                } else {
                    format!("{} exited with {}", program, output.status)
                };
                CommandOutput {
                    ok,
                    code: output.status.code(),
                    stdout,
                    stderr,
                    message,
                }
            }
            Err(e) => CommandOutput {
                ok: false,
                code: None,
                stdout: String::new(),
                stderr: String::new(),
                message: format!("failed to start {}: {}", program, e),
            },
        }
    }
}
