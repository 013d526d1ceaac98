//! OpenClaw manager entry point.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use serde::Serialize;
use tokio::signal;
use tokio::sync::mpsc;

use openclaw_manager::config::{Config, RuntimeMode};
use openclaw_manager::gateway::{
    CallOptions, CloseInfo, GatewayRpcClient, ReconnectBackoff, SubscribeOptions,
    SubscriptionObserver,
};
use openclaw_manager::identity;
use openclaw_manager::runtime::{DockerCli, ProcessRunner};
use openclaw_manager::types::EventFrame;
use openclaw_manager::update::{
    execute_plan, ImageLifecycleManager, LifecycleOutcome, RecreatePlan, ReqwestFetch,
};

#[derive(Debug, Parser)]
#[command(name = "openclaw-manager", version, about = "Manage an OpenClaw gateway")]
struct Cli {
    /// Gateway WebSocket URL, overriding configuration.
    #[arg(long, global = true)]
    url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show (creating if needed) the device identity.
    Identity,
    /// Call a gateway RPC method.
    Call {
        method: String,
        /// JSON object passed as params.
        #[arg(long, default_value = "{}")]
        params: String,
        #[arg(long, default_value_t = 10_000)]
        timeout_ms: u64,
        #[arg(long, default_value_t = 0)]
        retries: u32,
        #[arg(long, default_value_t = 1_000)]
        retry_delay_ms: u64,
        /// Keep waiting past an `accepted` acknowledgement.
        #[arg(long)]
        expect_final: bool,
    },
    /// Print gateway events until interrupted, reconnecting on drops.
    Watch,
    /// Compare the running image with the newest release.
    CheckUpdates,
    /// Pull a tag of the current image without recreating.
    Pull { tag: String },
    /// Recreate the container on a new tag, rolling back on failure.
    Upgrade { tag: String },
    /// Recreate the container on an explicit image.
    Rollback { image: String },
    /// Pull a tag, then let a detached helper container do the swap.
    Apply { tag: String },
    /// Execute an encoded recreate plan (run inside the helper container).
    Recover {
        #[arg(long)]
        plan: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    env_logger::init();

    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let cfg = Config::load()?;
    info!("Starting OpenClaw manager with config: {:?}", cfg);

    match cli.command {
        Command::Identity => {
            let path = cfg.identity_path();
            let identity = identity::load_or_create(&path);
            print_json(&serde_json::json!({
                "deviceId": identity.device_id(),
                "publicKey": identity.public_key_base64url(),
                "createdAt": identity.created_at(),
                "path": path,
            }))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Call {
            method,
            params,
            timeout_ms,
            retries,
            retry_delay_ms,
            expect_final,
        } => {
            let params: serde_json::Value =
                serde_json::from_str(&params).context("--params must be JSON")?;
            let client = GatewayRpcClient::new(cfg.gateway_client_config(cli.url.as_deref()));
            let options = CallOptions {
                timeout: Duration::from_millis(timeout_ms),
                retries,
                retry_delay: Duration::from_millis(retry_delay_ms),
                expect_final,
                ..CallOptions::default()
            };
            match client.call(&method, params, &options).await {
                Ok(payload) => {
                    print_json(&payload)?;
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    print_json(&e.to_json())?;
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Command::Watch => {
            let client = GatewayRpcClient::new(cfg.gateway_client_config(cli.url.as_deref()));
            watch(client).await;
            Ok(ExitCode::SUCCESS)
        }
        Command::CheckUpdates => {
            let manager = lifecycle_manager(&cfg)?;
            let fetch = ReqwestFetch::new(Duration::from_secs(15))?;
            let check = manager
                .check_for_updates(&fetch, cfg.updates.github_token.as_deref())
                .await?;
            print_json(&check)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Pull { tag } => report(lifecycle_manager(&cfg)?.pull_only(&tag).await),
        Command::Upgrade { tag } => report(lifecycle_manager(&cfg)?.upgrade_to_tag(&tag).await),
        Command::Rollback { image } => report(lifecycle_manager(&cfg)?.rollback_to(&image).await),
        Command::Apply { tag } => report(lifecycle_manager(&cfg)?.apply_with_helper(&tag).await),
        Command::Recover { plan } => {
            let plan = RecreatePlan::decode(&plan)?;
            let docker = DockerCli::new(Arc::new(ProcessRunner));
            let outcome = execute_plan(&docker, &plan).await;
            println!("{}", outcome.describe());
            Ok(if outcome.is_running() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

fn lifecycle_manager(cfg: &Config) -> anyhow::Result<ImageLifecycleManager> {
    if cfg.runtime.mode != RuntimeMode::Docker {
        anyhow::bail!("image lifecycle commands need runtime.mode = \"docker\"");
    }
    let docker = DockerCli::new(Arc::new(ProcessRunner));
    Ok(ImageLifecycleManager::new(docker, cfg.runtime.container_name.clone())
        .with_helper(cfg.helper_settings()))
}

fn report(outcome: LifecycleOutcome) -> anyhow::Result<ExitCode> {
    print_json(&outcome)?;
    Ok(if outcome.ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Prints events as JSON lines and reports drops to the watch loop.
struct PrintEvents {
    closed: mpsc::UnboundedSender<CloseInfo>,
}

impl SubscriptionObserver for PrintEvents {
    fn on_event(&self, event: EventFrame) {
        match serde_json::to_string(&event) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!("Could not render event {}: {}", event.event, e),
        }
    }

    fn on_close(&self, close: CloseInfo) {
        let _ = self.closed.send(close);
    }
}

async fn watch(client: GatewayRpcClient) {
    let mut backoff = ReconnectBackoff::default();
    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
    let observer = Arc::new(PrintEvents { closed: closed_tx });

    loop {
        let mut subscription = client.subscribe(observer.clone(), SubscribeOptions::default());
        let connected = tokio::select! {
            ready = subscription.ready() => ready,
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                subscription.close();
                return;
            }
        };

        match connected {
            Ok(ready) => {
                info!("Watching {}", ready.url);
                backoff.reset();
                tokio::select! {
                    close = closed_rx.recv() => {
                        if let Some(close) = close {
                            warn!("Gateway closed the subscription ({}): {}", close.code, close.reason);
                        }
                    }
                    _ = signal::ctrl_c() => {
                        info!("Received Ctrl+C, shutting down...");
                        subscription.close();
                        return;
                    }
                }
            }
            Err(e) => warn!("Subscription failed ({}): {}", e.kind(), e),
        }

        let delay = backoff.next_delay();
        info!("Reconnecting in {:?} (attempt {})", delay, backoff.attempts());
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                return;
            }
        }
    }
}
