//! Rebuilding `docker run` arguments from an inspected container.
//!
//! A [`RecreatePlan`] captures everything needed to relaunch a container
//! with a different image and, optionally, to put the previous one back.
//! Plans are built fresh per operation and only serialised to hand them to
//! the detached recovery helper.

use std::collections::BTreeSet;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bollard::models::ContainerInspectResponse;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("plan is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("plan json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Arguments for `docker run` plus networks to join afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSpec {
    pub args: Vec<String>,
    pub extra_networks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecreatePlan {
    pub container_name: String,
    pub target_image: String,
    pub args: Vec<String>,
    #[serde(default)]
    pub extra_networks: Vec<String>,
    #[serde(default)]
    pub rollback_image: Option<String>,
    #[serde(default)]
    pub rollback_args: Option<Vec<String>>,
    #[serde(default)]
    pub rollback_extra_networks: Vec<String>,
}

impl RecreatePlan {
    /// Plan a switch to `target_image`; with `rollback_image`, the rollback
    /// half rebuilds the same snapshot on the old image.
    pub fn from_snapshot(
        detail: &ContainerInspectResponse,
        container_name: &str,
        target_image: &str,
        rollback_image: Option<&str>,
    ) -> Self {
        let forward = build_docker_run_args(detail, container_name, target_image);
        let rollback =
            rollback_image.map(|image| build_docker_run_args(detail, container_name, image));
        Self {
            container_name: container_name.to_string(),
            target_image: target_image.to_string(),
            args: forward.args,
            extra_networks: forward.extra_networks,
            rollback_extra_networks: rollback
                .as_ref()
                .map(|r| r.extra_networks.clone())
                .unwrap_or_default(),
            rollback_args: rollback.map(|r| r.args),
            rollback_image: rollback_image.map(str::to_string),
        }
    }

    pub fn encode(&self) -> Result<String, PlanError> {
        Ok(STANDARD.encode(serde_json::to_vec(self)?))
    }

    pub fn decode(encoded: &str) -> Result<Self, PlanError> {
        let bytes = STANDARD.decode(encoded.trim())?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Reconstruct `docker run -d` arguments for `container_name` on `image`.
///
/// Carries over restart policy, binds, published ports, environment,
/// labels, working directory, user, primary network and command.  Any
/// other networks the container had joined come back as `extra_networks`.
pub fn build_docker_run_args(
    detail: &ContainerInspectResponse,
    container_name: &str,
    image: &str,
) -> RunSpec {
    let mut args: Vec<String> = vec![
        "run".into(),
        "-d".into(),
        "--name".into(),
        container_name.into(),
    ];
    let host = detail.host_config.as_ref();
    let config = detail.config.as_ref();

    if let Some(policy) = host.and_then(|h| h.restart_policy.as_ref()) {
        let name = policy
            .name
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        if !name.is_empty() && name != "no" {
            let value = match policy.maximum_retry_count {
                Some(count) if name == "on-failure" && count > 0 => {
                    format!("on-failure:{}", count)
                }
                _ => name,
            };
            push_pair(&mut args, "--restart", value);
        }
    }

    for bind in host.and_then(|h| h.binds.as_ref()).into_iter().flatten() {
        push_pair(&mut args, "-v", bind.clone());
    }

    if let Some(bindings) = host.and_then(|h| h.port_bindings.as_ref()) {
        let mut container_ports: Vec<&String> = bindings.keys().collect();
        container_ports.sort();
        let mut seen = BTreeSet::new();
        for container_port in container_ports {
            let hosts = bindings
                .get(container_port)
                .and_then(|b| b.as_ref())
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            for binding in hosts {
                let host_port = binding.host_port.as_deref().unwrap_or("");
                let host_ip = binding
                    .host_ip
                    .as_deref()
                    .filter(|ip| !ip.is_empty() && *ip != "0.0.0.0" && *ip != "::");
                let spec = match (host_ip, host_port.is_empty()) {
                    (Some(ip), false) => format!("{}:{}:{}", ip, host_port, container_port),
                    (Some(ip), true) => format!("{}::{}", ip, container_port),
                    (None, false) => format!("{}:{}", host_port, container_port),
                    (None, true) => container_port.clone(),
                };
                if seen.insert(spec.clone()) {
                    push_pair(&mut args, "-p", spec);
                }
            }
        }
    }

    for env in config.and_then(|c| c.env.as_ref()).into_iter().flatten() {
        push_pair(&mut args, "-e", env.clone());
    }

    if let Some(labels) = config.and_then(|c| c.labels.as_ref()) {
        let mut labels: Vec<_> = labels.iter().collect();
        labels.sort();
        for (key, value) in labels {
            push_pair(&mut args, "--label", format!("{}={}", key, value));
        }
    }

    if let Some(dir) = config.and_then(|c| c.working_dir.as_deref()).filter(|d| !d.is_empty()) {
        push_pair(&mut args, "-w", dir.to_string());
    }
    if let Some(user) = config.and_then(|c| c.user.as_deref()).filter(|u| !u.is_empty()) {
        push_pair(&mut args, "-u", user.to_string());
    }

    let networks = network_names(detail);
    let primary = host
        .and_then(|h| h.network_mode.clone())
        .filter(|mode| !mode.is_empty() && mode != "default")
        .or_else(|| networks.first().cloned());
    if let Some(primary) = &primary {
        push_pair(&mut args, "--network", primary.clone());
    }
    let extra_networks = networks
        .into_iter()
        .filter(|n| Some(n) != primary.as_ref())
        .collect();

    args.push(image.to_string());
    args.extend(config.and_then(|c| c.cmd.clone()).unwrap_or_default());

    RunSpec {
        args,
        extra_networks,
    }
}

/// Networks the container is attached to, sorted.
pub fn network_names(detail: &ContainerInspectResponse) -> Vec<String> {
    let mut names: Vec<String> = detail
        .network_settings
        .as_ref()
        .and_then(|s| s.networks.as_ref())
        .map(|n| n.keys().cloned().collect())
        .unwrap_or_default();
    names.sort();
    names
}

fn push_pair(args: &mut Vec<String>, flag: &str, value: String) {
    args.push(flag.to_string());
    args.push(value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(value: serde_json::Value) -> ContainerInspectResponse {
        serde_json::from_value(value).unwrap()
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    fn openclaw_snapshot() -> ContainerInspectResponse {
        snapshot(json!({
            "Name": "/openclaw",
            "RestartCount": 0,
            "Config": {
                "Image": "ghcr.io/openclaw/openclaw:2026.2.14",
                "Env": ["NODE_ENV=production"],
                "Labels": {"b": "2", "a": "1"},
                "WorkingDir": "/app",
                "User": "node",
                "Cmd": ["node", "server.js"]
            },
            "HostConfig": {
                "RestartPolicy": {"Name": "unless-stopped", "MaximumRetryCount": 0},
                "Binds": ["/data:/home/node/.openclaw"],
                "PortBindings": {"18789/tcp": [{"HostIp": "0.0.0.0", "HostPort": "18789"}]},
                "NetworkMode": "net_a"
            },
            "NetworkSettings": {"Networks": {"net_a": {}}}
        }))
    }

    #[test]
    fn rebuilds_run_args_from_snapshot() {
        let spec = build_docker_run_args(&openclaw_snapshot(), "openclaw", "img:new");
        let args = &spec.args;

        assert_eq!(&args[..4], ["run", "-d", "--name", "openclaw"]);
        assert!(has_pair(args, "--restart", "unless-stopped"));
        assert!(has_pair(args, "-v", "/data:/home/node/.openclaw"));
        assert!(has_pair(args, "-p", "18789:18789/tcp"));
        assert!(has_pair(args, "--network", "net_a"));
        assert!(has_pair(args, "-e", "NODE_ENV=production"));
        assert!(has_pair(args, "-w", "/app"));
        assert!(has_pair(args, "-u", "node"));
        assert!(spec.extra_networks.is_empty());

        let labels: Vec<_> = args
            .windows(2)
            .filter(|w| w[0] == "--label")
            .map(|w| w[1].as_str())
            .collect();
        assert_eq!(labels, ["a=1", "b=2"]);

        let image_at = args.iter().position(|a| a == "img:new").unwrap();
        assert_eq!(&args[image_at + 1..], ["node", "server.js"]);
    }

    #[test]
    fn extra_networks_exclude_primary() {
        let detail = snapshot(json!({
            "HostConfig": {"NetworkMode": "default", "PortBindings": {
                "80/tcp": [{"HostIp": "127.0.0.1", "HostPort": "8080"}]
            }},
            "NetworkSettings": {"Networks": {"net_b": {}, "net_a": {}}}
        }));
        let spec = build_docker_run_args(&detail, "c", "img");
        assert!(has_pair(&spec.args, "--network", "net_a"));
        assert!(has_pair(&spec.args, "-p", "127.0.0.1:8080:80/tcp"));
        assert_eq!(spec.extra_networks, vec!["net_b".to_string()]);
        assert!(!spec.args.iter().any(|a| a == "--restart"));
    }

    #[test]
    fn rollback_half_uses_same_snapshot_with_old_image() {
        let detail = openclaw_snapshot();
        let plan = RecreatePlan::from_snapshot(
            &detail,
            "openclaw",
            "ghcr.io/openclaw/openclaw:2026.2.15",
            Some("ghcr.io/openclaw/openclaw:2026.2.14"),
        );
        let expected =
            build_docker_run_args(&detail, "openclaw", "ghcr.io/openclaw/openclaw:2026.2.14");
        assert_eq!(plan.rollback_args.as_ref(), Some(&expected.args));
        assert_ne!(plan.args, expected.args);

        let decoded = RecreatePlan::decode(&plan.encode().unwrap()).unwrap();
        assert_eq!(decoded, plan);
        assert!(RecreatePlan::decode("%%%").is_err());
    }
}
