use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::gateway::{GatewayClientConfig, DEFAULT_ROLE, DEFAULT_SCOPE};
use crate::update::HelperSettings;

pub const ENV_GATEWAY_URL: &str = "OPENCLAW_GATEWAY_URL";
pub const ENV_IDENTITY_PATH: &str = "OPENCLAW_DEVICE_IDENTITY_PATH";
pub const ENV_GATEWAY_TOKEN: &str = "OPENCLAW_GATEWAY_TOKEN";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub openclaw: OpenclawConfig,
    pub runtime: RuntimeConfig,
    pub gateway: GatewayConfig,
    pub updates: UpdatesConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OpenclawConfig {
    /// Gateway's own JSON config; defaults to `<state_dir>/openclaw.json`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_path: Option<PathBuf>,
    pub gateway_port: u16,
    pub state_dir: PathBuf,
}

impl Default for OpenclawConfig {
    fn default() -> Self {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            config_path: None,
            gateway_port: 18789,
            state_dir: home.join(".openclaw"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeMode {
    Systemd,
    Docker,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub mode: RuntimeMode,
    pub container_name: String,
    pub helper_entrypoint: String,
    pub docker_socket: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let helper = HelperSettings::default();
        Self {
            mode: RuntimeMode::Docker,
            container_name: "openclaw".into(),
            helper_entrypoint: helper.entrypoint,
            docker_socket: helper.docker_socket,
        }
    }
}

#[derive(Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewayConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_path: Option<PathBuf>,
    pub role: String,
    pub scopes: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "127.0.0.1".into(),
            token: None,
            password: None,
            identity_path: None,
            role: DEFAULT_ROLE.into(),
            scopes: vec![DEFAULT_SCOPE.into()],
        }
    }
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("url", &self.url)
            .field("host", &self.host)
            .field("token", &redacted(&self.token))
            .field("password", &redacted(&self.password))
            .field("identity_path", &self.identity_path)
            .field("role", &self.role)
            .field("scopes", &self.scopes)
            .finish()
    }
}

#[derive(Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct UpdatesConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub github_token: Option<String>,
}

impl fmt::Debug for UpdatesConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdatesConfig")
            .field("github_token", &redacted(&self.github_token))
            .finish()
    }
}

fn redacted(secret: &Option<String>) -> Option<&'static str> {
    secret.as_ref().map(|_| "<redacted>")
}

/// Port and token read from the gateway's own config file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayFileSettings {
    pub port: Option<u16>,
    pub token: Option<String>,
}

impl GatewayFileSettings {
    /// Missing or unreadable files yield empty settings.
    pub fn read(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                debug!("No gateway config at {}: {}", path.display(), e);
                return Self::default();
            }
        };
        let value: serde_json::Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(e) => {
                debug!("Ignoring unparsable gateway config {}: {}", path.display(), e);
                return Self::default();
            }
        };
        Self {
            port: value
                .pointer("/gateway/port")
                .and_then(serde_json::Value::as_u64)
                .and_then(|p| u16::try_from(p).ok()),
            token: value
                .pointer("/gateway/auth/token")
                .and_then(serde_json::Value::as_str)
                .filter(|t| !t.trim().is_empty())
                .map(str::to_string),
        }
    }
}

impl Config {
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("openclaw-manager.toml"))
            .merge(Json::file("openclaw-manager.json"))
            .merge(Env::prefixed("OPENCLAW_MANAGER_").split("__"))
    }

    pub fn load() -> anyhow::Result<Self> {
        let mut config: Config = Self::figment()
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        config.apply_env_overrides(|key| std::env::var(key).ok());

        // Support Docker-style secrets
        if let Ok(secret_file) = std::env::var("OPENCLAW_GATEWAY_TOKEN_FILE") {
            config.gateway.token = Some(std::fs::read_to_string(secret_file)?.trim().to_string());
        }

        Ok(config)
    }

    /// Apply the gateway URL, identity path and token overrides.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = get(ENV_GATEWAY_URL) {
            self.gateway.url = Some(url.trim().to_string());
        }
        if let Some(path) = get(ENV_IDENTITY_PATH) {
            self.gateway.identity_path = Some(PathBuf::from(path.trim()));
        }
        if let Some(token) = get(ENV_GATEWAY_TOKEN) {
            self.gateway.token = Some(token.trim().to_string());
        }
    }

    pub fn openclaw_config_path(&self) -> PathBuf {
        self.openclaw
            .config_path
            .clone()
            .unwrap_or_else(|| self.openclaw.state_dir.join("openclaw.json"))
    }

    pub fn identity_path(&self) -> PathBuf {
        self.gateway.identity_path.clone().unwrap_or_else(|| {
            self.openclaw
                .state_dir
                .join("identity")
                .join("device.json")
        })
    }

    pub fn helper_settings(&self) -> HelperSettings {
        HelperSettings {
            entrypoint: self.runtime.helper_entrypoint.clone(),
            docker_socket: self.runtime.docker_socket.clone(),
        }
    }

    /// Compose the client config; `url` wins over everything configured.
    pub fn gateway_client_config(&self, url: Option<&str>) -> GatewayClientConfig {
        let file = GatewayFileSettings::read(&self.openclaw_config_path());
        let url = url
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .or_else(|| self.gateway.url.clone())
            .unwrap_or_else(|| {
                let port = file.port.unwrap_or(self.openclaw.gateway_port);
                format!("ws://{}:{}/ws", self.gateway.host, port)
            });

        let mut client = GatewayClientConfig::new(url, self.identity_path());
        client.token = self.gateway.token.clone().or(file.token);
        client.password = self.gateway.password.clone();
        client.role = self.gateway.role.clone();
        if !self.gateway.scopes.is_empty() {
            client.scopes = self.gateway.scopes.clone();
        }
        client
    }
}
