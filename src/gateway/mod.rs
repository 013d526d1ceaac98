//! Client side of the gateway's WebSocket RPC protocol.
//!
//! [`GatewayRpcClient`] performs one request per connection with timeout
//! and bounded retry; [`GatewayRpcClient::subscribe`] keeps a connection
//! open and forwards pushed events.  Both share the handshake in
//! `session`.

use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;

use crate::identity::{self, DeviceIdentity};
use self::error::SessionFailure;

pub mod error;
pub mod rpc;
mod session;
pub mod subscribe;

pub use error::{ErrorKind, GatewayRpcError};
pub use rpc::{CallOptions, GatewayRpcClient};
pub use session::CloseInfo;
pub use subscribe::{
    ReconnectBackoff, SubscribeOptions, Subscription, SubscriptionHandle, SubscriptionObserver,
    SubscriptionReady,
};

/// Protocol revision spoken by this client (sent as both min and max).
pub const PROTOCOL_VERSION: u32 = 3;
pub const DEFAULT_ROLE: &str = "operator";
pub const DEFAULT_SCOPE: &str = "operator.admin";

/// Client descriptor sent in the `connect` params.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: String,
    pub display_name: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
    pub instance_id: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            id: "gateway-client".into(),
            display_name: "OpenClaw Manager".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            platform: std::env::consts::OS.into(),
            mode: "backend".into(),
            instance_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Everything the client needs to reach and authenticate with a gateway.
///
/// Built by the composition root; nothing in this module reads the process
/// environment.
#[derive(Clone)]
pub struct GatewayClientConfig {
    /// `ws://` or `wss://` URL of the gateway's `/ws` endpoint.
    pub url: String,
    /// Bearer token used when a call does not supply one.
    pub token: Option<String>,
    pub password: Option<String>,
    pub identity_path: PathBuf,
    pub client: ClientInfo,
    pub role: String,
    pub scopes: Vec<String>,
}

impl GatewayClientConfig {
    pub fn new(url: impl Into<String>, identity_path: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            token: None,
            password: None,
            identity_path: identity_path.into(),
            client: ClientInfo::default(),
            role: DEFAULT_ROLE.into(),
            scopes: vec![DEFAULT_SCOPE.into()],
        }
    }
}

impl std::fmt::Debug for GatewayClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClientConfig")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("identity_path", &self.identity_path)
            .field("client", &self.client)
            .field("role", &self.role)
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// Fully resolved inputs for one connect handshake.
pub(crate) struct ConnectRequest {
    pub identity: DeviceIdentity,
    pub identity_path: PathBuf,
    pub client: ClientInfo,
    pub role: String,
    pub scopes: Vec<String>,
    pub token: Option<String>,
    pub password: Option<String>,
    pub connect_delay: Duration,
}

impl ConnectRequest {
    /// Load the device identity and settle role, scopes and credentials.
    ///
    /// Token precedence: explicit, then the configured token, then a device
    /// token stored for the role by an earlier pairing.  With none of those
    /// the connect relies on the device signature alone.
    pub fn resolve(
        config: &GatewayClientConfig,
        role: Option<&str>,
        scopes: Option<&[String]>,
        token: Option<&str>,
        password: Option<&str>,
        connect_delay: Duration,
    ) -> Self {
        let identity = identity::shared(&config.identity_path);
        let role = role
            .filter(|r| !r.is_empty())
            .unwrap_or(&config.role)
            .to_string();
        let scopes = scopes
            .map(<[String]>::to_vec)
            .unwrap_or_else(|| config.scopes.clone());
        let token = non_empty(token)
            .or_else(|| non_empty(config.token.as_deref()))
            .or_else(|| {
                identity::load_device_auth_token(
                    &config.identity_path,
                    identity.device_id(),
                    &role,
                )
            });
        let password = non_empty(password).or_else(|| non_empty(config.password.as_deref()));

        Self {
            identity,
            identity_path: config.identity_path.clone(),
            client: config.client.clone(),
            role,
            scopes,
            token,
            password,
            connect_delay,
        }
    }
}

impl ConnectRequest {
    /// [`ConnectRequest::resolve`] on the blocking pool; it touches the disk.
    pub async fn load(
        config: GatewayClientConfig,
        role: Option<String>,
        scopes: Option<Vec<String>>,
        token: Option<String>,
        password: Option<String>,
        connect_delay: Duration,
    ) -> Result<Self, SessionFailure> {
        tokio::task::spawn_blocking(move || {
            Self::resolve(
                &config,
                role.as_deref(),
                scopes.as_deref(),
                token.as_deref(),
                password.as_deref(),
                connect_delay,
            )
        })
        .await
        .map_err(|e| SessionFailure::with_cause("device identity load failed", e))
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Pause before the first `connect`, leaving room for a challenge push.
pub(crate) fn connect_stagger(timeout: Duration) -> Duration {
    let cap = (timeout / 10).min(Duration::from_millis(750));
    let cap_ms = cap.as_millis() as u64;
    if cap_ms < 2 {
        return cap;
    }
    Duration::from_millis(rand::thread_rng().gen_range(cap_ms / 2..=cap_ms))
}
