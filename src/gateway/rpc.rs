//! Single request/response calls with timeout and bounded retry.

use std::time::Duration;

use log::{debug, warn};
use serde_json::Value;
use tokio::time::{sleep, timeout};

use super::error::{GatewayRpcError, SessionFailure};
use super::session::Session;
use super::{connect_stagger, ConnectRequest, GatewayClientConfig};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Per-call knobs. `Default` is a 10s timeout with no retry.
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub timeout: Duration,
    /// Extra attempts after the first; only transport failures are retried.
    pub retries: u32,
    pub retry_delay: Duration,
    pub expect_final: bool,
    pub role: Option<String>,
    pub scopes: Option<Vec<String>>,
    pub token: Option<String>,
    pub password: Option<String>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            retries: 0,
            retry_delay: DEFAULT_RETRY_DELAY,
            expect_final: false,
            role: None,
            scopes: None,
            token: None,
            password: None,
        }
    }
}

/// Gateway client. Every call and subscription opens its own socket.
#[derive(Debug, Clone)]
pub struct GatewayRpcClient {
    config: GatewayClientConfig,
}

impl GatewayRpcClient {
    pub fn new(config: GatewayClientConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GatewayClientConfig {
        &self.config
    }

    /// Call `method` and return the gateway's response payload.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        options: &CallOptions,
    ) -> Result<Value, GatewayRpcError> {
        let max_attempts = options.retries.saturating_add(1);
        let mut attempt = 1;
        loop {
            let failure = match self.attempt(method, &params, options).await {
                Ok(payload) => return Ok(payload),
                Err(failure) => failure,
            };
            let err = GatewayRpcError::from_failure(failure, method, attempt);
            if attempt >= max_attempts || !err.kind().is_retryable() {
                return Err(err);
            }
            warn!(
                "Gateway call '{}' failed on attempt {}/{} ({}: {}), retrying in {:?}",
                method,
                attempt,
                max_attempts,
                err.kind(),
                err,
                options.retry_delay
            );
            sleep(options.retry_delay).await;
            attempt += 1;
        }
    }

    async fn attempt(
        &self,
        method: &str,
        params: &Value,
        options: &CallOptions,
    ) -> Result<Value, SessionFailure> {
        let request = ConnectRequest::load(
            self.config.clone(),
            options.role.clone(),
            options.scopes.clone(),
            options.token.clone(),
            options.password.clone(),
            connect_stagger(options.timeout),
        )
        .await?;
        let round_trip = async {
            let mut session = Session::open(&self.config.url).await?;
            let result = match session.handshake(&request).await {
                Ok(_) => session.call(method, params, options.expect_final).await,
                Err(failure) => Err(failure),
            };
            session.close().await;
            result
        };
        match timeout(options.timeout, round_trip).await {
            Ok(result) => result,
            Err(_) => {
                debug!("Gateway call '{}' timed out", method);
                Err(SessionFailure::timeout(options.timeout.as_millis()))
            }
        }
    }
}
