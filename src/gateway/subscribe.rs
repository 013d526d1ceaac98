//! Long-lived event subscriptions.
//!
//! A subscription connects once and then forwards every pushed event to a
//! [`SubscriptionObserver`].  Ordering guarantees: `ready` settles at most
//! once; `on_event` fires zero or more times, only after `ready` resolved;
//! at most one terminal signal follows (`on_close` after a successful
//! connect, or `on_error` plus a rejected `ready` before it).  Dropped
//! connections are not retried here; callers pair the subscription with a
//! [`ReconnectBackoff`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::sync::{oneshot, watch};
use tokio::time::timeout;

use super::error::{GatewayRpcError, SessionFailure};
use super::rpc::{GatewayRpcClient, DEFAULT_TIMEOUT};
use super::session::{CloseInfo, Session};
use super::{ConnectRequest, GatewayClientConfig};
use crate::types::EventFrame;

const CONNECT_METHOD: &str = "connect";

/// Receives subscription callbacks. Runs on the subscription's task, so
/// implementations should return quickly.
pub trait SubscriptionObserver: Send + Sync + 'static {
    fn on_event(&self, event: EventFrame);

    /// The connect handshake failed; `ready` rejects with the same error.
    fn on_error(&self, _error: &GatewayRpcError) {}

    /// The gateway dropped an established subscription.
    fn on_close(&self, _close: CloseInfo) {}
}

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub token: Option<String>,
    pub password: Option<String>,
    pub role: Option<String>,
    pub scopes: Option<Vec<String>>,
    /// Pause between socket open and the first unsolicited `connect`.
    pub connect_delay: Duration,
    /// Upper bound on socket open plus handshake.
    pub connect_timeout: Duration,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            token: None,
            password: None,
            role: None,
            scopes: None,
            connect_delay: Duration::from_millis(250),
            connect_timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Value `ready` resolves with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionReady {
    pub url: String,
}

type ReadyResult = Result<SubscriptionReady, GatewayRpcError>;

/// Cloneable handle that can close a subscription, even from its callbacks.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    close_tx: Arc<watch::Sender<bool>>,
    connected: Arc<AtomicBool>,
}

impl SubscriptionHandle {
    /// Drop the socket without a closing handshake. Idempotent.
    pub fn close(&self) {
        self.close_tx.send_replace(true);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// A running subscription.
#[derive(Debug)]
pub struct Subscription {
    ready: Option<oneshot::Receiver<ReadyResult>>,
    handle: SubscriptionHandle,
}

impl Subscription {
    /// Wait for the initial connect. Settles once; later calls fail.
    pub async fn ready(&mut self) -> ReadyResult {
        let Some(rx) = self.ready.take() else {
            return Err(GatewayRpcError::from_failure(
                SessionFailure::new("subscription readiness already consumed"),
                CONNECT_METHOD,
                1,
            ));
        };
        rx.await.unwrap_or_else(|_| {
            Err(GatewayRpcError::from_failure(
                SessionFailure::new("gateway subscription task ended before connect"),
                CONNECT_METHOD,
                1,
            ))
        })
    }

    pub fn close(&self) {
        self.handle.close();
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }
}

impl GatewayRpcClient {
    /// Open a subscription. Must be called from within a Tokio runtime.
    pub fn subscribe(
        &self,
        observer: Arc<dyn SubscriptionObserver>,
        options: SubscribeOptions,
    ) -> Subscription {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (close_tx, close_rx) = watch::channel(false);
        let handle = SubscriptionHandle {
            close_tx: Arc::new(close_tx),
            connected: Arc::new(AtomicBool::new(false)),
        };

        tokio::spawn(run_subscription(
            self.config().clone(),
            options,
            observer,
            ready_tx,
            close_rx,
            Arc::clone(&handle.connected),
        ));

        Subscription {
            ready: Some(ready_rx),
            handle,
        }
    }
}

async fn run_subscription(
    config: GatewayClientConfig,
    options: SubscribeOptions,
    observer: Arc<dyn SubscriptionObserver>,
    ready_tx: oneshot::Sender<ReadyResult>,
    mut close_rx: watch::Receiver<bool>,
    connected: Arc<AtomicBool>,
) {
    let url = config.url.clone();
    let connect_timeout = options.connect_timeout;
    let connect = async {
        let request = ConnectRequest::load(
            config,
            options.role,
            options.scopes,
            options.token,
            options.password,
            options.connect_delay,
        )
        .await?;
        let mut session = Session::open(&url).await?;
        match session.handshake(&request).await {
            Ok(_) => Ok(session),
            Err(failure) => {
                session.close().await;
                Err(failure)
            }
        }
    };

    let outcome = tokio::select! {
        biased;
        _ = wait_closed(&mut close_rx) => {
            let err = GatewayRpcError::from_failure(
                SessionFailure::new("gateway subscription closed before connect"),
                CONNECT_METHOD,
                1,
            );
            let _ = ready_tx.send(Err(err));
            return;
        }
        result = timeout(connect_timeout, connect) => match result {
            Ok(result) => result,
            Err(_) => Err(SessionFailure::timeout(connect_timeout.as_millis())),
        },
    };

    let mut session = match outcome {
        Ok(session) => session,
        Err(failure) => {
            let err = GatewayRpcError::from_failure(failure, CONNECT_METHOD, 1);
            observer.on_error(&err);
            let _ = ready_tx.send(Err(err));
            return;
        }
    };

    connected.store(true, Ordering::SeqCst);
    info!("Gateway subscription ready on {}", url);
    let _ = ready_tx.send(Ok(SubscriptionReady { url: url.clone() }));

    loop {
        tokio::select! {
            biased;
            _ = wait_closed(&mut close_rx) => {
                connected.store(false, Ordering::SeqCst);
                debug!("Gateway subscription on {} closed by caller", url);
                return;
            }
            next = session.next_event() => match next {
                Ok(event) => observer.on_event(event),
                Err(gone) => {
                    connected.store(false, Ordering::SeqCst);
                    let close = gone.into_close_info();
                    info!(
                        "Gateway subscription on {} closed ({}): {}",
                        url, close.code, close.reason
                    );
                    observer.on_close(close);
                    return;
                }
            },
        }
    }
}

/// Resolves once `close()` was called or every handle was dropped.
async fn wait_closed(close_rx: &mut watch::Receiver<bool>) {
    let _ = close_rx.wait_for(|closed| *closed).await;
}

/// Exponential reconnect delay with a cap, reset after a good connect.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base: Duration,
    max: Duration,
    attempts: u32,
}

impl ReconnectBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempts: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempts.min(16));
        self.attempts = self.attempts.saturating_add(1);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Reconnect attempts since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}
