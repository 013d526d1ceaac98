//! One WebSocket connection to the gateway.
//!
//! ```text
//! CONNECTING --(stagger or challenge)--> CONNECT_SENT --ok--> CONNECTED
//! CONNECTED --request--> RPC_SENT --final response--> DONE
//! CONNECTED --(subscriber)--> streaming events until close
//! ```
//!
//! A challenge nonce that arrives before the connect is acknowledged
//! supersedes the pending connect: a new, nonce-bearing (`v2`) connect is
//! sent and only its response is honoured.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::error::SessionFailure;
use super::{ConnectRequest, PROTOCOL_VERSION};
use crate::identity;
use crate::types::{EventFrame, InboundFrame, RequestFrame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CLOSE_GRACE: Duration = Duration::from_millis(500);
const ABNORMAL_CLOSE: u16 = 1006;

/// Close code and reason reported when the gateway drops a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    pub(crate) fn into_failure(self) -> SessionFailure {
        let message = if self.reason.is_empty() {
            format!("gateway closed ({})", self.code)
        } else {
            format!("gateway closed ({}): {}", self.code, self.reason)
        };
        let details = json!({"code": self.code, "reason": self.reason});
        SessionFailure::new(message).with_details(details)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    ConnectSent,
    Connected,
    RpcSent,
    Done,
}

/// Result of reading from the socket.
pub(crate) enum Incoming {
    Frame(InboundFrame),
    Closed(CloseInfo),
    Failed(SessionFailure),
}

impl Incoming {
    /// How a connection that is going away should be reported.
    pub fn into_close_info(self) -> CloseInfo {
        match self {
            Incoming::Closed(info) => info,
            Incoming::Failed(failure) => CloseInfo {
                code: ABNORMAL_CLOSE,
                reason: failure.message,
            },
            Incoming::Frame(_) => CloseInfo {
                code: ABNORMAL_CLOSE,
                reason: String::new(),
            },
        }
    }
}

pub(crate) struct Session {
    sink: SplitSink<WsStream, Message>,
    source: SplitStream<WsStream>,
    phase: Phase,
    /// Id of the single connect request whose response we will accept.
    pending_connect: Option<String>,
}

impl Session {
    pub async fn open(url: &str) -> Result<Self, SessionFailure> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| SessionFailure::with_cause(format!("gateway connect error: {}", e), e))?;
        let (sink, source) = stream.split();
        Ok(Self {
            sink,
            source,
            phase: Phase::Connecting,
            pending_connect: None,
        })
    }

    /// Run the connect handshake; returns the gateway's hello payload.
    pub async fn handshake(&mut self, req: &ConnectRequest) -> Result<Value, SessionFailure> {
        let stagger = sleep(req.connect_delay);
        tokio::pin!(stagger);

        loop {
            tokio::select! {
                _ = &mut stagger, if self.phase == Phase::Connecting => {
                    self.send_connect(req, None).await?;
                }
                incoming = self.recv() => match incoming {
                    Incoming::Frame(InboundFrame::Event(event)) => {
                        match event.challenge_nonce() {
                            Some(nonce) => {
                                debug!("Gateway challenge received, sending signed connect");
                                let nonce = nonce.to_string();
                                self.send_connect(req, Some(nonce)).await?;
                            }
                            None => debug!("Ignoring '{}' event before connect", event.event),
                        }
                    }
                    Incoming::Frame(InboundFrame::Response(res)) => {
                        if self.pending_connect.as_deref() != Some(res.id.as_str()) {
                            debug!("Ignoring response to superseded request {}", res.id);
                            continue;
                        }
                        self.pending_connect = None;
                        if !res.ok {
                            self.phase = Phase::Done;
                            return Err(SessionFailure::remote("gateway connect failed", res.error));
                        }
                        self.phase = Phase::Connected;
                        remember_device_token(req, &res.payload).await;
                        return Ok(res.payload);
                    }
                    Incoming::Frame(InboundFrame::Other) => {}
                    Incoming::Closed(info) => {
                        self.phase = Phase::Done;
                        return Err(info.into_failure());
                    }
                    Incoming::Failed(failure) => {
                        self.phase = Phase::Done;
                        return Err(failure);
                    }
                }
            }
        }
    }

    /// Send one request on a connected session and wait for its final answer.
    ///
    /// With `expect_final`, an `ok` response whose payload status is
    /// `accepted` is only an acknowledgement; the call keeps waiting for a
    /// later response with the same id.
    pub async fn call(
        &mut self,
        method: &str,
        params: &Value,
        expect_final: bool,
    ) -> Result<Value, SessionFailure> {
        debug_assert_eq!(self.phase, Phase::Connected);
        let id = uuid::Uuid::new_v4().to_string();
        self.send_request(&id, method, params).await?;
        self.phase = Phase::RpcSent;

        loop {
            match self.recv().await {
                Incoming::Frame(InboundFrame::Response(res)) if res.id == id => {
                    if !res.ok {
                        self.phase = Phase::Done;
                        return Err(SessionFailure::remote("gateway request failed", res.error));
                    }
                    let status = res.payload.get("status").and_then(Value::as_str);
                    if expect_final && status == Some("accepted") {
                        debug!("Request {} accepted, waiting for final response", id);
                        continue;
                    }
                    self.phase = Phase::Done;
                    return Ok(res.payload);
                }
                Incoming::Frame(_) => {}
                Incoming::Closed(info) => {
                    self.phase = Phase::Done;
                    return Err(info.into_failure());
                }
                Incoming::Failed(failure) => {
                    self.phase = Phase::Done;
                    return Err(failure);
                }
            }
        }
    }

    /// Next event frame on a connected session; `Err` once it is gone.
    pub async fn next_event(&mut self) -> Result<EventFrame, Incoming> {
        loop {
            match self.recv().await {
                Incoming::Frame(InboundFrame::Event(event)) => return Ok(event),
                Incoming::Frame(_) => {}
                other => {
                    self.phase = Phase::Done;
                    return Err(other);
                }
            }
        }
    }

    /// Best-effort close frame; never waits for the peer.
    pub async fn close(mut self) {
        self.phase = Phase::Done;
        let _ = tokio::time::timeout(CLOSE_GRACE, self.sink.close()).await;
    }

    async fn recv(&mut self) -> Incoming {
        loop {
            let message = match self.source.next().await {
                None => {
                    return Incoming::Closed(CloseInfo {
                        code: ABNORMAL_CLOSE,
                        reason: String::new(),
                    })
                }
                Some(Err(e)) => {
                    return Incoming::Failed(SessionFailure::with_cause(
                        format!("gateway socket error: {}", e),
                        e,
                    ))
                }
                Some(Ok(message)) => message,
            };
            let text = match message {
                Message::Text(text) => text,
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(e) => {
                        return Incoming::Failed(SessionFailure::with_cause(
                            "gateway frame parse error: binary frame is not UTF-8",
                            e,
                        ))
                    }
                },
                Message::Close(frame) => {
                    let info = match frame {
                        Some(frame) => CloseInfo {
                            code: u16::from(frame.code),
                            reason: frame.reason.to_string(),
                        },
                        None => CloseInfo {
                            code: ABNORMAL_CLOSE,
                            reason: String::new(),
                        },
                    };
                    return Incoming::Closed(info);
                }
                _ => continue,
            };
            return match InboundFrame::parse(&text) {
                Ok(frame) => Incoming::Frame(frame),
                Err(e) => Incoming::Failed(SessionFailure::with_cause(
                    format!("gateway frame parse error: {}", e),
                    e,
                )),
            };
        }
    }

    async fn send_connect(
        &mut self,
        req: &ConnectRequest,
        nonce: Option<String>,
    ) -> Result<(), SessionFailure> {
        let id = uuid::Uuid::new_v4().to_string();
        let params = connect_params(req, nonce.as_deref(), now_ms());
        self.send_request(&id, "connect", &params).await?;
        if let Some(previous) = self.pending_connect.replace(id) {
            debug!("Connect {} superseded by challenge response", previous);
        }
        self.phase = Phase::ConnectSent;
        Ok(())
    }

    async fn send_request(
        &mut self,
        id: &str,
        method: &str,
        params: &Value,
    ) -> Result<(), SessionFailure> {
        let text = serde_json::to_string(&RequestFrame::new(id, method, params))
            .map_err(|e| SessionFailure::with_cause("gateway request json encode failed", e))?;
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| SessionFailure::with_cause(format!("gateway socket send failed: {}", e), e))
    }
}

/// Fields covered by the device signature.
pub(crate) struct DeviceAuthPayload<'a> {
    pub device_id: &'a str,
    pub client_id: &'a str,
    pub client_mode: &'a str,
    pub role: &'a str,
    pub scopes: &'a [String],
    pub signed_at_ms: u64,
    pub token: Option<&'a str>,
    pub nonce: Option<&'a str>,
}

impl DeviceAuthPayload<'_> {
    /// Pipe-joined string that gets signed: `v1` without a nonce, `v2` with.
    pub fn canonical(&self) -> String {
        let version = if self.nonce.is_some() { "v2" } else { "v1" };
        let signed_at = self.signed_at_ms.to_string();
        let scopes = self.scopes.join(",");
        let mut parts = vec![
            version,
            self.device_id,
            self.client_id,
            self.client_mode,
            self.role,
            scopes.as_str(),
            signed_at.as_str(),
            self.token.unwrap_or(""),
        ];
        if let Some(nonce) = self.nonce {
            parts.push(nonce);
        }
        parts.join("|")
    }
}

pub(crate) fn connect_params(req: &ConnectRequest, nonce: Option<&str>, signed_at_ms: u64) -> Value {
    let payload = DeviceAuthPayload {
        device_id: req.identity.device_id(),
        client_id: &req.client.id,
        client_mode: &req.client.mode,
        role: &req.role,
        scopes: &req.scopes,
        signed_at_ms,
        token: req.token.as_deref(),
        nonce,
    };
    let mut device = json!({
        "id": req.identity.device_id(),
        "publicKey": req.identity.public_key_base64url(),
        "signature": req.identity.sign(&payload.canonical()),
        "signedAt": signed_at_ms,
    });
    if let Some(nonce) = nonce {
        device["nonce"] = Value::String(nonce.to_string());
    }

    let mut params = json!({
        "minProtocol": PROTOCOL_VERSION,
        "maxProtocol": PROTOCOL_VERSION,
        "client": req.client,
        "caps": [],
        "role": req.role,
        "scopes": req.scopes,
        "device": device,
    });
    let mut auth = serde_json::Map::new();
    if let Some(token) = &req.token {
        auth.insert("token".into(), Value::String(token.clone()));
    }
    if let Some(password) = &req.password {
        auth.insert("password".into(), Value::String(password.clone()));
    }
    if !auth.is_empty() {
        params["auth"] = Value::Object(auth);
    }
    params
}

/// Persist a device token the gateway issued in its hello payload.
async fn remember_device_token(req: &ConnectRequest, hello: &Value) {
    let Some(auth) = hello.get("auth") else {
        return;
    };
    let Some(token) = auth.get("deviceToken").and_then(Value::as_str) else {
        return;
    };
    let role = auth
        .get("role")
        .and_then(Value::as_str)
        .unwrap_or(&req.role);
    let scopes: Vec<String> = auth
        .get("scopes")
        .and_then(Value::as_array)
        .map(|s| s.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_else(|| req.scopes.clone());
    let path = req.identity_path.clone();
    let device_id = req.identity.device_id().to_string();
    let role = role.to_string();
    let token = token.to_string();
    let stored = tokio::task::spawn_blocking(move || {
        identity::store_device_auth_token(&path, &device_id, &role, &token, &scopes)
            .map(|()| role)
    })
    .await;
    match stored {
        Ok(Ok(role)) => info!("Stored gateway device token for role '{}'", role),
        Ok(Err(e)) => warn!("Could not store gateway device token: {}", e),
        Err(e) => warn!("Device token store task failed: {}", e),
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
