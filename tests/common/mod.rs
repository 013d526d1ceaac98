//! In-process gateway stand-in for integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

use openclaw_manager::gateway::GatewayClientConfig;

/// One accepted client connection.
pub struct Conn {
    ws: WebSocketStream<TcpStream>,
}

impl Conn {
    pub async fn send_json(&mut self, value: Value) {
        self.ws
            .send(Message::Text(value.to_string()))
            .await
            .expect("send frame");
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_string()))
            .await
            .expect("send raw frame");
    }

    pub async fn challenge(&mut self, nonce: &str) {
        self.send_json(json!({
            "type": "event",
            "event": "connect.challenge",
            "payload": {"nonce": nonce, "ts": 1},
        }))
        .await;
    }

    /// Next request frame, or `None` once the client went away.
    pub async fn recv_request(&mut self) -> Option<Value> {
        while let Some(message) = self.ws.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    let frame: Value = serde_json::from_str(&text).expect("client sent json");
                    if frame["type"] == "req" {
                        return Some(frame);
                    }
                }
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => {}
            }
        }
        None
    }

    pub async fn respond_ok(&mut self, request: &Value, payload: Value) {
        self.send_json(json!({
            "type": "res",
            "id": request["id"],
            "ok": true,
            "payload": payload,
        }))
        .await;
    }

    pub async fn respond_err(&mut self, request: &Value, code: &str, message: &str) {
        self.send_json(json!({
            "type": "res",
            "id": request["id"],
            "ok": false,
            "error": {"code": code, "message": message},
        }))
        .await;
    }

    /// Challenge, accept the connect with `hello`, and return its params.
    pub async fn accept_connect(&mut self, nonce: &str, hello: Value) -> Value {
        self.challenge(nonce).await;
        let connect = self.recv_request().await.expect("connect request");
        assert_eq!(connect["method"], "connect");
        self.respond_ok(&connect, hello).await;
        connect["params"].clone()
    }

    /// Wait until the client hangs up.
    pub async fn drain(&mut self) {
        while self.recv_request().await.is_some() {}
    }

    pub async fn close(&mut self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        let _ = self.ws.send(Message::Close(Some(frame))).await;
    }
}

pub struct FakeGateway {
    pub url: String,
    pub connections: Arc<AtomicUsize>,
}

impl FakeGateway {
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// Serve every connection with `handler(index, conn)`.
pub async fn spawn_gateway<F, Fut>(handler: F) -> FakeGateway
where
    F: Fn(usize, Conn) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connections);
    let handler = Arc::new(handler);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let index = counter.fetch_add(1, Ordering::SeqCst);
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                if let Ok(ws) = accept_async(stream).await {
                    handler(index, Conn { ws }).await;
                }
            });
        }
    });

    FakeGateway {
        url: format!("ws://{}/ws", addr),
        connections,
    }
}

pub fn hello() -> Value {
    json!({"type": "hello-ok", "protocol": 3})
}

pub fn client_config(url: &str, identity_path: PathBuf) -> GatewayClientConfig {
    GatewayClientConfig::new(url, identity_path)
}
