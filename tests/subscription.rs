mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tempfile::tempdir;
use tokio::sync::Notify;
use tokio::time::{sleep, timeout};

use common::{client_config, hello, spawn_gateway};
use openclaw_manager::gateway::{
    CloseInfo, ErrorKind, GatewayRpcClient, GatewayRpcError, SubscribeOptions,
    SubscriptionObserver,
};
use openclaw_manager::types::EventFrame;

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<EventFrame>>,
    errors: AtomicUsize,
    closes: Mutex<Vec<CloseInfo>>,
    closed: Notify,
}

impl SubscriptionObserver for Recorder {
    fn on_event(&self, event: EventFrame) {
        self.events.lock().unwrap().push(event);
    }

    fn on_error(&self, _error: &GatewayRpcError) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    fn on_close(&self, close: CloseInfo) {
        self.closes.lock().unwrap().push(close);
        self.closed.notify_one();
    }
}

fn options() -> SubscribeOptions {
    SubscribeOptions {
        connect_timeout: Duration::from_secs(3),
        ..SubscribeOptions::default()
    }
}

#[tokio::test]
async fn events_flow_after_ready_and_close_fires_once() {
    let gateway = spawn_gateway(|_, mut conn| async move {
        conn.accept_connect("n", hello()).await;
        conn.send_json(json!({"type": "event", "event": "chat", "payload": {"text": "hi"}, "seq": 1}))
            .await;
        conn.send_json(json!({"type": "evt", "event": "agent", "payload": {"runId": "r"}, "seq": 2}))
            .await;
        sleep(Duration::from_millis(100)).await;
        conn.close(1000, "bye").await;
        conn.drain().await;
    })
    .await;
    let dir = tempdir().unwrap();
    let client = GatewayRpcClient::new(client_config(&gateway.url, dir.path().join("device.json")));
    let recorder = Arc::new(Recorder::default());

    let mut subscription = client.subscribe(recorder.clone(), options());
    let ready = subscription.ready().await.unwrap();
    assert_eq!(ready.url, gateway.url);

    timeout(Duration::from_secs(5), recorder.closed.notified())
        .await
        .expect("on_close");
    sleep(Duration::from_millis(100)).await;

    let events = recorder.events.lock().unwrap().clone();
    let names: Vec<_> = events.iter().map(|e| e.event.as_str()).collect();
    assert_eq!(names, ["chat", "agent"]);
    assert_eq!(events[1].seq, Some(2));

    let closes = recorder.closes.lock().unwrap().clone();
    assert_eq!(closes.len(), 1);
    assert_eq!(closes[0].code, 1000);
    assert_eq!(closes[0].reason, "bye");
    assert_eq!(recorder.errors.load(Ordering::SeqCst), 0);
    assert!(!subscription.is_connected());

    // `ready` already settled; asking again does not re-run the connect.
    assert!(subscription.ready().await.is_err());
    assert_eq!(gateway.connection_count(), 1);
}

#[tokio::test]
async fn rejected_connect_rejects_ready_and_reports_error() {
    let gateway = spawn_gateway(|_, mut conn| async move {
        conn.challenge("n").await;
        let connect = conn.recv_request().await.unwrap();
        conn.respond_err(&connect, "FORBIDDEN", "forbidden: scope not granted")
            .await;
        conn.drain().await;
    })
    .await;
    let dir = tempdir().unwrap();
    let client = GatewayRpcClient::new(client_config(&gateway.url, dir.path().join("device.json")));
    let recorder = Arc::new(Recorder::default());

    let mut subscription = client.subscribe(recorder.clone(), options());
    let err = subscription.ready().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Auth);

    sleep(Duration::from_millis(100)).await;
    assert_eq!(recorder.errors.load(Ordering::SeqCst), 1);
    assert!(recorder.closes.lock().unwrap().is_empty());
}

#[tokio::test]
async fn caller_close_is_silent() {
    let gateway = spawn_gateway(|_, mut conn| async move {
        conn.accept_connect("n", hello()).await;
        conn.drain().await;
    })
    .await;
    let dir = tempdir().unwrap();
    let client = GatewayRpcClient::new(client_config(&gateway.url, dir.path().join("device.json")));
    let recorder = Arc::new(Recorder::default());

    let mut subscription = client.subscribe(recorder.clone(), options());
    subscription.ready().await.unwrap();
    assert!(subscription.is_connected());

    subscription.close();
    subscription.close();
    sleep(Duration::from_millis(200)).await;

    assert!(!subscription.is_connected());
    assert!(recorder.closes.lock().unwrap().is_empty());
    assert_eq!(recorder.errors.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn close_before_connect_rejects_ready_as_network() {
    // Accepts the socket but never completes the handshake.
    let gateway = spawn_gateway(|_, mut conn| async move {
        conn.drain().await;
    })
    .await;
    let dir = tempdir().unwrap();
    let client = GatewayRpcClient::new(client_config(&gateway.url, dir.path().join("device.json")));
    let recorder = Arc::new(Recorder::default());

    let mut subscription = client.subscribe(recorder.clone(), options());
    subscription.close();
    let err = subscription.ready().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Network);
    assert_eq!(recorder.errors.load(Ordering::SeqCst), 0);
}
