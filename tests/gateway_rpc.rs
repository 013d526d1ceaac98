mod common;

use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tempfile::tempdir;

use common::{client_config, hello, spawn_gateway};
use openclaw_manager::gateway::{CallOptions, ErrorKind, GatewayRpcClient};
use openclaw_manager::identity;

fn quick() -> CallOptions {
    CallOptions {
        timeout: Duration::from_secs(3),
        ..CallOptions::default()
    }
}

#[tokio::test]
async fn call_resolves_with_response_payload() {
    let gateway = spawn_gateway(|_, mut conn| async move {
        conn.accept_connect("n-1", hello()).await;
        let request = conn.recv_request().await.unwrap();
        assert_eq!(request["method"], "health");
        assert_eq!(request["params"], json!({"probe": true}));
        conn.respond_ok(&request, json!({"ok": true, "uptimeMs": 42}))
            .await;
        conn.drain().await;
    })
    .await;
    let dir = tempdir().unwrap();
    let client = GatewayRpcClient::new(client_config(&gateway.url, dir.path().join("device.json")));

    let payload = client
        .call("health", json!({"probe": true}), &quick())
        .await
        .unwrap();
    assert_eq!(payload, json!({"ok": true, "uptimeMs": 42}));
}

#[tokio::test]
async fn timed_out_attempt_is_retried_after_delay() {
    let gateway = spawn_gateway(|index, mut conn| async move {
        conn.accept_connect("n", hello()).await;
        let request = conn.recv_request().await.unwrap();
        if index == 0 {
            // Never answer; the client gives up and reconnects.
            conn.drain().await;
            return;
        }
        conn.respond_ok(&request, json!({"attempt": index})).await;
        conn.drain().await;
    })
    .await;
    let dir = tempdir().unwrap();
    let client = GatewayRpcClient::new(client_config(&gateway.url, dir.path().join("device.json")));
    let options = CallOptions {
        timeout: Duration::from_millis(800),
        retries: 2,
        retry_delay: Duration::from_millis(300),
        ..CallOptions::default()
    };

    let started = Instant::now();
    let payload = client.call("status", json!({}), &options).await.unwrap();
    assert_eq!(payload, json!({"attempt": 1}));
    assert!(started.elapsed() >= options.retry_delay);
    assert_eq!(gateway.connection_count(), 2);
}

#[tokio::test]
async fn unauthorized_connect_is_auth_and_not_retried() {
    let gateway = spawn_gateway(|_, mut conn| async move {
        conn.challenge("n").await;
        let connect = conn.recv_request().await.unwrap();
        conn.respond_err(&connect, "UNAUTHORIZED", "unauthorized: gateway token mismatch")
            .await;
        conn.drain().await;
    })
    .await;
    let dir = tempdir().unwrap();
    let client = GatewayRpcClient::new(client_config(&gateway.url, dir.path().join("device.json")));
    let options = CallOptions {
        retries: 3,
        retry_delay: Duration::from_millis(10),
        ..quick()
    };

    let err = client.call("status", json!({}), &options).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Auth);
    assert_eq!(err.code(), Some("UNAUTHORIZED"));
    assert_eq!(err.attempt(), 1);
    assert_eq!(err.method(), "status");
    assert_eq!(gateway.connection_count(), 1);
}

#[tokio::test]
async fn other_connect_rejection_is_remote() {
    let gateway = spawn_gateway(|_, mut conn| async move {
        conn.challenge("n").await;
        let connect = conn.recv_request().await.unwrap();
        conn.respond_err(&connect, "INVALID_REQUEST", "client id not allowed")
            .await;
        conn.drain().await;
    })
    .await;
    let dir = tempdir().unwrap();
    let client = GatewayRpcClient::new(client_config(&gateway.url, dir.path().join("device.json")));

    let err = client.call("status", json!({}), &quick()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Remote);
    assert!(err.to_string().contains("client id not allowed"));
    assert_eq!(err.to_json()["type"], "remote");
}

#[tokio::test]
async fn expect_final_skips_accepted_acknowledgement() {
    let gateway = spawn_gateway(|_, mut conn| async move {
        conn.accept_connect("n", hello()).await;
        let request = conn.recv_request().await.unwrap();
        conn.respond_ok(&request, json!({"status": "accepted", "runId": "r1"}))
            .await;
        conn.send_json(json!({"type": "event", "event": "agent", "payload": {"runId": "r1"}}))
            .await;
        conn.respond_ok(&request, json!({"status": "ok", "runId": "r1", "text": "done"}))
            .await;
        conn.drain().await;
    })
    .await;
    let dir = tempdir().unwrap();
    let client = GatewayRpcClient::new(client_config(&gateway.url, dir.path().join("device.json")));
    let options = CallOptions {
        expect_final: true,
        ..quick()
    };

    let payload = client.call("agent", json!({"message": "hi"}), &options).await.unwrap();
    assert_eq!(payload["status"], "ok");
    assert_eq!(payload["text"], "done");
}

#[tokio::test]
async fn unparseable_frame_is_a_protocol_failure() {
    let gateway = spawn_gateway(|_, mut conn| async move {
        conn.accept_connect("n", hello()).await;
        let _request = conn.recv_request().await.unwrap();
        conn.send_raw("{not json").await;
        conn.drain().await;
    })
    .await;
    let dir = tempdir().unwrap();
    let client = GatewayRpcClient::new(client_config(&gateway.url, dir.path().join("device.json")));

    let err = client.call("status", json!({}), &quick()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
}

#[tokio::test]
async fn unreachable_gateway_is_a_network_failure() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());
    drop(listener);

    let dir = tempdir().unwrap();
    let client = GatewayRpcClient::new(client_config(&url, dir.path().join("device.json")));
    let options = CallOptions {
        retries: 1,
        retry_delay: Duration::from_millis(10),
        ..quick()
    };
    let err = client.call("status", json!({}), &options).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Network);
    assert_eq!(err.attempt(), 2);
}

#[tokio::test]
async fn challenge_response_is_signed_over_v2_payload() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Value>();
    let gateway = spawn_gateway(move |_, mut conn| {
        let tx = tx.clone();
        async move {
            let params = conn.accept_connect("nonce-123", hello()).await;
            let _ = tx.send(params);
            let request = conn.recv_request().await.unwrap();
            conn.respond_ok(&request, json!({})).await;
            conn.drain().await;
        }
    })
    .await;
    let dir = tempdir().unwrap();
    let mut config = client_config(&gateway.url, dir.path().join("device.json"));
    config.token = Some("shared-token".into());
    let client = GatewayRpcClient::new(config);

    client.call("status", json!({}), &quick()).await.unwrap();
    let params = rx.recv().await.unwrap();

    assert_eq!(params["minProtocol"], 3);
    assert_eq!(params["maxProtocol"], 3);
    assert_eq!(params["role"], "operator");
    assert_eq!(params["scopes"], json!(["operator.admin"]));
    assert_eq!(params["auth"]["token"], "shared-token");
    assert_eq!(params["client"]["mode"], "backend");

    let device = &params["device"];
    assert_eq!(device["nonce"], "nonce-123");
    let public_key = URL_SAFE_NO_PAD
        .decode(device["publicKey"].as_str().unwrap())
        .unwrap();
    assert_eq!(
        device["id"].as_str().unwrap(),
        hex::encode(Sha256::digest(&public_key))
    );

    let canonical = format!(
        "v2|{}|{}|{}|operator|operator.admin|{}|shared-token|nonce-123",
        device["id"].as_str().unwrap(),
        params["client"]["id"].as_str().unwrap(),
        params["client"]["mode"].as_str().unwrap(),
        device["signedAt"].as_u64().unwrap(),
    );
    let key = VerifyingKey::from_bytes(&public_key.as_slice().try_into().unwrap()).unwrap();
    let signature_bytes = URL_SAFE_NO_PAD
        .decode(device["signature"].as_str().unwrap())
        .unwrap();
    let signature = Signature::from_slice(&signature_bytes).unwrap();
    key.verify(canonical.as_bytes(), &signature).unwrap();
}

#[tokio::test]
async fn issued_device_token_is_stored_and_reused() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Value>();
    let gateway = spawn_gateway(move |_, mut conn| {
        let tx = tx.clone();
        async move {
            let hello = json!({
                "type": "hello-ok",
                "auth": {"deviceToken": "dt-1", "role": "operator", "scopes": ["operator.admin"]}
            });
            let params = conn.accept_connect("n", hello).await;
            let _ = tx.send(params);
            let request = conn.recv_request().await.unwrap();
            conn.respond_ok(&request, json!({})).await;
            conn.drain().await;
        }
    })
    .await;
    let dir = tempdir().unwrap();
    let identity_path = dir.path().join("device.json");
    let client = GatewayRpcClient::new(client_config(&gateway.url, identity_path.clone()));

    client.call("status", json!({}), &quick()).await.unwrap();
    let first = rx.recv().await.unwrap();
    assert!(first.get("auth").is_none());

    let device_id = identity::load_or_create(&identity_path).device_id().to_string();
    assert_eq!(
        identity::load_device_auth_token(&identity_path, &device_id, "operator").as_deref(),
        Some("dt-1")
    );

    client.call("status", json!({}), &quick()).await.unwrap();
    let second = rx.recv().await.unwrap();
    assert_eq!(second["auth"]["token"], "dt-1");
}

#[tokio::test]
async fn connect_without_challenge_is_signed_over_v1_payload() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Value>();
    let gateway = spawn_gateway(move |_, mut conn| {
        let tx = tx.clone();
        async move {
            // No challenge: the client sends its connect after the stagger.
            let connect = conn.recv_request().await.unwrap();
            let _ = tx.send(connect["params"].clone());
            conn.respond_ok(&connect, hello()).await;
            let request = conn.recv_request().await.unwrap();
            conn.respond_ok(&request, json!({"ok": true})).await;
            conn.drain().await;
        }
    })
    .await;
    let dir = tempdir().unwrap();
    let client = GatewayRpcClient::new(client_config(&gateway.url, dir.path().join("device.json")));

    let payload = client.call("status", json!({}), &quick()).await.unwrap();
    assert_eq!(payload, json!({"ok": true}));

    let params = rx.recv().await.unwrap();
    let device = &params["device"];
    assert!(device.get("nonce").is_none());
    assert!(params.get("auth").is_none());

    let canonical = format!(
        "v1|{}|{}|{}|operator|operator.admin|{}|",
        device["id"].as_str().unwrap(),
        params["client"]["id"].as_str().unwrap(),
        params["client"]["mode"].as_str().unwrap(),
        device["signedAt"].as_u64().unwrap(),
    );
    let public_key: [u8; 32] = URL_SAFE_NO_PAD
        .decode(device["publicKey"].as_str().unwrap())
        .unwrap()
        .try_into()
        .unwrap();
    let signature = URL_SAFE_NO_PAD
        .decode(device["signature"].as_str().unwrap())
        .unwrap();
    VerifyingKey::from_bytes(&public_key)
        .unwrap()
        .verify(canonical.as_bytes(), &Signature::from_slice(&signature).unwrap())
        .unwrap();
}

#[tokio::test]
async fn late_challenge_supersedes_pending_connect() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Value>();
    let gateway = spawn_gateway(move |_, mut conn| {
        let tx = tx.clone();
        async move {
            let first = conn.recv_request().await.unwrap();
            assert!(first["params"]["device"].get("nonce").is_none());
            conn.challenge("late-nonce").await;
            let second = conn.recv_request().await.unwrap();
            assert_eq!(second["method"], "connect");
            let _ = tx.send(second["params"].clone());

            // The stale v1 rejection must not fail the session.
            conn.respond_err(&first, "UNAUTHORIZED", "unauthorized: stale connect")
                .await;
            conn.respond_ok(&second, hello()).await;
            let request = conn.recv_request().await.unwrap();
            conn.respond_ok(&request, json!({"ok": 1})).await;
            conn.drain().await;
        }
    })
    .await;
    let dir = tempdir().unwrap();
    let client = GatewayRpcClient::new(client_config(&gateway.url, dir.path().join("device.json")));

    let payload = client.call("status", json!({}), &quick()).await.unwrap();
    assert_eq!(payload, json!({"ok": 1}));
    let second = rx.recv().await.unwrap();
    assert_eq!(second["device"]["nonce"], "late-nonce");
    assert_eq!(gateway.connection_count(), 1);
}

#[tokio::test]
async fn close_during_request_is_network_with_close_details() {
    let gateway = spawn_gateway(|_, mut conn| async move {
        conn.accept_connect("n", hello()).await;
        let _request = conn.recv_request().await.unwrap();
        conn.close(4008, "going down").await;
        conn.drain().await;
    })
    .await;
    let dir = tempdir().unwrap();
    let client = GatewayRpcClient::new(client_config(&gateway.url, dir.path().join("device.json")));

    let err = client.call("status", json!({}), &quick()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Network);
    assert_eq!(err.to_string(), "gateway closed (4008): going down");
    assert_eq!(
        err.details(),
        Some(&json!({"code": 4008, "reason": "going down"}))
    );
}
