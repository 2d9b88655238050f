//! End-to-end tests against an in-process mock gateway.
//!
//! Each test binds a local TCP listener, accepts the client's WebSocket
//! upgrade, and scripts the gateway side of the conversation by hand.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use futures_util::{pin_mut, SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use oc_client::{
    build_signature_payload, device_id_from_public_key, FileKeyStore, GatewayClient,
    GatewayClientBuilder, GatewayError, GatewaySession, SessionConfig,
};

type ServerWs = WebSocketStream<TcpStream>;

async fn bind() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

async fn accept(listener: &TcpListener) -> ServerWs {
    let (stream, _) = listener.accept().await.unwrap();
    tokio_tungstenite::accept_async(stream).await.unwrap()
}

async fn recv_json(ws: &mut ServerWs) -> Value {
    loop {
        match ws.next().await.expect("connection open").unwrap() {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Close(_) => panic!("unexpected close"),
            _ => {}
        }
    }
}

async fn send_json(ws: &mut ServerWs, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

/// Read the connect request and reply ok with the given payload.
/// Returns the connect request for assertions.
async fn complete_handshake(ws: &mut ServerWs, payload: Value) -> Value {
    let request = recv_json(ws).await;
    assert_eq!(request["type"], "req");
    assert_eq!(request["method"], "connect");
    send_json(
        ws,
        json!({"type": "res", "id": request["id"], "ok": true, "payload": payload}),
    )
    .await;
    request
}

fn test_client(port: u16) -> GatewayClient {
    GatewayClientBuilder::new()
        .host("127.0.0.1")
        .port(port)
        .token("test-token")
        .challenge_timeout(Duration::from_millis(100))
        .handshake_timeout(Duration::from_secs(2))
        .connect_wait(Duration::from_millis(800))
        .retry_delay(Duration::from_secs(30))
        .ack_timeout(Duration::from_secs(2))
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

// ── Handshake ────────────────────────────────────────────────────────

#[tokio::test]
async fn legacy_handshake_sends_token_without_device_proof() {
    let (listener, port) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        // No challenge: the client falls back to the legacy handshake.
        let request = complete_handshake(
            &mut ws,
            json!({"snapshot": {"presence": ["client-a"]}}),
        )
        .await;
        (request, ws)
    });

    let client = test_client(port);
    client.connect().await.unwrap();
    assert!(client.connected());

    let (request, _ws) = server.await.unwrap();
    let params = &request["params"];
    assert_eq!(params["minProtocol"], 3);
    assert_eq!(params["maxProtocol"], 3);
    assert_eq!(params["auth"]["token"], "test-token");
    assert_eq!(params["client"]["mode"], "backend");
    assert!(params.get("device").is_none());
    assert!(params.get("role").is_none());
    assert!(params.get("scopes").is_none());

    // Snapshot captured, presence list normalized into an object.
    assert_eq!(client.connect_snapshot()["snapshot"]["presence"][0], "client-a");
    assert_eq!(client.presence(), json!({"clients": ["client-a"]}));

    client.disconnect().await;
}

#[tokio::test]
async fn challenge_handshake_carries_verifiable_device_proof() {
    let (listener, port) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        send_json(
            &mut ws,
            json!({"type": "event", "event": "connect.challenge", "payload": {"nonce": "test-uuid-nonce"}}),
        )
        .await;
        let request = complete_handshake(&mut ws, json!({})).await;
        (request, ws)
    });

    let dir = tempfile::tempdir().unwrap();
    let client = GatewayClientBuilder::new()
        .host("127.0.0.1")
        .port(port)
        .token("test-token")
        .key_store(Arc::new(FileKeyStore::new(dir.path().join("device_key"))))
        .challenge_timeout(Duration::from_secs(2))
        .connect_wait(Duration::from_secs(2))
        .retry_delay(Duration::from_secs(30))
        .build()
        .unwrap();
    client.connect().await.unwrap();

    let (request, _ws) = server.await.unwrap();
    let params = &request["params"];
    assert_eq!(params["role"], "operator");
    assert_eq!(
        params["scopes"],
        json!(["operator.read", "operator.write"])
    );

    let device = &params["device"];
    let public_key: [u8; 32] = URL_SAFE_NO_PAD
        .decode(device["publicKey"].as_str().unwrap())
        .unwrap()
        .try_into()
        .unwrap();
    assert_eq!(
        device["id"].as_str().unwrap(),
        device_id_from_public_key(&public_key)
    );
    assert_eq!(device["nonce"], "test-uuid-nonce");

    // The signature must verify over the canonical payload.
    let scopes = vec!["operator.read".to_string(), "operator.write".to_string()];
    let payload = build_signature_payload(
        device["id"].as_str().unwrap(),
        "gateway-client",
        "backend",
        "operator",
        &scopes,
        device["signedAt"].as_i64().unwrap(),
        "test-token",
        "test-uuid-nonce",
    );
    let signature: [u8; 64] = URL_SAFE_NO_PAD
        .decode(device["signature"].as_str().unwrap())
        .unwrap()
        .try_into()
        .unwrap();
    VerifyingKey::from_bytes(&public_key)
        .unwrap()
        .verify(payload.as_bytes(), &Signature::from_bytes(&signature))
        .unwrap();

    client.disconnect().await;
}

#[tokio::test]
async fn events_before_the_connect_response_are_skipped() {
    let (listener, port) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let request = recv_json(&mut ws).await;
        send_json(
            &mut ws,
            json!({"type": "event", "event": "noise", "payload": {}}),
        )
        .await;
        send_json(
            &mut ws,
            json!({"type": "res", "id": request["id"], "ok": true, "payload": {}}),
        )
        .await;
        ws
    });

    let client = test_client(port);
    client.connect().await.unwrap();
    assert!(client.connected());

    let _ws = server.await.unwrap();
    client.disconnect().await;
}

#[tokio::test]
async fn rejected_token_is_a_fatal_authentication_error() {
    let (listener, port) = bind().await;
    tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let request = recv_json(&mut ws).await;
        send_json(
            &mut ws,
            json!({"type": "res", "id": request["id"], "ok": false, "error": "Invalid token"}),
        )
        .await;
        // Keep the socket open; the client must bail on its own.
        let _ = ws.next().await;
    });

    let client = test_client(port);
    let hook_calls = Arc::new(AtomicUsize::new(0));
    let hook_calls_seen = hook_calls.clone();
    client.on_fatal_error(move |_err| {
        hook_calls_seen.fetch_add(1, Ordering::SeqCst);
    });

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, GatewayError::Authentication(_)), "{err}");
    assert!(err.to_string().contains("Invalid token"));

    assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
    assert!(matches!(
        client.fatal_error(),
        Some(GatewayError::Authentication(_))
    ));
    assert!(!client.connected());
}

#[tokio::test]
async fn rejected_handshake_without_auth_text_is_fatal_protocol() {
    let (listener, port) = bind().await;
    tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let request = recv_json(&mut ws).await;
        send_json(
            &mut ws,
            json!({"type": "res", "id": request["id"], "ok": false, "error": "Bad request"}),
        )
        .await;
        let _ = ws.next().await;
    });

    let client = test_client(port);
    let err = client.connect().await.unwrap_err();
    // connect() reports the wait failure as a connection error but the
    // recorded fatal cause stays a protocol error.
    assert!(matches!(err, GatewayError::Connection(_)), "{err}");
    assert!(matches!(
        client.fatal_error(),
        Some(GatewayError::Protocol(_))
    ));
}

#[tokio::test]
async fn http_401_rejection_is_fatal_and_not_retried() {
    let (listener, port) = bind().await;
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let reject =
            |_request: &Request, _response: Response| -> Result<Response, ErrorResponse> {
                let mut rejection = ErrorResponse::new(None);
                *rejection.status_mut() = StatusCode::UNAUTHORIZED;
                Err(rejection)
            };
        let _ = tokio_tungstenite::accept_hdr_async(stream, reject).await;

        // The retry delay is 100ms here, so a rejected upgrade that
        // were merely transient would reconnect well within this window.
        let second = tokio::time::timeout(Duration::from_millis(600), listener.accept()).await;
        assert!(second.is_err(), "client retried after a fatal rejection");
    });

    let client = GatewayClientBuilder::new()
        .host("127.0.0.1")
        .port(port)
        .token("test-token")
        .connect_wait(Duration::from_millis(500))
        .retry_delay(Duration::from_millis(100))
        .build()
        .unwrap();

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, GatewayError::Authentication(_)), "{err}");
    assert!(err.to_string().contains("401"));
    assert!(matches!(
        client.fatal_error(),
        Some(GatewayError::Authentication(_))
    ));
    assert!(!client.connected());

    server.await.unwrap();
}

#[tokio::test]
async fn restart_close_code_reconnects_immediately() {
    let (listener, port) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        complete_handshake(&mut ws, json!({})).await;
        ws.close(Some(CloseFrame {
            code: CloseCode::Restart,
            reason: "restarting".into(),
        }))
        .await
        .unwrap();

        // The retry delay is 30s in this config, so a quick second
        // connection proves the immediate-retry path.
        let mut ws = accept(&listener).await;
        complete_handshake(&mut ws, json!({})).await;
        ws
    });

    let client = test_client(port);
    client.connect().await.unwrap();

    let _ws = tokio::time::timeout(Duration::from_secs(2), server)
        .await
        .expect("client reconnected in time")
        .unwrap();
    client.disconnect().await;
}

// ── Requests ─────────────────────────────────────────────────────────

#[tokio::test]
async fn responses_correlate_out_of_order() {
    let (listener, port) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        complete_handshake(&mut ws, json!({})).await;

        let first = recv_json(&mut ws).await;
        let second = recv_json(&mut ws).await;
        // Answer in reverse arrival order.
        for request in [&second, &first] {
            let method = request["method"].as_str().unwrap().to_owned();
            send_json(
                &mut ws,
                json!({
                    "type": "res",
                    "id": request["id"],
                    "ok": true,
                    "payload": {"method": method},
                }),
            )
            .await;
        }
        ws
    });

    let client = test_client(port);
    client.connect().await.unwrap();

    let (health, status) = tokio::join!(client.health(), client.status());
    assert_eq!(health.unwrap()["method"], "health");
    assert_eq!(status.unwrap()["method"], "status");

    let _ws = server.await.unwrap();
    client.disconnect().await;
}

#[tokio::test]
async fn unanswered_request_times_out_and_leaves_no_waiter() {
    let (listener, port) = bind().await;
    tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        complete_handshake(&mut ws, json!({})).await;
        // Swallow everything after the handshake.
        while ws.next().await.is_some() {}
    });

    let config = SessionConfig {
        host: "127.0.0.1".into(),
        port,
        token: Some("test-token".into()),
        challenge_timeout: Duration::from_millis(100),
        retry_delay: Duration::from_secs(30),
        ..Default::default()
    };
    let session = GatewaySession::new(config, None);
    session.connect();
    session
        .connected_watch()
        .wait_for(|up| *up)
        .await
        .unwrap();

    let err = session
        .send_request("health", json!({}), Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Timeout(_)), "{err}");
    assert_eq!(session.pending_count(), 0);

    session.disconnect().await;
}

// ── Heartbeat ────────────────────────────────────────────────────────

#[tokio::test]
async fn heartbeat_ping_is_sent_and_pong_refreshes_age() {
    let (listener, port) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        complete_handshake(&mut ws, json!({})).await;
        let ping = recv_json(&mut ws).await;
        assert_eq!(ping["type"], "ping");
        // Hold the pong back so the age visibly grows first.
        tokio::time::sleep(Duration::from_millis(150)).await;
        send_json(&mut ws, json!({"type": "pong"})).await;
        ws
    });

    let config = SessionConfig {
        host: "127.0.0.1".into(),
        port,
        token: Some("test-token".into()),
        heartbeat_interval: Duration::from_millis(50),
        challenge_timeout: Duration::from_millis(100),
        retry_delay: Duration::from_secs(30),
        ..Default::default()
    };
    let session = GatewaySession::new(config, None);
    session.connect();
    session
        .connected_watch()
        .wait_for(|up| *up)
        .await
        .unwrap();

    let _ws = server.await.unwrap();

    // At least 150ms passed since the connection came up; once the pong
    // is processed the age must drop back below that.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if session.heartbeat_age() < Duration::from_millis(120) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "pong did not refresh the heartbeat age"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    session.disconnect().await;
}

// ── Agent runs ───────────────────────────────────────────────────────

async fn serve_agent_run(ws: &mut ServerWs, run_id: &str, events: Vec<Value>) {
    let request = recv_json(ws).await;
    assert_eq!(request["method"], "agent");
    assert_eq!(request["params"]["sessionKey"], "main");
    assert!(request["params"]["idempotencyKey"].is_string());
    send_json(
        ws,
        json!({"type": "res", "id": request["id"], "ok": true, "payload": {"runId": run_id}}),
    )
    .await;
    for mut event in events {
        event["runId"] = json!(run_id);
        send_json(ws, json!({"type": "event", "event": "agent", "payload": event})).await;
    }
}

#[tokio::test]
async fn agent_request_returns_final_text() {
    let (listener, port) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        complete_handshake(&mut ws, json!({})).await;
        serve_agent_run(
            &mut ws,
            "run-1",
            vec![
                json!({"output": "Hi"}),
                json!({"output": "Hi there"}),
                json!({"status": "ok"}),
            ],
        )
        .await;
        ws
    });

    let client = test_client(port);
    client.connect().await.unwrap();

    let response = client.send_agent_request("hello").await.unwrap();
    assert_eq!(response, "Hi there");
    assert_eq!(client.active_runs(), 0);

    let _ws = server.await.unwrap();
    client.disconnect().await;
}

#[tokio::test]
async fn failed_agent_run_surfaces_its_summary() {
    let (listener, port) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        complete_handshake(&mut ws, json!({})).await;
        serve_agent_run(
            &mut ws,
            "run-1",
            vec![json!({"status": "error", "summary": "boom"})],
        )
        .await;
        ws
    });

    let client = test_client(port);
    client.connect().await.unwrap();

    let err = client.send_agent_request("hello").await.unwrap_err();
    assert!(matches!(err, GatewayError::AgentExecution(_)), "{err}");
    assert!(err.to_string().contains("boom"));
    assert_eq!(client.active_runs(), 0);

    let _ws = server.await.unwrap();
    client.disconnect().await;
}

#[tokio::test]
async fn missing_run_id_in_ack_is_an_agent_error() {
    let (listener, port) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        complete_handshake(&mut ws, json!({})).await;
        let request = recv_json(&mut ws).await;
        send_json(
            &mut ws,
            json!({"type": "res", "id": request["id"], "ok": true, "payload": {}}),
        )
        .await;
        ws
    });

    let client = test_client(port);
    client.connect().await.unwrap();

    let err = client.send_agent_request("hello").await.unwrap_err();
    assert!(matches!(err, GatewayError::AgentExecution(_)), "{err}");
    assert_eq!(client.active_runs(), 0);

    let _ws = server.await.unwrap();
    client.disconnect().await;
}

#[tokio::test]
async fn streaming_yields_chunks_in_order() {
    let (listener, port) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        complete_handshake(&mut ws, json!({})).await;
        serve_agent_run(
            &mut ws,
            "run-1",
            vec![
                json!({"output": "Hello"}),
                json!({"output": "Hello world"}),
                json!({"status": "ok", "summary": "done"}),
            ],
        )
        .await;
        ws
    });

    let client = test_client(port);
    client.connect().await.unwrap();

    let stream = client.stream_agent_request("hello");
    pin_mut!(stream);
    let mut chunks = Vec::new();
    while let Some(chunk) = stream.next().await {
        chunks.push(chunk.unwrap());
    }
    assert_eq!(chunks, vec!["Hello".to_string(), " world".to_string()]);
    assert_eq!(client.active_runs(), 0);

    let _ws = server.await.unwrap();
    client.disconnect().await;
}

#[tokio::test]
async fn events_for_unknown_runs_are_ignored() {
    let (listener, port) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        complete_handshake(&mut ws, json!({})).await;
        // A stray event for a run this client never started.
        send_json(
            &mut ws,
            json!({"type": "event", "event": "agent", "payload": {"runId": "ghost", "output": "x"}}),
        )
        .await;
        serve_agent_run(
            &mut ws,
            "run-1",
            vec![json!({"output": "mine"}), json!({"status": "ok"})],
        )
        .await;
        ws
    });

    let client = test_client(port);
    client.connect().await.unwrap();

    let response = client.send_agent_request("hello").await.unwrap();
    assert_eq!(response, "mine");

    let _ws = server.await.unwrap();
    client.disconnect().await;
}

#[tokio::test]
async fn server_ping_gets_an_application_pong() {
    let (listener, port) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        complete_handshake(&mut ws, json!({})).await;
        send_json(&mut ws, json!({"type": "ping"})).await;
        let pong = recv_json(&mut ws).await;
        assert_eq!(pong["type"], "pong");
        ws
    });

    let client = test_client(port);
    client.connect().await.unwrap();

    let _ws = tokio::time::timeout(Duration::from_secs(2), server)
        .await
        .expect("pong arrived")
        .unwrap();
    client.disconnect().await;
}
