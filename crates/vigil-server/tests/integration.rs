//! End-to-end tests against real servers and real WebSocket clients.

#![allow(missing_docs)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use jsonwebtoken::{EncodingKey, Header, encode};
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use vigil_auth::{ChannelAuthorizer, InMemoryDirectory, JwtAuthenticator, PatientRecord};
use vigil_bus::{Bus, MemoryBus, SyncConfig};
use vigil_server::{ServerConfig, VigilServer};

const SECRET: &[u8] = b"integration-secret";
const TIMEOUT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(300);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct TestServer {
    server: Arc<VigilServer>,
    addr: SocketAddr,
}

impl TestServer {
    fn ws_url(&self, token: &str) -> String {
        format!("ws://{}/ws?token={token}", self.addr)
    }
}

fn directory() -> InMemoryDirectory {
    let dir = InMemoryDirectory::new();
    dir.upsert_patient(
        42,
        PatientRecord {
            institution_id: "inst-1".into(),
            assigned_staff_id: None,
        },
    );
    dir.upsert_patient(
        7,
        PatientRecord {
            institution_id: "inst-1".into(),
            assigned_staff_id: Some("someone-else".into()),
        },
    );
    dir.attach_device("ESP32-01", None);
    dir.attach_device("ESP32-02", None);
    dir
}

async fn boot_with(bus: Option<Arc<dyn Bus>>, tweak: impl FnOnce(&mut ServerConfig)) -> TestServer {
    let mut config = ServerConfig::default(); // port 0 = auto-assign
    tweak(&mut config);
    let authorizer = ChannelAuthorizer::new(Arc::new(directory()), vec!["admin".into()]);
    let sync_config = SyncConfig {
        resubscribe_delay: Duration::from_millis(50),
        ..SyncConfig::default()
    };
    let server = Arc::new(VigilServer::new(
        config,
        JwtAuthenticator::new(SECRET),
        authorizer,
        bus,
        sync_config,
        None,
    ));
    let addr = server.listen().await.unwrap();
    TestServer { server, addr }
}

async fn boot() -> TestServer {
    boot_with(None, |_| {}).await
}

fn token_expiring_in(user: &str, secs: i64) -> String {
    let claims = json!({
        "user_id": user,
        "institution_id": "inst-1",
        "role": "clinician",
        "exp": chrono::Utc::now().timestamp() + secs,
    });
    encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET)).unwrap()
}

fn token(user: &str) -> String {
    token_expiring_in(user, 3600)
}

async fn connect(ts: &TestServer, user: &str) -> WsStream {
    let (ws, _) = connect_async(ts.ws_url(&token(user))).await.unwrap();
    ws
}

async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Next JSON text frame, skipping control frames. `None` on close.
async fn next_json(ws: &mut WsStream) -> Option<Value> {
    loop {
        match ws.next().await? {
            Ok(Message::Text(text)) => return Some(serde_json::from_str(text.as_str()).unwrap()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

/// Next message of `kind`, skipping everything else.
async fn recv_kind(ws: &mut WsStream, kind: &str) -> Value {
    timeout(TIMEOUT, async {
        loop {
            let msg = next_json(ws).await.expect("connection closed");
            if msg["type"] == kind {
                return msg;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {kind}"))
}

async fn subscribe(ws: &mut WsStream, channel: &str) {
    send_json(ws, json!({"type": "subscribe", "channel": channel})).await;
    let vc = recv_kind(ws, "viewer_count").await;
    assert_eq!(vc["channel"], channel);
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    timeout(TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

async fn expect_http_status(request: impl IntoClientRequest + Unpin, status: u16) {
    match connect_async(request).await {
        Err(WsError::Http(resp)) => assert_eq!(resp.status().as_u16(), status),
        Err(e) => panic!("expected HTTP {status}, got {e}"),
        Ok(_) => panic!("expected HTTP {status}, upgrade succeeded"),
    }
}

// ── Delivery ──

#[tokio::test]
async fn device_status_reaches_only_its_subscriber() {
    let ts = boot().await;
    let mut a = connect(&ts, "alice").await;
    let mut b = connect(&ts, "bob").await;
    subscribe(&mut a, "device:ESP32-01").await;
    subscribe(&mut b, "device:ESP32-02").await;

    let _ = ts
        .server
        .publisher()
        .device_status("ESP32-01", &json!({"status": "online"}))
        .await
        .unwrap();

    let msg = recv_kind(&mut a, "device_status").await;
    assert_eq!(msg["channel"], "device:ESP32-01");
    assert_eq!(msg["data"], json!({"status": "online"}));
    assert!(msg["timestamp"].is_i64());

    assert!(timeout(QUIET, recv_kind(&mut b, "device_status")).await.is_err());
}

#[tokio::test]
async fn events_cross_instances_once() {
    let bus = MemoryBus::new();
    let one = boot_with(Some(Arc::new(bus.clone())), |_| {}).await;
    let two = boot_with(Some(Arc::new(bus.clone())), |_| {}).await;
    let topic = SyncConfig::default().topic;
    wait_until(|| bus.subscriber_count(&topic) == 2).await;

    let mut local = connect(&one, "alice").await;
    let mut remote = connect(&two, "bob").await;
    subscribe(&mut local, "patient:42").await;
    subscribe(&mut remote, "patient:42").await;

    let _ = one
        .server
        .publisher()
        .alert_created(42, &json!({"severity": "high"}))
        .await
        .unwrap();

    let msg = recv_kind(&mut remote, "alert_created").await;
    assert_eq!(msg["channel"], "patient:42");
    assert_eq!(msg["data"]["severity"], "high");
    assert_eq!(msg["instance_id"], one.server.instance_id().as_str());
    assert!(msg["message_id"].is_string());

    let _ = recv_kind(&mut local, "alert_created").await;
    assert!(timeout(QUIET, recv_kind(&mut local, "alert_created")).await.is_err());
    assert!(timeout(QUIET, recv_kind(&mut remote, "alert_created")).await.is_err());
    assert_eq!(bus.published_count(), 1);
}

#[tokio::test]
async fn bus_outage_degrades_to_local_delivery() {
    let bus = MemoryBus::new();
    let ts = boot_with(Some(Arc::new(bus.clone())), |_| {}).await;
    let mut ws = connect(&ts, "alice").await;
    subscribe(&mut ws, "dashboard").await;

    bus.set_reachable(false);
    let result = ts.server.publisher().dashboard_stats(&json!({"active": 3})).await;
    assert!(result.is_err());

    let msg = recv_kind(&mut ws, "dashboard_stats").await;
    assert_eq!(msg["data"]["active"], 3);
}

// ── Upgrade authentication ──

#[tokio::test]
async fn upgrade_without_token_is_401() {
    let ts = boot().await;
    expect_http_status(format!("ws://{}/ws", ts.addr), 401).await;
}

#[tokio::test]
async fn upgrade_with_expired_token_is_401() {
    let ts = boot().await;
    let url = ts.ws_url(&token_expiring_in("alice", -10));
    expect_http_status(url, 401).await;
    assert_eq!(ts.server.ws_metrics().auth_errors, 1);
}

#[tokio::test]
async fn upgrade_with_wrong_secret_is_401() {
    let ts = boot().await;
    let claims = json!({"user_id": "a", "institution_id": "i", "role": "r", "exp": chrono::Utc::now().timestamp() + 60});
    let forged = encode(&Header::default(), &claims, &EncodingKey::from_secret(b"other")).unwrap();
    expect_http_status(ts.ws_url(&forged), 401).await;
}

#[tokio::test]
async fn bearer_header_is_accepted() {
    let ts = boot().await;
    let mut request = format!("ws://{}/ws", ts.addr).into_client_request().unwrap();
    let _ = request.headers_mut().insert(
        "authorization",
        HeaderValue::from_str(&format!("Bearer {}", token("alice"))).unwrap(),
    );
    let (mut ws, _) = connect_async(request).await.unwrap();
    subscribe(&mut ws, "dashboard").await;
}

#[tokio::test]
async fn protocol_token_is_echoed() {
    let ts = boot().await;
    let entry = format!("token-{}", token("alice"));
    let mut request = format!("ws://{}/ws", ts.addr).into_client_request().unwrap();
    let _ = request
        .headers_mut()
        .insert("sec-websocket-protocol", HeaderValue::from_str(&entry).unwrap());

    let (mut ws, response) = connect_async(request).await.unwrap();
    assert_eq!(response.headers()["sec-websocket-protocol"], entry.as_str());
    subscribe(&mut ws, "alerts:global").await;
}

#[tokio::test]
async fn connection_limit_is_503() {
    let ts = boot_with(None, |c| c.max_connections = 1).await;
    let _first = connect(&ts, "alice").await;
    wait_until(|| ts.server.registry().connection_count() == 1).await;
    expect_http_status(ts.ws_url(&token("bob")), 503).await;
}

// ── Subscriptions ──

#[tokio::test]
async fn unauthorized_subscription_keeps_connection_open() {
    let ts = boot().await;
    let mut ws = connect(&ts, "alice").await;

    send_json(&mut ws, json!({"type": "subscribe", "channel": "patient:7"})).await;
    let err = recv_kind(&mut ws, "error").await;
    assert_eq!(err["channel"], "patient:7");
    assert_eq!(err["data"]["action"], "subscribe");
    assert!(err["data"]["error"].as_str().unwrap().starts_with("authorization failed"));

    subscribe(&mut ws, "dashboard").await;
    assert_eq!(ts.server.ws_metrics().auth_errors, 1);
}

#[tokio::test]
async fn malformed_channel_is_rejected() {
    let ts = boot().await;
    let mut ws = connect(&ts, "alice").await;
    for bad in ["patient:abc", "device:", "rooms:1", "dashboard:extra"] {
        send_json(&mut ws, json!({"type": "subscribe", "channel": bad})).await;
        let err = recv_kind(&mut ws, "error").await;
        assert_eq!(err["channel"], bad);
        assert!(
            err["data"]["error"]
                .as_str()
                .unwrap()
                .starts_with("invalid channel format")
        );
    }
}

#[tokio::test]
async fn viewer_counts_converge_after_unsubscribe() {
    let ts = boot().await;
    let mut a = connect(&ts, "alice").await;
    let mut b = connect(&ts, "bob").await;
    subscribe(&mut a, "patient:42").await;
    subscribe(&mut b, "patient:42").await;

    timeout(TIMEOUT, async {
        while recv_kind(&mut a, "viewer_count").await["data"]["count"] != 2 {}
    })
    .await
    .unwrap();

    send_json(&mut b, json!({"type": "unsubscribe", "channel": "patient:42"})).await;
    let vc = timeout(TIMEOUT, async {
        loop {
            let vc = recv_kind(&mut a, "viewer_count").await;
            if vc["data"]["count"] == 1 {
                return vc;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(vc["data"]["viewers"], json!(["alice"]));

    let rows = ts.server.registry().subscribers("patient:42").await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].user_id, "alice");
}

#[tokio::test]
async fn disconnect_refreshes_viewer_count() {
    let ts = boot().await;
    let mut a = connect(&ts, "alice").await;
    let mut b = connect(&ts, "bob").await;
    subscribe(&mut a, "dashboard").await;
    subscribe(&mut b, "dashboard").await;

    b.close(None).await.unwrap();
    drop(b);

    timeout(TIMEOUT, async {
        while recv_kind(&mut a, "viewer_count").await["data"]["count"] != 1 {}
    })
    .await
    .unwrap();
    wait_until(|| ts.server.registry().connection_count() == 1).await;
}

// ── Health monitor ──

#[tokio::test]
async fn heartbeats_are_sent_on_interval() {
    let ts = boot_with(None, |c| c.heartbeat_interval_secs = 1).await;
    let mut ws = connect(&ts, "alice").await;
    let hb = recv_kind(&mut ws, "heartbeat").await;
    assert!(hb["data"]["timestamp"].is_i64());
    assert_eq!(hb["channel"], "");
}

#[tokio::test]
async fn expired_credential_gets_notice_then_policy_close() {
    let ts = boot_with(None, |c| {
        c.heartbeat_interval_secs = 1;
        c.reauth_grace_ms = 50;
    })
    .await;
    let (mut ws, _) = connect_async(ts.ws_url(&token_expiring_in("alice", 2))).await.unwrap();

    let notice = recv_kind(&mut ws, "reauthentication_required").await;
    assert_eq!(notice["data"]["reason"], "token_expired");

    let close = timeout(TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(frame))) => return frame,
                Some(Ok(_)) => {}
                other => panic!("expected close frame, got {other:?}"),
            }
        }
    })
    .await
    .unwrap()
    .expect("close frame without payload");
    assert_eq!(u16::from(close.code), 1008);

    wait_until(|| ts.server.registry().connection_count() == 0).await;
}

#[tokio::test]
async fn shutdown_closes_clients() {
    let ts = boot().await;
    let mut ws = connect(&ts, "alice").await;
    subscribe(&mut ws, "dashboard").await;

    assert!(ts.server.shutdown_gracefully().await);

    let end = timeout(TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
                Some(Ok(_)) => {}
                _ => return None,
            }
        }
    })
    .await
    .unwrap();
    assert!(end.is_none_or(|code| code == 1001));
    assert_eq!(ts.server.registry().connection_count(), 0);
}

#[tokio::test]
async fn metrics_snapshot_tracks_traffic() {
    let ts = boot().await;
    let mut ws = connect(&ts, "alice").await;
    subscribe(&mut ws, "alerts:global").await;

    let _ = ts
        .server
        .publisher()
        .event(&vigil_core::Channel::alerts_global(), &json!({"n": 1}))
        .await
        .unwrap();
    let _ = recv_kind(&mut ws, "event").await;

    let snapshot = ts.server.ws_metrics();
    assert_eq!(snapshot.active_connections, 1);
    assert_eq!(snapshot.total_connections, 1);
    assert!(snapshot.total_events_sent >= 2);
}
