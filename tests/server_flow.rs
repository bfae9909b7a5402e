//! End-to-end flows through the HTTP surface: credential issue, client
//! validation, plugin callbacks, expiry-driven rejection, rate limiting.

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tower::ServiceExt;

use firefrp_server::app::App;
use firefrp_server::config::Config;
use firefrp_server::core::credential::CredentialStatus;
use firefrp_server::core::expiry::scan_once;
use firefrp_server::core::state::{CoreState, Notifier, TunnelNotice};
use firefrp_server::frps::FrpsSupervisor;
use firefrp_server::games::GameType;
use firefrp_server::http::{build_router, RateLimiter};
use firefrp_server::motd::MotdProbe;
use firefrp_server::update::UpdateService;

/// Notifier that records what would have gone to the chat gateway.
#[derive(Default)]
struct RecordingNotifier {
    connected: std::sync::Mutex<Vec<TunnelNotice>>,
    disconnected: std::sync::Mutex<Vec<TunnelNotice>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn tunnel_connected(&self, notice: TunnelNotice) {
        self.connected.lock().unwrap().push(notice);
    }
    async fn tunnel_disconnected(&self, notice: TunnelNotice) {
        self.disconnected.lock().unwrap().push(notice);
    }
    async fn group_message(&self, _group_id: &str, _text: &str) {}
}

struct Harness {
    app: Arc<App>,
    notifier: Arc<RecordingNotifier>,
    _dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.port_range_start = 10000;
    config.port_range_end = 10002;
    config.server.public_addr = "play.example.com".to_string();

    let state = CoreState::load(
        config.clone(),
        dir.path().join("config.json"),
        dir.path(),
    )
    .unwrap();

    let notifier = Arc::new(RecordingNotifier::default());
    let motd = Arc::new(MotdProbe::new(notifier.clone() as Arc<dyn Notifier>));
    let supervisor = Arc::new(
        FrpsSupervisor::new(config, dir.path().join("bin"), dir.path().join("frps.toml"))
            .unwrap(),
    );

    let app = Arc::new(App {
        state: Arc::new(Mutex::new(state)),
        notifier: notifier.clone() as Arc<dyn Notifier>,
        motd,
        supervisor,
        rate_limiter: Arc::new(RateLimiter::new()),
        updater: Arc::new(UpdateService::new(dir.path().to_path_buf())),
    });

    Harness {
        app,
        notifier,
        _dir: dir,
    }
}

fn loopback() -> SocketAddr {
    "127.0.0.1:45678".parse().unwrap()
}

async fn post_json(app: &Arc<App>, uri: &str, peer: SocketAddr, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .extension(ConnectInfo(peer))
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = build_router(Arc::clone(app)).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn get_json(app: &Arc<App>, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("GET")
        .uri(uri)
        .extension(ConnectInfo(loopback()))
        .body(Body::empty())
        .unwrap();
    let response = build_router(Arc::clone(app)).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn plugin(app: &Arc<App>, peer: SocketAddr, op: &str, content: Value) -> (StatusCode, Value) {
    post_json(
        app,
        "/frps-plugin/handler",
        peer,
        json!({ "version": "0.1.0", "op": op, "content": content }),
    )
    .await
}

#[tokio::test]
async fn test_create_validate_activate_flow() {
    let h = harness();
    let now = Utc::now();

    let cred = {
        let mut state = h.app.state.lock().await;
        state
            .create_credential("u1", "Alice", Some("g1"), GameType::Minecraft, 60, now)
            .unwrap()
    };
    assert_eq!(cred.id, 1);
    assert_eq!(cred.proxy_name, "ff-1-mine");
    assert!((10000..=10002).contains(&cred.remote_port));

    // client validates the pending key
    let (status, body) = post_json(
        &h.app,
        "/api/v1/validate",
        "203.0.113.9:5000".parse().unwrap(),
        json!({ "key": cred.key }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], json!(true));
    assert_eq!(body["data"]["frps_port"], json!(7000));
    assert_eq!(body["data"]["remote_port"], json!(cred.remote_port));
    assert_eq!(body["data"]["proxy_name"], json!("ff-1-mine"));
    // validate performed no transition
    {
        let state = h.app.state.lock().await;
        assert_eq!(
            state.get_by_key(&cred.key).unwrap().status,
            CredentialStatus::Pending
        );
    }

    // frps Login activates
    let (status, body) = plugin(
        &h.app,
        loopback(),
        "Login",
        json!({ "metas": { "access_key": cred.key }, "run_id": "r1" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["reject"], json!(false));
    assert_eq!(body["unchange"], json!(true));
    {
        let state = h.app.state.lock().await;
        let row = state.get_by_key(&cred.key).unwrap();
        assert_eq!(row.status, CredentialStatus::Active);
        assert_eq!(row.client_id.as_deref(), Some("r1"));
    }

    // connected notification went out (fire-and-forget task)
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    {
        let connected = h.notifier.connected.lock().unwrap();
        assert_eq!(connected.len(), 1);
        assert_eq!(connected[0].group_id, "g1");
        assert_eq!(
            connected[0].endpoint,
            format!("play.example.com:{}", cred.remote_port)
        );
    }
    // minecraft probe scheduled
    assert_eq!(h.app.motd.pending_count(), 1);

    // NewProxy with the right tuple is allowed
    let (_, body) = plugin(
        &h.app,
        loopback(),
        "NewProxy",
        json!({
            "user": { "metas": { "access_key": cred.key } },
            "proxy_name": "ff-1-mine",
            "proxy_type": "tcp",
            "remote_port": cred.remote_port,
        }),
    )
    .await;
    assert_eq!(body["reject"], json!(false));

    // udp is not
    let (_, body) = plugin(
        &h.app,
        loopback(),
        "NewProxy",
        json!({
            "user": { "metas": { "access_key": cred.key } },
            "proxy_name": "ff-1-mine",
            "proxy_type": "udp",
            "remote_port": cred.remote_port,
        }),
    )
    .await;
    assert_eq!(body["reject"], json!(true));
}

#[tokio::test]
async fn test_expiry_drives_ping_rejection() {
    let h = harness();
    let past = Utc::now() - ChronoDuration::minutes(10);

    let cred = {
        let mut state = h.app.state.lock().await;
        let cred = state
            .create_credential("u1", "Alice", None, GameType::Minecraft, 5, past)
            .unwrap();
        state.activate_credential(&cred.key, "r1", past).unwrap();
        cred
    };

    // one scheduler tick
    assert_eq!(scan_once(&h.app.state).await, 1);
    {
        let state = h.app.state.lock().await;
        assert_eq!(
            state.get_by_key(&cred.key).unwrap().status,
            CredentialStatus::Expired
        );
        assert!(state.reject.contains(&cred.key));
    }

    let (_, body) = plugin(
        &h.app,
        loopback(),
        "Ping",
        json!({ "user": { "metas": { "access_key": cred.key } } }),
    )
    .await;
    assert_eq!(body["reject"], json!(true));
    assert_eq!(body["reject_reason"], json!("Access key has expired"));
}

#[tokio::test]
async fn test_close_proxy_disconnects() {
    let h = harness();
    let now = Utc::now();

    let cred = {
        let mut state = h.app.state.lock().await;
        let cred = state
            .create_credential("u1", "Alice", Some("g1"), GameType::Minecraft, 60, now)
            .unwrap();
        state.activate_credential(&cred.key, "r1", now).unwrap();
        cred
    };
    h.app.motd.schedule(
        cred.tunnel_id.clone(),
        Some("g1".to_string()),
        "play.example.com".to_string(),
        cred.remote_port,
    );

    let (_, body) = plugin(
        &h.app,
        loopback(),
        "CloseProxy",
        json!({
            "user": { "metas": { "access_key": cred.key } },
            "proxy_name": cred.proxy_name,
        }),
    )
    .await;
    // CloseProxy always allows
    assert_eq!(body["reject"], json!(false));

    {
        let state = h.app.state.lock().await;
        assert_eq!(
            state.get_by_key(&cred.key).unwrap().status,
            CredentialStatus::Disconnected
        );
        assert!(state.reject.contains(&cred.key));
    }
    assert_eq!(h.app.motd.pending_count(), 0);

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(h.notifier.disconnected.lock().unwrap().len(), 1);

    // a disconnected key can never come back
    let (_, body) = plugin(
        &h.app,
        loopback(),
        "Login",
        json!({ "metas": { "access_key": cred.key }, "run_id": "r2" }),
    )
    .await;
    assert_eq!(body["reject"], json!(true));
}

#[tokio::test]
async fn test_plugin_rejects_non_loopback() {
    let h = harness();
    let (status, _) = plugin(
        &h.app,
        "198.51.100.7:9999".parse().unwrap(),
        "Ping",
        json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_plugin_never_default_allows() {
    let h = harness();

    // Login without a key
    let (_, body) = plugin(&h.app, loopback(), "Login", json!({})).await;
    assert_eq!(body["reject"], json!(true));

    // NewProxy without a key
    let (_, body) = plugin(&h.app, loopback(), "NewProxy", json!({})).await;
    assert_eq!(body["reject"], json!(true));

    // unknown keys
    let (_, body) = plugin(
        &h.app,
        loopback(),
        "Login",
        json!({ "metas": { "access_key": "ff-nope" } }),
    )
    .await;
    assert_eq!(body["reject"], json!(true));

    // unknown op
    let (_, body) = plugin(&h.app, loopback(), "Exec", json!({})).await;
    assert_eq!(body["reject"], json!(true));

    // Ping without a key is the one documented allow
    let (_, body) = plugin(&h.app, loopback(), "Ping", json!({})).await;
    assert_eq!(body["reject"], json!(false));
}

#[tokio::test]
async fn test_validate_error_mapping() {
    let h = harness();
    let now = Utc::now();
    let peer: SocketAddr = "203.0.113.20:1000".parse().unwrap();

    // unknown
    let (status, body) = post_json(&h.app, "/api/v1/validate", peer, json!({ "key": "ff-missing" })).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], json!("KEY_NOT_FOUND"));

    // malformed
    let (status, body) = post_json(&h.app, "/api/v1/validate", peer, json!({ "key": "bad key!" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], json!("INVALID_REQUEST"));

    // active -> already used
    let cred = {
        let mut state = h.app.state.lock().await;
        let cred = state
            .create_credential("u1", "Alice", None, GameType::Terraria, 60, now)
            .unwrap();
        state.activate_credential(&cred.key, "r1", now).unwrap();
        cred
    };
    let (status, body) = post_json(&h.app, "/api/v1/validate", peer, json!({ "key": cred.key })).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], json!("KEY_ALREADY_USED"));

    // revoked
    {
        let mut state = h.app.state.lock().await;
        state.revoke_credential(cred.id, now).unwrap();
    }
    let (status, body) = post_json(&h.app, "/api/v1/validate", peer, json!({ "key": cred.key })).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], json!("KEY_REVOKED"));
}

#[tokio::test]
async fn test_validate_rate_limited_on_21st() {
    let h = harness();
    let peer: SocketAddr = "203.0.113.50:2000".parse().unwrap();

    for i in 0..20 {
        let (status, body) =
            post_json(&h.app, "/api/v1/validate", peer, json!({ "key": "ff-missing" })).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "request {}", i + 1);
        assert_eq!(body["error"]["code"], json!("KEY_NOT_FOUND"));
    }

    let (status, body) =
        post_json(&h.app, "/api/v1/validate", peer, json!({ "key": "ff-missing" })).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["code"], json!("RATE_LIMITED"));
    // no bucket internals leak
    assert!(body["error"]["message"].as_str().unwrap().len() < 64);

    // a different IP is unaffected
    let other: SocketAddr = "203.0.113.51:2000".parse().unwrap();
    let (status, _) =
        post_json(&h.app, "/api/v1/validate", other, json!({ "key": "ff-missing" })).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_server_info_and_health() {
    let h = harness();

    let (status, body) = get_json(&h.app, "/api/v1/server-info").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], json!(true));
    assert_eq!(body["data"]["id"], json!("firefrp-1"));
    assert_eq!(body["data"]["public_addr"], json!("play.example.com"));
    assert_eq!(body["data"]["update_channel"], json!("auto"));
    assert!(body["data"]["client_version"].is_string());

    let (status, body) = get_json(&h.app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("ok"));
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn test_unknown_route_gets_envelope() {
    let h = harness();
    let (status, body) = get_json(&h.app, "/api/v1/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["ok"], json!(false));
}
