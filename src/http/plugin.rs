//! frps plugin callback handler
//!
//! Single endpoint `POST /frps-plugin/handler` servicing Login, NewProxy,
//! Ping and CloseProxy. frps is always a local subprocess, so any peer that
//! is not loopback gets a 403. The handler never default-allows: a missing or
//! unknown access key, an unexpected body shape, or an internal failure all
//! reply reject (with the one documented Ping cannot-attribute exception).
//!
//! Side-effect notifications run after the state lock is released,
//! fire-and-forget, so a slow chat gateway can never stall the daemon's
//! synchronous callback.

use axum::extract::{ConnectInfo, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::app::App;
use crate::core::credential::{AuditEvent, Credential, CredentialStatus};
use crate::core::state::TunnelNotice;
use crate::error::AppError;
use crate::logger::log;

#[derive(Debug, Deserialize)]
pub struct PluginRequest {
    #[allow(dead_code)]
    #[serde(default)]
    pub version: String,
    pub op: String,
    #[serde(default)]
    pub content: Value,
}

fn allow() -> Response {
    Json(json!({ "reject": false, "reject_reason": "", "unchange": true })).into_response()
}

fn reject(reason: &str) -> Response {
    Json(json!({ "reject": true, "reject_reason": reason })).into_response()
}

/// Loopback check covering v4, v6 and v4-mapped-in-v6 peers.
fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => {
            v6.is_loopback() || v6.to_ipv4_mapped().map(|v4| v4.is_loopback()).unwrap_or(false)
        }
    }
}

/// Reason a credential must be refused, phrased for the daemon's log.
fn refusal_reason(status: CredentialStatus) -> &'static str {
    match status {
        CredentialStatus::Expired => "Access key has expired",
        CredentialStatus::Revoked => "Access key has been revoked",
        CredentialStatus::Disconnected => "Access key tunnel has disconnected",
        _ => "Access key rejected",
    }
}

/// Deferred side effects, applied after the state lock is released.
#[derive(Default)]
struct SideEffects {
    connected: Option<TunnelNotice>,
    disconnected: Option<TunnelNotice>,
    motd_schedule: Option<(String, Option<String>, String, u16)>,
    motd_cancel: Option<String>,
}

fn notice_for(cred: &Credential, endpoint: String) -> Option<TunnelNotice> {
    let group_id = cred.group_id.clone()?;
    Some(TunnelNotice {
        tunnel_id: cred.tunnel_id.clone(),
        group_id,
        user_id: cred.user_id.clone(),
        user_name: cred.user_name.clone(),
        endpoint,
        game_name: cred.game_type.display_name().to_string(),
    })
}

pub async fn handler(
    State(app): State<Arc<App>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: Option<Json<PluginRequest>>,
) -> Response {
    if !is_loopback(peer.ip()) {
        log::warn!(peer = %peer, "Plugin request from non-loopback peer");
        return axum::http::StatusCode::FORBIDDEN.into_response();
    }

    let Some(Json(request)) = body else {
        return reject("Malformed plugin request");
    };

    let now = Utc::now();
    let mut effects = SideEffects::default();
    let response = {
        let mut state = app.state.lock().await;
        match request.op.as_str() {
            "Login" => handle_login(&mut state, &request.content, now, &mut effects),
            "NewProxy" => handle_new_proxy(&mut state, &request.content, now),
            "Ping" => handle_ping(&mut state, &request.content, now),
            "CloseProxy" => handle_close_proxy(&mut state, &request.content, now, &mut effects),
            other => {
                log::warn!(op = other, "Unknown plugin op");
                reject("Unknown operation")
            }
        }
    };

    // fire-and-forget: the daemon is waiting on this reply
    if let Some(notice) = effects.connected {
        let notifier = Arc::clone(&app.notifier);
        tokio::spawn(async move { notifier.tunnel_connected(notice).await });
    }
    if let Some(notice) = effects.disconnected {
        let notifier = Arc::clone(&app.notifier);
        tokio::spawn(async move { notifier.tunnel_disconnected(notice).await });
    }
    if let Some((tunnel_id, group_id, addr, port)) = effects.motd_schedule {
        app.motd.schedule(tunnel_id, group_id, addr, port);
    }
    if let Some(tunnel_id) = effects.motd_cancel {
        app.motd.cancel(&tunnel_id);
    }

    response
}

fn login_key(content: &Value) -> Option<String> {
    content
        .pointer("/metas/access_key")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn user_meta_key(content: &Value) -> Option<String> {
    content
        .pointer("/user/metas/access_key")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn handle_login(
    state: &mut crate::core::state::CoreState,
    content: &Value,
    now: DateTime<Utc>,
    effects: &mut SideEffects,
) -> Response {
    let Some(key) = login_key(content) else {
        state.append_audit(AuditEvent::ClientRejected, None, "Login: missing key", now);
        log::plugin_decision("Login", "", false, "missing access key");
        return reject("Missing access key");
    };
    let run_id = content
        .pointer("/run_id")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let Some(cred) = state.get_by_key(&key).cloned() else {
        state.append_audit(AuditEvent::ClientRejected, None, "Login: unknown key", now);
        log::plugin_decision("Login", &key, false, "unknown key");
        return reject(&AppError::KeyNotFound.to_string());
    };

    if cred.expires_at <= now {
        state.reject.add(&key, now);
        state.append_audit(
            AuditEvent::ClientRejected,
            Some(cred.id),
            "Login: expired",
            now,
        );
        log::plugin_decision("Login", &key, false, "expired");
        return reject(&AppError::KeyExpired.to_string());
    }

    match cred.status {
        CredentialStatus::Expired | CredentialStatus::Revoked | CredentialStatus::Disconnected => {
            state.append_audit(
                AuditEvent::ClientRejected,
                Some(cred.id),
                format!("Login: {}", cred.status.as_str()),
                now,
            );
            log::plugin_decision("Login", &key, false, cred.status.as_str());
            reject(refusal_reason(cred.status))
        }
        // the same client reconnecting with a live session is fine
        CredentialStatus::Active => {
            log::plugin_decision("Login", &key, true, "");
            allow()
        }
        CredentialStatus::Pending => match state.activate_credential(&key, &run_id, now) {
            Ok(Some(active)) => {
                let endpoint = state.public_endpoint(active.remote_port);
                effects.connected = notice_for(&active, endpoint);
                if active.game_type == crate::games::GameType::Minecraft {
                    effects.motd_schedule = Some((
                        active.tunnel_id.clone(),
                        active.group_id.clone(),
                        state.config.server.public_addr.clone(),
                        active.remote_port,
                    ));
                }
                log::plugin_decision("Login", &key, true, "");
                allow()
            }
            Ok(None) => {
                log::plugin_decision("Login", &key, false, "activation raced");
                reject("Access key rejected")
            }
            Err(e) => {
                log::error!(error = %e, "Login activation failed");
                reject("Internal server error")
            }
        },
    }
}

fn handle_new_proxy(
    state: &mut crate::core::state::CoreState,
    content: &Value,
    now: DateTime<Utc>,
) -> Response {
    let Some(key) = user_meta_key(content) else {
        state.append_audit(AuditEvent::ClientRejected, None, "NewProxy: missing key", now);
        log::plugin_decision("NewProxy", "", false, "missing access key");
        return reject("Missing access key");
    };

    let Some(cred) = state.get_by_key(&key).cloned() else {
        state.append_audit(AuditEvent::ClientRejected, None, "NewProxy: unknown key", now);
        log::plugin_decision("NewProxy", &key, false, "unknown key");
        return reject(&AppError::KeyNotFound.to_string());
    };

    let proxy_name = content
        .pointer("/proxy_name")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let proxy_type = content
        .pointer("/proxy_type")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let remote_port = content.pointer("/remote_port").and_then(|v| v.as_u64());

    if proxy_name != cred.proxy_name {
        state.append_audit(
            AuditEvent::ClientRejected,
            Some(cred.id),
            format!("NewProxy: name {}", proxy_name),
            now,
        );
        log::plugin_decision("NewProxy", &key, false, "proxy name mismatch");
        return reject("Proxy name mismatch");
    }
    if remote_port != Some(cred.remote_port as u64) {
        state.append_audit(
            AuditEvent::ClientRejected,
            Some(cred.id),
            "NewProxy: port mismatch",
            now,
        );
        log::plugin_decision("NewProxy", &key, false, "remote port mismatch");
        return reject("Remote port mismatch");
    }
    if proxy_type != "tcp" {
        state.append_audit(
            AuditEvent::ClientRejected,
            Some(cred.id),
            format!("NewProxy: type {}", proxy_type),
            now,
        );
        log::plugin_decision("NewProxy", &key, false, "proxy type not tcp");
        return reject("Only tcp proxies are allowed");
    }

    state.append_audit(
        AuditEvent::ProxyOpened,
        Some(cred.id),
        cred.proxy_name.clone(),
        now,
    );
    log::plugin_decision("NewProxy", &key, true, "");
    allow()
}

fn handle_ping(
    state: &mut crate::core::state::CoreState,
    content: &Value,
    now: DateTime<Utc>,
) -> Response {
    // no key, nothing to attribute the ping to
    let Some(key) = user_meta_key(content) else {
        return allow();
    };

    if state.reject.contains(&key) {
        let reason = state
            .get_by_key(&key)
            .map(|c| refusal_reason(c.status))
            .unwrap_or("Access key rejected");
        log::plugin_decision("Ping", &key, false, "reject set");
        return reject(reason);
    }

    let Some(cred) = state.get_by_key(&key).cloned() else {
        log::plugin_decision("Ping", &key, false, "unknown key");
        return reject(&AppError::KeyNotFound.to_string());
    };

    if cred.status.is_terminal() {
        state.reject.add(&key, now);
        log::plugin_decision("Ping", &key, false, cred.status.as_str());
        return reject(refusal_reason(cred.status));
    }
    if cred.expires_at <= now {
        state.reject.add(&key, now);
        log::plugin_decision("Ping", &key, false, "expired");
        return reject(&AppError::KeyExpired.to_string());
    }

    allow()
}

fn handle_close_proxy(
    state: &mut crate::core::state::CoreState,
    content: &Value,
    now: DateTime<Utc>,
    effects: &mut SideEffects,
) -> Response {
    let Some(key) = user_meta_key(content) else {
        return allow();
    };

    let disconnected = match state.disconnect_credential(&key, now) {
        Ok(d) => d,
        Err(e) => {
            log::error!(error = %e, "CloseProxy transition failed");
            return reject("Internal server error");
        }
    };

    if let Some(cred) = disconnected {
        state.append_audit(
            AuditEvent::ProxyClosed,
            Some(cred.id),
            cred.proxy_name.clone(),
            now,
        );
        let endpoint = state.public_endpoint(cred.remote_port);
        effects.disconnected = notice_for(&cred, endpoint);
        effects.motd_cancel = Some(cred.tunnel_id.clone());
        log::plugin_decision("CloseProxy", &key, true, "");
    }

    allow()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_detection() {
        assert!(is_loopback("127.0.0.1".parse().unwrap()));
        assert!(is_loopback("::1".parse().unwrap()));
        assert!(is_loopback("::ffff:127.0.0.1".parse().unwrap()));
        assert!(!is_loopback("192.168.1.10".parse().unwrap()));
        assert!(!is_loopback("8.8.8.8".parse().unwrap()));
        assert!(!is_loopback("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn test_login_key_extraction() {
        let content = json!({ "metas": { "access_key": "ff-abc" }, "run_id": "r1" });
        assert_eq!(login_key(&content).as_deref(), Some("ff-abc"));

        let empty = json!({ "metas": { "access_key": "" } });
        assert_eq!(login_key(&empty), None);
        assert_eq!(login_key(&json!({})), None);
    }

    #[test]
    fn test_user_meta_key_extraction() {
        let content = json!({ "user": { "metas": { "access_key": "ff-xyz" } } });
        assert_eq!(user_meta_key(&content).as_deref(), Some("ff-xyz"));
        assert_eq!(user_meta_key(&json!({ "user": {} })), None);
        // wrong type must not panic
        assert_eq!(user_meta_key(&json!({ "user": { "metas": { "access_key": 7 } } })), None);
    }

    #[test]
    fn test_refusal_reasons() {
        assert_eq!(
            refusal_reason(CredentialStatus::Expired),
            "Access key has expired"
        );
        assert_eq!(
            refusal_reason(CredentialStatus::Revoked),
            "Access key has been revoked"
        );
        assert_eq!(
            refusal_reason(CredentialStatus::Disconnected),
            "Access key tunnel has disconnected"
        );
    }
}
