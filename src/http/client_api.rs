//! Client-facing HTTP API
//!
//! `POST /api/v1/validate` hands a tunnel client its frps connection
//! parameters, `GET /api/v1/server-info` serves discovery, `GET /health` is
//! the liveness probe. Validation performs no state transition — activation
//! is driven by the plugin Login callback.

use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::app::App;
use crate::error::AppError;
use crate::logger::{key_prefix, log};

const MAX_KEY_LEN: usize = 128;

#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    #[serde(default)]
    pub key: String,
}

#[derive(Debug, Serialize)]
pub struct ValidateData {
    pub frps_addr: String,
    pub frps_port: u16,
    pub remote_port: u16,
    pub token: String,
    pub proxy_name: String,
    pub expires_at: String,
}

/// Error-envelope response. Never echoes exception text or request bodies.
pub fn error_response(err: &AppError) -> Response {
    let status = err.http_status();
    let message = if status == 500 {
        "Internal server error".to_string()
    } else {
        err.to_string()
    };
    let body = json!({
        "ok": false,
        "error": { "code": err.code(), "message": message }
    });
    (
        axum::http::StatusCode::from_u16(status)
            .unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR),
        Json(body),
    )
        .into_response()
}

fn is_valid_key_shape(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// `POST /api/v1/validate`
pub async fn validate(
    State(app): State<Arc<App>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Option<Json<ValidateRequest>>,
) -> Response {
    if !app.rate_limiter.allow(peer.ip()) {
        return error_response(&AppError::RateLimited);
    }

    let Some(Json(request)) = body else {
        return error_response(&AppError::InvalidRequest("missing JSON body".to_string()));
    };
    if !is_valid_key_shape(&request.key) {
        return error_response(&AppError::InvalidRequest("malformed key".to_string()));
    }

    let now = Utc::now();
    let mut state = app.state.lock().await;
    match state.validate_key(&request.key, now) {
        Ok(cred) => {
            let frps = &state.config.frps;
            let frps_addr = if frps.bind_addr != "0.0.0.0" {
                frps.bind_addr.clone()
            } else {
                host_from_headers(&headers).unwrap_or_else(|| state.config.server.public_addr.clone())
            };
            let data = ValidateData {
                frps_addr,
                frps_port: frps.bind_port,
                remote_port: cred.remote_port,
                token: frps.auth_token.clone(),
                proxy_name: cred.proxy_name.clone(),
                expires_at: cred.expires_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            };
            drop(state);
            log::debug!(key = key_prefix(&request.key), "Key validated");
            Json(json!({ "ok": true, "data": data })).into_response()
        }
        Err(err) => {
            drop(state);
            log::debug!(
                key = key_prefix(&request.key),
                code = err.code(),
                "Key validation refused"
            );
            error_response(&err)
        }
    }
}

/// Host header without any port suffix.
fn host_from_headers(headers: &HeaderMap) -> Option<String> {
    let host = headers.get(axum::http::header::HOST)?.to_str().ok()?;
    let host = host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host);
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

/// `GET /api/v1/server-info`
pub async fn server_info(State(app): State<Arc<App>>) -> Response {
    let state = app.state.lock().await;
    let server = &state.config.server;
    let body = json!({
        "ok": true,
        "data": {
            "id": server.id,
            "name": server.name,
            "public_addr": server.public_addr,
            "description": server.description,
            "client_version": env!("CARGO_PKG_VERSION"),
            "update_channel": state.config.updates.channel.as_str(),
        }
    });
    Json(body).into_response()
}

/// `GET /health`
pub async fn health() -> Response {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    }))
    .into_response()
}
