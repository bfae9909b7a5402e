//! HTTP surface
//!
//! One listener hosts the client API, the frps plugin callback and the health
//! endpoint. Unknown routes and uncaught failures all produce the JSON error
//! envelope; nothing internal leaks into a response body.

pub mod client_api;
pub mod plugin;
pub mod rate_limit;

use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;

use crate::app::App;

pub use rate_limit::RateLimiter;

async fn fallback() -> axum::response::Response {
    (
        axum::http::StatusCode::NOT_FOUND,
        Json(json!({
            "ok": false,
            "error": { "code": "NOT_FOUND", "message": "Not found" }
        })),
    )
        .into_response()
}

pub fn build_router(app: Arc<App>) -> Router {
    Router::new()
        .route("/api/v1/validate", post(client_api::validate))
        .route("/api/v1/server-info", get(client_api::server_info))
        .route("/health", get(client_api::health))
        .route("/frps-plugin/handler", post(plugin::handler))
        .fallback(fallback)
        .with_state(app)
}
