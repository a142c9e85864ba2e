use axum::{
    extract::{Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use tracing::warn;

/// API keys accepted by the gateway. No keys means no authentication.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub api_keys: Vec<String>,
}

impl AuthConfig {
    pub fn new(api_keys: Vec<String>) -> Self {
        Self { api_keys }
    }

    pub fn is_enabled(&self) -> bool {
        !self.api_keys.is_empty()
    }

    fn accepts(&self, key: &str) -> bool {
        self.api_keys.iter().any(|k| k == key)
    }
}

#[derive(serde::Deserialize, Default)]
pub struct AuthQuery {
    pub api_key: Option<String>,
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "error": message, "kind": "unauthorized" })),
    )
        .into_response()
}

/// Checks `Authorization: Bearer <key>` first, then `?api_key=<key>`
/// (browsers cannot set headers on WebSocket upgrades).
pub async fn auth_middleware(
    State(auth): State<Arc<AuthConfig>>,
    headers: HeaderMap,
    query: Query<AuthQuery>,
    request: Request,
    next: Next,
) -> Response {
    if !auth.is_enabled() {
        return next.run(request).await;
    }

    let key = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .or_else(|| query.api_key.clone());

    match key {
        Some(k) if auth.accepts(&k) => next.run(request).await,
        Some(_) => {
            warn!(path = %request.uri().path(), "Rejected request: invalid API key");
            unauthorized("Invalid API key")
        }
        None => {
            warn!(path = %request.uri().path(), "Rejected request: missing API key");
            unauthorized("API key required")
        }
    }
}
