//! Bearer-token authentication for the API surface.
//!
//! When an API key is configured, every `/api/*` request must carry
//! `Authorization: Bearer <key>`. `/health`, `/`, and `/daemon/status` stay
//! public.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::debug;

use crate::state::AppState;

/// Middleware applied to the `/api` router.
pub async fn require_bearer(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(key) = &state.api_key {
        let authorized = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|header| bearer_matches(header, key));

        if !authorized {
            debug!(path = %request.uri().path(), "rejecting unauthenticated API request");
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "missing or invalid API key" })),
            )
                .into_response();
        }
    }

    next.run(request).await
}

fn bearer_matches(header: &str, key: &str) -> bool {
    header
        .strip_prefix("Bearer ")
        .is_some_and(|token| token == key)
}
