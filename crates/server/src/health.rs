//! Unauthenticated health endpoint.

use axum::{Json, http::StatusCode, response::IntoResponse};

pub(crate) async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}
