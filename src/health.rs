//! Health endpoint: GET /healthz with version, uptime and whether a session is stored.

use crate::api::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct HealthBody {
    pub status: String,
    pub version: String,
    pub uptime_secs: f64,
    pub session_present: bool,
}

fn version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

pub async fn build_health_body(state: &AppState) -> HealthBody {
    HealthBody {
        status: "ok".to_string(),
        version: version(),
        uptime_secs: state.started_at.elapsed().as_secs_f64(),
        session_present: state.session.get().await.is_some(),
    }
}

/// Handler for GET /healthz: always 200 while the process serves requests.
pub async fn healthz_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = build_health_body(state.as_ref()).await;
    (StatusCode::OK, axum::Json(body))
}
