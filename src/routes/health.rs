use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::state::SharedState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub speed_test_running: bool,
    pub history_size: usize,
    pub history_max: usize,
    pub recent_diagnostics: usize,
}

/// GET /health — liveness plus a snapshot of engine state.
pub async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let history_size = state.history.get_history().await.len();
    let recent_diagnostics = state.journal.read().await.len();

    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        speed_test_running: state.probe.is_running(),
        history_size,
        history_max: state.history.max_size(),
        recent_diagnostics,
    })
}
