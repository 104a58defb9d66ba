use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::diagnostics::{DiagnosticResult, DiagnosticStep, StepStatus};
use crate::error::EngineError;
use crate::log_capture::{LogLevel, LogSource};
use crate::network::ServerTarget;
use crate::state::SharedState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    /// `host:port` of the VPN server; omitted when none is selected.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub server_name: Option<String>,
    #[serde(default)]
    pub sni: Option<String>,
}

impl RunRequest {
    pub fn server_target(&self) -> Result<Option<ServerTarget>, EngineError> {
        let Some(spec) = self.target.as_deref().filter(|s| !s.trim().is_empty()) else {
            return Ok(None);
        };
        let mut target: ServerTarget = spec.parse().map_err(EngineError::InvalidTarget)?;
        if let Some(name) = &self.server_name {
            target = target.with_name(name.clone());
        }
        if let Some(sni) = &self.sni {
            target = target.with_sni(sni.clone());
        }
        Ok(Some(target))
    }
}

#[derive(Deserialize)]
pub struct RecentQuery {
    #[serde(default = "default_limit")]
    limit: usize,
    status: Option<StepStatus>,
}

fn default_limit() -> usize {
    20
}

async fn record_run(
    state: &SharedState,
    target: Option<&ServerTarget>,
    result: DiagnosticResult,
) -> serde_json::Value {
    let label = target.map(|t| t.label());
    let level = match result.overall_status() {
        StepStatus::Failed => LogLevel::Warn,
        _ => LogLevel::Info,
    };
    state
        .logs
        .emit(
            LogSource::Pipeline,
            level,
            format!(
                "Diagnostics{}: {}",
                label.as_deref().map(|l| format!(" for {}", l)).unwrap_or_default(),
                result.summary()
            ),
        )
        .await;
    let report = state.journal.write().await.record(label, result);
    serde_json::to_value(&report).unwrap_or_default()
}

/// POST /diagnostics/run — run all six steps and return the aggregate.
pub async fn run_diagnostics(
    State(state): State<SharedState>,
    Json(req): Json<RunRequest>,
) -> Result<impl IntoResponse, EngineError> {
    let target = req.server_target()?;
    let result = state.pipeline.run_full_diagnostics(target.clone()).await;
    let report = record_run(&state, target.as_ref(), result).await;
    Ok(Json(report))
}

/// GET /diagnostics/stream — SSE of each step as it completes, then the report.
pub async fn diagnostics_stream(
    State(state): State<SharedState>,
    Query(req): Query<RunRequest>,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>, EngineError> {
    let target = req.server_target()?;
    // Capacity 1 keeps the pipeline at most one step ahead of the client.
    let (tx, rx) = mpsc::channel::<Event>(1);
    let shutdown_scope = state.clone();

    tokio::spawn(async move {
        let ran_at = Utc::now();
        let start = Instant::now();
        let mut steps_stream = state.pipeline.run_diagnostics(target.clone());
        let mut steps: Vec<DiagnosticStep> = Vec::with_capacity(6);

        while let Some(step) = steps_stream.next().await {
            let data = serde_json::to_string(&step).unwrap_or_default();
            if tx.send(Event::default().event("step").data(data)).await.is_err() {
                debug!("Diagnostics stream client went away after {} steps", steps.len());
                return;
            }
            steps.push(step);
        }

        let result = DiagnosticResult::new(steps, ran_at, start.elapsed());
        let report = record_run(&state, target.as_ref(), result).await;
        let _ = tx
            .send(Event::default().event("complete").data(report.to_string()))
            .await;
    });

    let events = ReceiverStream::new(rx).map(Ok::<Event, Infallible>);
    Ok(Sse::new(shutdown_scope.until_shutdown(events)).keep_alive(KeepAlive::default()))
}

/// GET /diagnostics/recent — newest runs first, optionally by overall status.
pub async fn recent_diagnostics(
    State(state): State<SharedState>,
    Query(query): Query<RecentQuery>,
) -> impl IntoResponse {
    let limit = query.limit.min(100);
    let journal = state.journal.read().await;
    let reports = journal.recent(limit, query.status);
    let total = journal.len();

    Json(serde_json::json!({
        "reports": reports,
        "total": total
    }))
}

/// DELETE /diagnostics/recent
pub async fn clear_diagnostics(State(state): State<SharedState>) -> impl IntoResponse {
    state.journal.write().await.clear();
    Json(serde_json::json!({
        "status": "cleared"
    }))
}
