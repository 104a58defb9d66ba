use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::EngineError;
use crate::log_capture::{LogLevel, LogSource};
use crate::speed_test::{format_speed, SpeedTestContext, SpeedTestResult};
use crate::state::SharedState;

#[derive(Deserialize)]
pub struct HistoryQuery {
    limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamQuery {
    #[serde(default)]
    vpn_active: bool,
    #[serde(default)]
    server_name: Option<String>,
}

async fn log_result(state: &SharedState, result: &SpeedTestResult) {
    state
        .logs
        .emit(
            LogSource::SpeedTest,
            LogLevel::Info,
            format!(
                "Speed test: down {}, up {}, latency {:.0}ms, jitter {}ms",
                format_speed(result.download_mbps),
                format_speed(result.upload_mbps),
                result.latency_ms,
                result.jitter_ms
            ),
        )
        .await;
}

/// POST /speed-test — run all three phases and return the saved result.
pub async fn run_speed_test(
    State(state): State<SharedState>,
    Json(context): Json<SpeedTestContext>,
) -> Result<Json<SpeedTestResult>, EngineError> {
    let result = state.probe.run_speed_test(context, None).await?;
    log_result(&state, &result).await;
    Ok(Json(result))
}

/// GET /speed-test/stream — SSE of progress events for a new run.
///
/// The slot is claimed before the response is returned, so a 200 stream
/// always belongs to a run that is actually going.
pub async fn speed_test_stream(
    State(state): State<SharedState>,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>, EngineError> {
    let permit = state
        .probe
        .try_reserve()
        .ok_or(EngineError::SpeedTestInProgress)?;

    let (tx, rx) = mpsc::unbounded_channel();
    let context = SpeedTestContext {
        vpn_active: query.vpn_active,
        server_name: query.server_name,
    };

    let run_state = state.clone();
    tokio::spawn(async move {
        let result = run_state.probe.run_reserved(permit, context, Some(tx)).await;
        log_result(&run_state, &result).await;
    });

    let events = UnboundedReceiverStream::new(rx).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok::<_, Infallible>(Event::default().event("progress").data(data))
    });
    Ok(Sse::new(state.until_shutdown(events)).keep_alive(KeepAlive::default()))
}

/// GET /speed-test/status
pub async fn speed_test_status(State(state): State<SharedState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "running": state.probe.is_running(),
    }))
}

/// GET /speed-test/history — most recent first.
pub async fn speed_test_history(
    State(state): State<SharedState>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let mut results = state.history.get_history().await;
    let total = results.len();
    if let Some(limit) = query.limit {
        results.truncate(limit);
    }

    Json(serde_json::json!({
        "results": results,
        "total": total,
        "max": state.history.max_size(),
    }))
}

/// DELETE /speed-test/history
pub async fn clear_speed_test_history(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, EngineError> {
    state.history.clear_history().await?;
    state
        .logs
        .emit(LogSource::Store, LogLevel::Info, "Speed test history cleared")
        .await;
    Ok(Json(serde_json::json!({
        "status": "cleared"
    })))
}
