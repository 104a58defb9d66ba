use axum::routing::{get, post};
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::SharedState;

pub fn build_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health
        .route("/health", get(crate::routes::health::health))
        // Diagnostic pipeline
        .route(
            "/diagnostics/run",
            post(crate::routes::diagnostics::run_diagnostics),
        )
        .route(
            "/diagnostics/stream",
            get(crate::routes::diagnostics::diagnostics_stream),
        )
        .route(
            "/diagnostics/recent",
            get(crate::routes::diagnostics::recent_diagnostics)
                .delete(crate::routes::diagnostics::clear_diagnostics),
        )
        // Throughput probe
        .route("/speed-test", post(crate::routes::speed_test::run_speed_test))
        .route(
            "/speed-test/stream",
            get(crate::routes::speed_test::speed_test_stream),
        )
        .route(
            "/speed-test/status",
            get(crate::routes::speed_test::speed_test_status),
        )
        .route(
            "/speed-test/history",
            get(crate::routes::speed_test::speed_test_history)
                .delete(crate::routes::speed_test::clear_speed_test_history),
        )
        // Logs
        .route("/logs/history", get(crate::routes::logs::log_history))
        .route("/logs/stream", get(crate::routes::logs::log_stream))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
