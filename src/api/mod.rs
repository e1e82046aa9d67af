//! HTTP surface of the daemon.
//!
//! Everything lives under `/api/v1`:
//! - `metrics/*` and `logs/*` ingest telemetry and serve windowed reads
//! - `incidents/*` lists incidents and moves them through their lifecycle
//! - `admin/*` holds operator actions (test alert, manual detection pass) and build info.
//!
//! Handlers answer with `{"data": ..}` (plus `"meta"` for lists) or
//! `{"error": {"message": ..}}`.

mod routes;
pub mod state;

use axum::http::StatusCode;
use axum::Router;
use tower_http::trace::TraceLayer;

use self::state::AppState;

/// Router over a shared [`AppState`], with request tracing on every route.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", routes::api_routes())
        .fallback(unknown_route)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn unknown_route() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "no such endpoint")
}
