//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info};

use crate::api::state::AppState;
use crate::detect::DetectError;
use crate::storage::StoreError;
use crate::telemetry::LogLevel;
use crate::telemetry::ingest::{logs_from_inputs, metrics_from_inputs, IngestError, LogInput, MetricInput};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", post(ingest_metric))
        .route("/metrics/batch", post(ingest_metrics))
        .route("/metrics/services", get(list_services))
        .route("/metrics/service/{service}", get(service_metrics))
        .route("/metrics/latest/{metric}/{service}", get(latest_metric))
        .route("/logs", post(ingest_log))
        .route("/logs/batch", post(ingest_logs))
        .route("/logs/recent", get(recent_logs))
        .route("/logs/errors/{service}", get(service_errors))
        .route("/incidents", get(list_incidents))
        .route("/incidents/open", get(open_incidents))
        .route("/incidents/stats", get(incident_stats))
        .route("/incidents/service/{service}", get(incidents_by_service))
        .route("/incidents/{id}", get(get_incident))
        .route("/incidents/{id}/status", patch(update_status))
        .route("/admin/test-alert", post(test_alert))
        .route("/admin/trigger-detection", post(trigger_detection))
        .route("/admin/info", get(app_info))
}

/// Error body: `{"error": {"message": ...}}` with a matching status code.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": { "message": self.message } }))).into_response()
    }
}

impl From<DetectError> for ApiError {
    fn from(err: DetectError) -> Self {
        let status = match err {
            DetectError::InvalidStatus(_) => StatusCode::BAD_REQUEST,
            DetectError::DuplicateOpenIncident { .. } => StatusCode::CONFLICT,
            DetectError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, err.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        error!(error = %err, "storage failure while handling request");
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        ApiError::new(StatusCode::BAD_REQUEST, err.to_string())
    }
}

type ApiResult = Result<(StatusCode, Json<Value>), ApiError>;

fn ok(data: Value) -> ApiResult {
    Ok((StatusCode::OK, Json(json!({ "data": data }))))
}

fn created(data: Value) -> ApiResult {
    Ok((StatusCode::CREATED, Json(json!({ "data": data }))))
}

fn list<T: Serialize>(items: Vec<T>) -> ApiResult {
    let total = items.len();
    Ok((
        StatusCode::OK,
        Json(json!({ "data": items, "meta": { "total": total } })),
    ))
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": {
            "timestamp": Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

// ---------------------------------------------------------------------------
// Ingestion
// ---------------------------------------------------------------------------

async fn ingest_metric(State(state): State<AppState>, Json(input): Json<MetricInput>) -> ApiResult {
    let metric = input.into_metric(Utc::now())?;
    let id = state.metrics.record_metric(&metric).await?;
    debug!(
        metric = %metric.metric_name,
        value = metric.value,
        service = %metric.service_name,
        "ingested metric"
    );
    created(json!({ "id": id, "metric": metric }))
}

async fn ingest_metrics(State(state): State<AppState>, Json(inputs): Json<Vec<MetricInput>>) -> ApiResult {
    let metrics = metrics_from_inputs(inputs, Utc::now())?;
    let count = state.metrics.record_metrics(&metrics).await?;
    info!(count, "ingested batch of metrics");
    created(json!({ "ingested": count }))
}

async fn list_services(State(state): State<AppState>) -> ApiResult {
    let services = state.metrics.distinct_service_names().await?;
    ok(json!(services))
}

/// `?minutes=N` look-back for windowed reads.
#[derive(Debug, Default, Deserialize)]
struct WindowQuery {
    minutes: Option<u32>,
}

impl WindowQuery {
    fn since(&self, default_minutes: u32) -> DateTime<Utc> {
        let minutes = self.minutes.unwrap_or(default_minutes);
        Utc::now() - Duration::minutes(i64::from(minutes))
    }
}

async fn service_metrics(
    State(state): State<AppState>,
    Path(service): Path<String>,
    Query(window): Query<WindowQuery>,
) -> ApiResult {
    let metrics = state.metrics.metrics_for_service(&service, window.since(60)).await?;
    list(metrics)
}

async fn latest_metric(
    State(state): State<AppState>,
    Path((metric, service)): Path<(String, String)>,
) -> ApiResult {
    match state.metrics.latest_value(&metric, &service).await? {
        Some(m) => ok(json!(m)),
        None => Err(ApiError::new(StatusCode::NOT_FOUND, "no metric found")),
    }
}

async fn ingest_log(State(state): State<AppState>, Json(input): Json<LogInput>) -> ApiResult {
    let entry = input.into_entry(Utc::now())?;
    let id = state.metrics.record_log(&entry).await?;
    debug!(level = %entry.level, service = %entry.service_name, "ingested log entry");
    created(json!({ "id": id, "log": entry }))
}

async fn ingest_logs(State(state): State<AppState>, Json(inputs): Json<Vec<LogInput>>) -> ApiResult {
    let entries = logs_from_inputs(inputs, Utc::now())?;
    let count = state.metrics.record_logs(&entries).await?;
    info!(count, "ingested batch of log entries");
    created(json!({ "ingested": count }))
}

async fn recent_logs(State(state): State<AppState>, Query(window): Query<WindowQuery>) -> ApiResult {
    let entries = state.metrics.recent_logs(window.since(30)).await?;
    list(entries)
}

async fn service_errors(
    State(state): State<AppState>,
    Path(service): Path<String>,
    Query(window): Query<WindowQuery>,
) -> ApiResult {
    let entries = state
        .metrics
        .logs_by_level(&service, LogLevel::Error, window.since(60))
        .await?;
    list(entries)
}

// ---------------------------------------------------------------------------
// Incidents
// ---------------------------------------------------------------------------

async fn list_incidents(State(state): State<AppState>) -> ApiResult {
    list(state.incidents.list_all().await?)
}

async fn open_incidents(State(state): State<AppState>) -> ApiResult {
    list(state.incidents.list_open().await?)
}

async fn incidents_by_service(State(state): State<AppState>, Path(service): Path<String>) -> ApiResult {
    list(state.incidents.list_by_service(&service).await?)
}

async fn incident_stats(State(state): State<AppState>) -> ApiResult {
    ok(json!(state.incidents.stats().await?))
}

async fn get_incident(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    match state.incidents.get(id).await? {
        Some(incident) => ok(json!(incident)),
        None => Err(ApiError::new(StatusCode::NOT_FOUND, "incident not found")),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusUpdate {
    status: Option<String>,
    resolved_by: Option<String>,
    resolution_notes: Option<String>,
}

async fn update_status(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<StatusUpdate>,
) -> ApiResult {
    let status = match body.status.as_deref().map(str::trim) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => return Err(ApiError::new(StatusCode::BAD_REQUEST, "status is required")),
    };

    match state
        .incidents
        .update_status(id, &status, body.resolved_by, body.resolution_notes)
        .await?
    {
        Some(incident) => ok(json!(incident)),
        None => Err(ApiError::new(StatusCode::NOT_FOUND, "incident not found")),
    }
}

// ---------------------------------------------------------------------------
// Admin
// ---------------------------------------------------------------------------

async fn test_alert(State(state): State<AppState>) -> ApiResult {
    if state.alerts.send_test_alert().await {
        ok(json!({ "message": "test alert sent successfully" }))
    } else {
        Err(ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "failed to send test alert"))
    }
}

async fn trigger_detection(State(state): State<AppState>) -> ApiResult {
    match state.scheduler.trigger_now().await {
        Ok(summary) => ok(json!(summary)),
        Err(e) => Err(ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("detection failed: {:#}", e),
        )),
    }
}

async fn app_info(State(state): State<AppState>) -> ApiResult {
    ok(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "description": env!("CARGO_PKG_DESCRIPTION"),
        "checkIntervalSecs": state.scheduler.interval().as_secs(),
        "alertingEnabled": state.alerts.is_enabled(),
    }))
}
