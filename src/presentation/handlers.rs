// HTTP request handlers
use crate::application::synchronizer::SyncError;
use crate::domain::query_key::{Interval, QueryParams};
use crate::infrastructure::chunked_frames::chunked_json_stream;
use crate::infrastructure::wire::{self, CatalogDto, ViewDto};
use crate::presentation::app_state::AppState;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_stream::wrappers::WatchStream;

#[derive(Debug, Deserialize)]
pub struct QueryBody {
    #[serde(rename = "startDate", default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(rename = "endDate", default)]
    pub end_date: Option<DateTime<Utc>>,
    pub interval: String,
    #[serde(default)]
    pub include_zeros: bool,
}

#[derive(Debug, Deserialize)]
pub struct SelectBody {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct LogMetricBody {
    pub name: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct KeyResponse {
    pub key: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub phase: String,
    pub key: String,
    pub last_error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

pub struct ApiError(SyncError);

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SyncError::InvalidQuery(_) | SyncError::InvalidPoint(_) => StatusCode::BAD_REQUEST,
            SyncError::Closed => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_GATEWAY,
        };
        let body = MessageResponse {
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Health check endpoint
pub async fn health_check() -> &'static str {
    "ok"
}

/// Current view, 204 until the first series arrives
pub async fn get_view(State(state): State<Arc<AppState>>) -> Response {
    match state.sync.observer().current_view() {
        Some(view) => Json(wire::view_to_wire(&view)).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

pub async fn get_catalog(State(state): State<Arc<AppState>>) -> Json<CatalogDto> {
    Json(wire::catalog_to_wire(state.sync.observer().current_catalog()))
}

pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let observer = state.sync.observer();
    Json(StatusResponse {
        phase: observer.phase().to_string(),
        key: observer.active_key().encode(),
        last_error: observer.last_error().map(|e| e.to_string()),
    })
}

pub async fn put_query(
    State(state): State<Arc<AppState>>,
    Json(body): Json<QueryBody>,
) -> Result<Json<KeyResponse>, ApiError> {
    let interval: Interval = body
        .interval
        .parse()
        .map_err(|e| ApiError(SyncError::InvalidQuery(e)))?;
    let params =
        QueryParams::new(interval, body.include_zeros).with_range(body.start_date, body.end_date);

    let key = state.sync.set_query(params).await?;
    Ok(Json(KeyResponse { key: key.encode() }))
}

pub async fn put_selected(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SelectBody>,
) -> Result<Json<KeyResponse>, ApiError> {
    let key = state.sync.select_metric(body.name).await?;
    Ok(Json(KeyResponse { key: key.encode() }))
}

pub async fn post_refresh_catalog(
    State(state): State<Arc<AppState>>,
) -> Result<Json<CatalogDto>, ApiError> {
    let snapshot = state.sync.refresh_catalog().await?;
    Ok(Json(wire::catalog_to_wire(snapshot)))
}

/// Log a metric point. The value may be a JSON number or numeric text.
pub async fn post_metric(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LogMetricBody>,
) -> Result<Json<MessageResponse>, ApiError> {
    let raw_value = match &body.value {
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    state.sync.log_metric(&body.name, &raw_value).await?;
    Ok(Json(MessageResponse {
        message: "Metric logged successfully".to_string(),
    }))
}

/// Stream every view change as length-prefixed JSON frames
pub async fn stream_view(headers: HeaderMap, State(state): State<Arc<AppState>>) -> Response {
    // Check if client accepts Brotli compression
    let compress = headers
        .get("accept-encoding")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.contains("br"))
        .unwrap_or(false);

    let views = WatchStream::new(state.sync.observer().watch_view())
        .filter_map(|view| async move { view.as_ref().map(wire::view_to_wire) });

    match chunked_json_stream::<_, ViewDto>(views, compress) {
        Ok(response) => response,
        Err(status) => status.into_response(),
    }
}
