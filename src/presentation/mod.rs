// Presentation layer - HTTP surface over the synchronizer
pub mod app_state;
pub mod handlers;

use crate::presentation::app_state::AppState;
use crate::presentation::handlers::{
    get_catalog, get_status, get_view, health_check, post_metric, post_refresh_catalog,
    put_query, put_selected, stream_view,
};
use axum::{
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/view", get(get_view))
        .route("/view/stream", get(stream_view))
        .route("/catalog", get(get_catalog))
        .route("/catalog/selected", put(put_selected))
        .route("/catalog/refresh", post(post_refresh_catalog))
        .route("/query", put(put_query))
        .route("/metrics", post(post_metric))
        .route("/status", get(get_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
