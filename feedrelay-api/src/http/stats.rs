//! Operational endpoints: hub counters and Prometheus scrape

use axum::{
    extract::State,
    http::header::CONTENT_TYPE,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use feedrelay_hub::{metrics, HubStats};

use crate::http::AppState;

pub fn create_stats_router() -> Router<AppState> {
    Router::new()
        .route("/api/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
}

pub async fn stats_handler(State(state): State<AppState>) -> Json<HubStats> {
    Json(state.engine.stats())
}

pub async fn metrics_handler() -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        metrics::gather(),
    )
}
