//! HTTP router
//!
//! ```text
//! GET  /ws?resourceId=<id>   subscriber WebSocket
//! POST /broadcast            producer push (http upstream mode only)
//! GET  /health               liveness
//! GET  /api/stats            hub counters
//! GET  /metrics              Prometheus
//! GET  /*                    static files, when configured
//! ```

pub mod broadcast;
pub mod error;
pub mod health;
pub mod stats;
pub mod websocket;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use feedrelay_hub::{BroadcastEngine, UpdateSink};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

pub use error::{AppError, AppResult};

/// Credential and queue backing `POST /broadcast`
#[derive(Clone)]
pub struct PushState {
    pub sink: UpdateSink,
    pub push_key: Arc<str>,
}

impl PushState {
    pub fn new(sink: UpdateSink, push_key: impl Into<Arc<str>>) -> Self {
        Self {
            sink,
            push_key: push_key.into(),
        }
    }
}

/// Shared state for all handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<BroadcastEngine>,
    /// Present only when producers push over HTTP
    pub push: Option<PushState>,
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState, static_dir: Option<&str>) -> Router {
    let mut router = Router::new()
        .route("/ws", get(websocket::websocket_handler))
        .merge(health::create_health_router())
        .merge(stats::create_stats_router());

    if state.push.is_some() {
        router = router.route("/broadcast", post(broadcast::broadcast_handler));
    }

    if let Some(dir) = static_dir {
        router = router.fallback_service(ServeDir::new(dir));
    }

    router
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
