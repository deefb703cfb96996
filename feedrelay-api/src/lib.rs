//! HTTP and WebSocket surface of the relay

pub mod http;

pub use http::{create_router, AppState, PushState};
