//! Error types for the relay hub

use feedrelay_core::models::{ResourceId, SessionId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Session {session_id} is already bound to resource {resource_id}")]
    SessionAlreadyBound {
        session_id: SessionId,
        resource_id: ResourceId,
    },

    #[error("Update queue is full")]
    UpdateQueueFull,

    #[error("Upstream bridge is not running")]
    BridgeClosed,

    #[error(transparent)]
    Core(#[from] feedrelay_core::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Upstream responded with status {0}")]
    UpstreamStatus(u16),

    #[error("Timeout: {0}")]
    Timeout(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;
