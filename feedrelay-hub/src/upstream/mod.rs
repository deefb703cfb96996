//! Upstream bridge: asks producers for missing resources and feeds their
//! updates back into the broadcast engine
//!
//! ```text
//!  BroadcastEngine ──RequestQueue──▶ request pump ──▶ RequestTransport
//!        ▲                                            (HttpFetcher | RedisBus)
//!        │ publish()
//!   ingest task ◀──UpdateSink──── POST /broadcast | RedisBus update feed
//! ```

mod bridge;
mod http_fetcher;
mod queue;
mod redis_bus;

use async_trait::async_trait;
use feedrelay_core::models::ResourceRequest;

use crate::error::Result;

pub use bridge::UpstreamBridge;
pub use http_fetcher::HttpFetcher;
pub use queue::{RequestQueue, RequestReceiver, UpdateReceiver, UpdateSink};
pub use redis_bus::RedisBus;

/// Carries a "resource requested" signal to the producers
#[async_trait]
pub trait RequestTransport: Send + Sync {
    /// Short label used in logs
    fn name(&self) -> &'static str;

    async fn send_request(&self, request: &ResourceRequest) -> Result<()>;
}
