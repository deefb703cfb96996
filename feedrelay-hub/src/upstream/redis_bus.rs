//! Redis pub/sub binding
//!
//! Requests are published on `request_channel` as `{"resourceId": ...}`.
//! Updates are read from `update_channel` and every message is trusted;
//! malformed ones are logged and skipped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use feedrelay_core::models::{ResourceRequest, ResourceUpdate};
use futures::stream::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client as RedisClient};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::queue::UpdateSink;
use super::RequestTransport;
use crate::error::{RelayError, Result};
use crate::metrics;

/// Timeout for connecting and subscribing
const REDIS_TIMEOUT_SECS: u64 = 5;

const INITIAL_BACKOFF_SECS: u64 = 1;

const MAX_BACKOFF_SECS: u64 = 30;

enum FeedExit {
    /// Was subscribed, then the connection dropped
    Disconnected,
    ConnectFailed(RelayError),
    Cancelled,
}

pub struct RedisBus {
    client: RedisClient,
    publisher: OnceCell<ConnectionManager>,
    request_channel: String,
    update_channel: String,
    cancel: CancellationToken,
}

impl RedisBus {
    pub fn new(
        url: &str,
        request_channel: impl Into<String>,
        update_channel: impl Into<String>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        Ok(Self {
            client: RedisClient::open(url)?,
            publisher: OnceCell::new(),
            request_channel: request_channel.into(),
            update_channel: update_channel.into(),
            cancel,
        })
    }

    async fn publisher(&self) -> Result<ConnectionManager> {
        let manager = self
            .publisher
            .get_or_try_init(|| async {
                match timeout(
                    Duration::from_secs(REDIS_TIMEOUT_SECS),
                    ConnectionManager::new(self.client.clone()),
                )
                .await
                {
                    Ok(Ok(manager)) => {
                        info!(channel = %self.request_channel, "Redis publisher connected");
                        Ok(manager)
                    }
                    Ok(Err(e)) => Err(RelayError::from(e)),
                    Err(_) => Err(RelayError::Timeout(
                        "connecting Redis publisher".to_string(),
                    )),
                }
            })
            .await?;
        Ok(manager.clone())
    }

    /// Read the update channel until cancelled, reconnecting with backoff
    pub fn spawn_update_feed(self: Arc<Self>, sink: UpdateSink) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut backoff_secs = INITIAL_BACKOFF_SECS;

            loop {
                match self.run_update_feed(&sink).await {
                    FeedExit::Cancelled => {
                        info!("Redis update feed cancelled");
                        return;
                    }
                    FeedExit::Disconnected => {
                        error!(
                            channel = %self.update_channel,
                            "Redis update feed lost its connection, reconnecting after {}s",
                            INITIAL_BACKOFF_SECS
                        );
                        backoff_secs = INITIAL_BACKOFF_SECS;
                    }
                    FeedExit::ConnectFailed(e) => {
                        error!(
                            error = %e,
                            backoff_secs = backoff_secs,
                            "Redis update feed failed to connect, retrying after backoff"
                        );
                    }
                }

                tokio::select! {
                    () = self.cancel.cancelled() => {
                        info!("Redis update feed cancelled during backoff");
                        return;
                    }
                    () = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                }

                backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
            }
        })
    }

    async fn run_update_feed(&self, sink: &UpdateSink) -> FeedExit {
        let mut pubsub = match timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            self.client.get_async_pubsub(),
        )
        .await
        {
            Ok(Ok(pubsub)) => pubsub,
            Ok(Err(e)) => return FeedExit::ConnectFailed(e.into()),
            Err(_) => {
                return FeedExit::ConnectFailed(RelayError::Timeout(
                    "getting Redis pub/sub connection".to_string(),
                ))
            }
        };

        match timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            pubsub.subscribe(&self.update_channel),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return FeedExit::ConnectFailed(e.into()),
            Err(_) => {
                return FeedExit::ConnectFailed(RelayError::Timeout(format!(
                    "subscribing to {}",
                    self.update_channel
                )))
            }
        }

        info!(channel = %self.update_channel, "Redis update feed subscribed");

        let mut stream = pubsub.on_message();
        loop {
            let msg = tokio::select! {
                () = self.cancel.cancelled() => return FeedExit::Cancelled,
                msg = stream.next() => msg,
            };
            let Some(msg) = msg else {
                return FeedExit::Disconnected;
            };
            handle_update_payload(sink, msg.get_payload_bytes());
        }
    }
}

/// Decode one bus message and hand it to the ingest queue
fn handle_update_payload(sink: &UpdateSink, payload: &[u8]) {
    let update = match ResourceUpdate::from_slice(payload) {
        Ok(update) => update,
        Err(e) => {
            warn!(
                error = %e,
                payload = %String::from_utf8_lossy(payload),
                "Dropping malformed update from bus"
            );
            metrics::record_update("malformed");
            return;
        }
    };

    let resource_id = update.resource_id().clone();
    if let Err(e) = sink.submit(update) {
        warn!(resource_id = %resource_id, error = %e, "Update from bus rejected");
        metrics::record_update("rejected");
    }
}

#[async_trait]
impl RequestTransport for RedisBus {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn send_request(&self, request: &ResourceRequest) -> Result<()> {
        let payload = request.to_json()?;
        let mut conn = self.publisher().await?;

        let receivers: usize = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            conn.publish(&self.request_channel, &payload),
        )
        .await
        .map_err(|_| RelayError::Timeout(format!("publishing to {}", self.request_channel)))??;

        if receivers == 0 {
            warn!(
                channel = %self.request_channel,
                resource_id = %request.resource_id,
                "No producer is listening for resource requests"
            );
        } else {
            debug!(receivers = receivers, "Resource request published");
        }
        Ok(())
    }
}
