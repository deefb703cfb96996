use feedrelay_core::models::{ResourceId, ResourceRequest, ResourceUpdate};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

use crate::error::{RelayError, Result};
use crate::metrics;

/// Receiving half consumed by the request pump
pub type RequestReceiver = mpsc::Receiver<ResourceRequest>;

/// Receiving half consumed by the ingest task
pub type UpdateReceiver = mpsc::Receiver<ResourceUpdate>;

/// Outbound "resource requested" signals, fire-and-forget
#[derive(Debug, Clone)]
pub struct RequestQueue {
    tx: mpsc::Sender<ResourceRequest>,
}

impl RequestQueue {
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, RequestReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue a request without waiting. Returns `false` if it was dropped.
    pub fn request(&self, resource_id: ResourceId) -> bool {
        match self.tx.try_send(ResourceRequest::new(resource_id)) {
            Ok(()) => true,
            Err(TrySendError::Full(request)) => {
                warn!(
                    resource_id = %request.resource_id,
                    "Request queue full, dropping upstream request"
                );
                metrics::record_upstream_request("dropped");
                false
            }
            Err(TrySendError::Closed(request)) => {
                warn!(
                    resource_id = %request.resource_id,
                    "Request pump stopped, dropping upstream request"
                );
                metrics::record_upstream_request("dropped");
                false
            }
        }
    }
}

/// Entry point for validated updates, shared by every inbound binding
#[derive(Debug, Clone)]
pub struct UpdateSink {
    tx: mpsc::Sender<ResourceUpdate>,
}

impl UpdateSink {
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, UpdateReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue an update for the ingest task
    pub fn submit(&self, update: ResourceUpdate) -> Result<()> {
        self.tx.try_send(update).map_err(|e| match e {
            TrySendError::Full(_) => RelayError::UpdateQueueFull,
            TrySendError::Closed(_) => RelayError::BridgeClosed,
        })
    }
}
