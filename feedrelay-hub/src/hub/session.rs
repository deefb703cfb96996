use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use feedrelay_core::models::{ResourceId, ResourceSnapshot, SessionId};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Receiving half handed to the transport that writes to the client
pub type SessionReceiver = mpsc::Receiver<Arc<ResourceSnapshot>>;

/// Result of a single send attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// Outbound queue full, this delivery is skipped
    Dropped,
    /// Client is gone
    Dead,
}

/// One subscriber connection, bound to a single resource for its lifetime
///
/// Cheap to clone: the registry and the transport each hold a handle,
/// and the transport also owns the [`SessionReceiver`].
#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    resource_id: ResourceId,
    sender: mpsc::Sender<Arc<ResourceSnapshot>>,
    live: Arc<AtomicBool>,
    connected_at: Instant,
}

impl Session {
    /// Create a session with a bounded outbound queue of `buffer` snapshots
    #[must_use]
    pub fn open(resource_id: ResourceId, buffer: usize) -> (Self, SessionReceiver) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let session = Self {
            id: SessionId::new(),
            resource_id,
            sender,
            live: Arc::new(AtomicBool::new(true)),
            connected_at: Instant::now(),
        };
        (session, receiver)
    }

    #[must_use]
    pub const fn id(&self) -> &SessionId {
        &self.id
    }

    #[must_use]
    pub const fn resource_id(&self) -> &ResourceId {
        &self.resource_id
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// False once the transport closed or the receiver was dropped
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire) && !self.sender.is_closed()
    }

    /// Called by the transport when it detects the client went away
    pub fn mark_closed(&self) {
        self.live.store(false, Ordering::Release);
    }

    /// Queue a snapshot without waiting
    pub fn send(&self, snapshot: Arc<ResourceSnapshot>) -> SendOutcome {
        if !self.live.load(Ordering::Acquire) {
            return SendOutcome::Dead;
        }
        match self.sender.try_send(snapshot) {
            Ok(()) => SendOutcome::Delivered,
            Err(TrySendError::Full(_)) => SendOutcome::Dropped,
            Err(TrySendError::Closed(_)) => {
                self.mark_closed();
                SendOutcome::Dead
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(version: u64) -> Arc<ResourceSnapshot> {
        Arc::new(ResourceSnapshot::new(
            ResourceId::parse("feed/1").unwrap(),
            json!({ "version": version }),
            version,
        ))
    }

    #[tokio::test]
    async fn test_send_delivers_in_order() {
        let (session, mut rx) = Session::open(ResourceId::parse("feed/1").unwrap(), 4);

        assert_eq!(session.send(snapshot(1)), SendOutcome::Delivered);
        assert_eq!(session.send(snapshot(2)), SendOutcome::Delivered);

        assert_eq!(rx.recv().await.unwrap().version, 1);
        assert_eq!(rx.recv().await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_killing_session() {
        let (session, _rx) = Session::open(ResourceId::parse("feed/1").unwrap(), 1);

        assert_eq!(session.send(snapshot(1)), SendOutcome::Delivered);
        assert_eq!(session.send(snapshot(2)), SendOutcome::Dropped);
        assert!(session.is_live());
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_dead() {
        let (session, rx) = Session::open(ResourceId::parse("feed/1").unwrap(), 4);
        drop(rx);

        assert!(!session.is_live());
        assert_eq!(session.send(snapshot(1)), SendOutcome::Dead);
    }

    #[tokio::test]
    async fn test_mark_closed_is_shared_by_clones() {
        let (session, _rx) = Session::open(ResourceId::parse("feed/1").unwrap(), 4);
        let registered = session.clone();

        session.mark_closed();

        assert!(!registered.is_live());
        assert_eq!(registered.send(snapshot(1)), SendOutcome::Dead);
    }
}
