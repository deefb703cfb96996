//! Resource-scoped publish/subscribe hub
//!
//! ```text
//!                    Arc<BroadcastEngine>
//!           ┌──────────────────────────────────────┐
//!           │ registry: resource -> SubscriberSet  │
//!           │           session  -> resource       │
//!           │ store:    resource -> Snapshot       │
//!           └──────────────────┬───────────────────┘
//!                              │ per-resource guard
//!         ┌────────────────────┼────────────────────┐
//!         ▼                    ▼                    ▼
//!     connect()            publish()           disconnect()
//!   add + lookup        put + fan-out        remove + evict
//! ```
//!
//! Every operation that touches a resource runs inside the registry's
//! entry guard for that resource, so events for one resource never
//! interleave while different resources proceed in parallel.

mod broadcast;
mod registry;
mod session;
mod store;

pub use broadcast::{BroadcastEngine, ConnectOutcome, DeliveryReport, HubStats};
pub use registry::{SubscriberSet, SubscriptionRegistry, Unsubscribed};
pub use session::{SendOutcome, Session, SessionReceiver};
pub use store::ResourceStore;

/// Registry and bindings disagree; state can no longer be trusted.
pub(crate) fn invariant_violation(message: &str) -> ! {
    tracing::error!(message = %message, "Relay invariant violated, aborting");
    std::process::abort()
}
