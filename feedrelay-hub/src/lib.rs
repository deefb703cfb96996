pub mod error;
pub mod hub;
pub mod metrics;
pub mod upstream;

pub use error::{RelayError, Result};
pub use hub::{
    BroadcastEngine, ConnectOutcome, DeliveryReport, HubStats, ResourceStore, Session,
    SessionReceiver, SubscriberSet, SubscriptionRegistry, Unsubscribed,
};
pub use upstream::{
    HttpFetcher, RedisBus, RequestQueue, RequestTransport, UpdateSink, UpstreamBridge,
};
