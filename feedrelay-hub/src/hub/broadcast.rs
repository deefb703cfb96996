use std::sync::Arc;
use std::time::Duration;

use feedrelay_core::config::HubConfig;
use feedrelay_core::models::{ResourceId, ResourceSnapshot, ResourceUpdate, SessionId};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::registry::{Subscribers, SubscriptionRegistry, Unsubscribed};
use super::session::{SendOutcome, Session, SessionReceiver};
use super::store::ResourceStore;
use crate::error::Result;
use crate::metrics;
use crate::upstream::RequestQueue;

/// What happened when a session joined its resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A snapshot was stored and has been queued to the session
    CacheHit { version: u64 },
    /// Nothing stored yet, an upstream request was issued
    CacheMiss,
    /// The session was already registered, nothing was sent or requested
    AlreadySubscribed,
    /// The session went away before it could be served
    Closed,
}

/// Per-recipient results of one fan-out pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub delivered: usize,
    /// Skipped because the session's queue was full
    pub dropped: usize,
    /// Dead sessions removed during the pass
    pub pruned: usize,
    /// Pruning emptied the set and the resource was evicted
    pub evicted: bool,
}

impl DeliveryReport {
    fn record(&self) {
        metrics::record_delivery("delivered", self.delivered);
        metrics::record_delivery("dropped", self.dropped);
        metrics::record_delivery("pruned", self.pruned);
    }
}

/// Point-in-time counts, served on `/api/stats`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Resources holding a snapshot
    pub resources: usize,
    /// Resources with at least one subscriber
    pub subscribed_resources: usize,
    pub sessions: usize,
}

/// Owns the registry and the store and serializes all events per resource
pub struct BroadcastEngine {
    registry: SubscriptionRegistry,
    store: ResourceStore,
    requests: RequestQueue,
    session_buffer: usize,
}

impl BroadcastEngine {
    #[must_use]
    pub fn new(requests: RequestQueue, config: &HubConfig) -> Self {
        Self {
            registry: SubscriptionRegistry::new(),
            store: ResourceStore::new(),
            requests,
            session_buffer: config.session_buffer,
        }
    }

    #[must_use]
    pub const fn store(&self) -> &ResourceStore {
        &self.store
    }

    #[must_use]
    pub const fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Create a session sized with the configured outbound buffer
    #[must_use]
    pub fn open_session(&self, resource_id: ResourceId) -> (Session, SessionReceiver) {
        Session::open(resource_id, self.session_buffer)
    }

    /// Register a session and serve it the current snapshot, if any
    ///
    /// On a hit the snapshot is queued while the resource guard is held, so
    /// a concurrent publish lands strictly after it. On a miss an upstream
    /// request is issued once the guard is released.
    pub fn connect(&self, session: &Session) -> Result<ConnectOutcome> {
        let resource_id = session.resource_id();

        let (outcome, _) = self
            .registry
            .with_subscribers(resource_id, &self.store, |subs| -> Result<ConnectOutcome> {
                if !session.is_live() {
                    return Ok(ConnectOutcome::Closed);
                }
                if !subs.add(session)? {
                    return Ok(ConnectOutcome::AlreadySubscribed);
                }

                let Some(snapshot) = self.store.get(resource_id) else {
                    return Ok(ConnectOutcome::CacheMiss);
                };
                let version = snapshot.version;
                match session.send(snapshot) {
                    SendOutcome::Delivered | SendOutcome::Dropped => {
                        Ok(ConnectOutcome::CacheHit { version })
                    }
                    SendOutcome::Dead => {
                        subs.remove(session.id());
                        Ok(ConnectOutcome::Closed)
                    }
                }
            });
        let outcome = outcome?;

        match outcome {
            ConnectOutcome::CacheHit { version } => {
                debug!(
                    resource_id = %resource_id,
                    session_id = %session.id(),
                    version = version,
                    "Served stored snapshot"
                );
            }
            ConnectOutcome::CacheMiss => {
                debug!(
                    resource_id = %resource_id,
                    session_id = %session.id(),
                    "No snapshot stored, requesting from upstream"
                );
                self.requests.request(resource_id.clone());
            }
            ConnectOutcome::AlreadySubscribed | ConnectOutcome::Closed => {}
        }

        self.refresh_gauges();
        Ok(outcome)
    }

    /// Remove a session; evicts the resource if it was the last subscriber
    pub fn disconnect(&self, session_id: &SessionId) -> Option<Unsubscribed> {
        let result = self.registry.unsubscribe(session_id, &self.store);
        self.refresh_gauges();
        result
    }

    /// Store a new snapshot and fan it out to the current subscribers
    ///
    /// With nobody subscribed the snapshot is still kept so the next
    /// subscriber gets a hit; the orphan sweep reclaims it otherwise.
    pub fn publish(&self, update: ResourceUpdate) -> DeliveryReport {
        let (resource_id, data) = update.into_parts();

        let ((mut report, version), evicted) =
            self.registry
                .with_subscribers(&resource_id, &self.store, |subs| {
                    let snapshot = self.store.put(resource_id.clone(), data);
                    let version = snapshot.version;
                    (fan_out(subs, &snapshot), version)
                });
        report.evicted = evicted;

        debug!(
            resource_id = %resource_id,
            version = version,
            delivered = report.delivered,
            dropped = report.dropped,
            pruned = report.pruned,
            "Published snapshot"
        );

        report.record();
        self.refresh_gauges();
        report
    }

    /// Send an existing snapshot to every current subscriber of `resource_id`
    pub fn deliver(
        &self,
        resource_id: &ResourceId,
        snapshot: Arc<ResourceSnapshot>,
    ) -> DeliveryReport {
        let (mut report, evicted) = self
            .registry
            .with_subscribers(resource_id, &self.store, |subs| fan_out(subs, &snapshot));
        report.evicted = evicted;

        report.record();
        if report.pruned > 0 {
            self.refresh_gauges();
        }
        report
    }

    /// Evict snapshots that have had no subscribers for at least `max_age`
    pub fn sweep_orphans(&self, max_age: Duration) -> usize {
        let mut evicted = 0;
        for resource_id in self.store.stale_ids(max_age) {
            let (removed, _) = self
                .registry
                .with_subscribers(&resource_id, &self.store, |subs| {
                    subs.is_empty() && self.store.evict_if_stale(&resource_id, max_age)
                });
            if removed {
                debug!(resource_id = %resource_id, "Evicted orphan snapshot");
                evicted += 1;
            }
        }

        if evicted > 0 {
            info!(evicted = evicted, "Orphan sweep finished");
            self.refresh_gauges();
        }
        evicted
    }

    /// Run [`Self::sweep_orphans`] every `interval` until cancelled
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        max_age: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("Orphan sweeper stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        engine.sweep_orphans(max_age);
                    }
                }
            }
        })
    }

    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            resources: self.store.len(),
            subscribed_resources: self.registry.resource_count(),
            sessions: self.registry.session_count(),
        }
    }

    fn refresh_gauges(&self) {
        let sessions = i64::try_from(self.registry.session_count()).unwrap_or(i64::MAX);
        let resources = i64::try_from(self.store.len()).unwrap_or(i64::MAX);
        metrics::SESSIONS_ACTIVE.set(sessions);
        metrics::RESOURCES_ACTIVE.set(resources);
    }
}

/// Send to every session, then prune the dead ones
fn fan_out(subs: &mut Subscribers<'_>, snapshot: &Arc<ResourceSnapshot>) -> DeliveryReport {
    let mut report = DeliveryReport::default();
    let mut dead = Vec::new();

    for session in subs.sessions() {
        match session.send(Arc::clone(snapshot)) {
            SendOutcome::Delivered => report.delivered += 1,
            SendOutcome::Dropped => {
                warn!(
                    resource_id = %snapshot.resource_id,
                    session_id = %session.id(),
                    version = snapshot.version,
                    "Session queue full, delivery dropped"
                );
                report.dropped += 1;
            }
            SendOutcome::Dead => dead.push(session.id().clone()),
        }
    }

    for session_id in &dead {
        if subs.remove(session_id).is_some() {
            debug!(
                resource_id = %snapshot.resource_id,
                session_id = %session_id,
                "Pruned dead session"
            );
            report.pruned += 1;
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedrelay_core::models::ResourceRequest;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn engine() -> (BroadcastEngine, mpsc::Receiver<ResourceRequest>) {
        let (requests, rx) = RequestQueue::channel(16);
        (BroadcastEngine::new(requests, &HubConfig::default()), rx)
    }

    fn rid(id: &str) -> ResourceId {
        ResourceId::parse(id).unwrap()
    }

    fn update(id: &str, data: serde_json::Value) -> ResourceUpdate {
        ResourceUpdate::new(rid(id), data).unwrap()
    }

    #[tokio::test]
    async fn test_miss_issues_one_request_and_no_send() {
        let (engine, mut requests) = engine();
        let (session, mut rx) = engine.open_session(rid("feed/8/main"));

        assert_eq!(engine.connect(&session).unwrap(), ConnectOutcome::CacheMiss);

        let request = requests.try_recv().unwrap();
        assert_eq!(request.resource_id, rid("feed/8/main"));
        assert!(requests.try_recv().is_err());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_hit_sends_directly_without_request() {
        let (engine, mut requests) = engine();
        engine.publish(update("feed/1", json!({"score": 3})));

        let (session, mut rx) = engine.open_session(rid("feed/1"));
        assert_eq!(
            engine.connect(&session).unwrap(),
            ConnectOutcome::CacheHit { version: 1 }
        );

        assert_eq!(rx.try_recv().unwrap().data, json!({"score": 3}));
        assert!(requests.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_resubscribe_is_idempotent() {
        let (engine, mut requests) = engine();
        let (session, _rx) = engine.open_session(rid("feed/1"));

        engine.connect(&session).unwrap();
        requests.try_recv().unwrap();

        assert_eq!(
            engine.connect(&session).unwrap(),
            ConnectOutcome::AlreadySubscribed
        );
        assert!(requests.try_recv().is_err());
        assert_eq!(engine.registry().subscribers_of(&rid("feed/1")).len(), 1);
    }

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers_in_order() {
        let (engine, _requests) = engine();
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (session, rx) = engine.open_session(rid("feed/1"));
            engine.connect(&session).unwrap();
            receivers.push((session, rx));
        }

        let first = engine.publish(update("feed/1", json!({"score": 1})));
        let second = engine.publish(update("feed/1", json!({"score": 2})));
        assert_eq!(first.delivered, 3);
        assert_eq!(second.delivered, 3);

        for (_, rx) in &mut receivers {
            assert_eq!(rx.recv().await.unwrap().data, json!({"score": 1}));
            assert_eq!(rx.recv().await.unwrap().data, json!({"score": 2}));
            assert!(
                timeout(Duration::from_millis(20), rx.recv()).await.is_err(),
                "no extra deliveries expected"
            );
        }
    }

    #[tokio::test]
    async fn test_dead_session_is_pruned_without_affecting_others() {
        let (engine, _requests) = engine();
        let (s1, mut rx1) = engine.open_session(rid("feed/1"));
        let (s2, rx2) = engine.open_session(rid("feed/1"));
        let (s3, mut rx3) = engine.open_session(rid("feed/1"));
        for session in [&s1, &s2, &s3] {
            engine.connect(session).unwrap();
        }
        drop(rx2);

        let report = engine.publish(update("feed/1", json!({"score": 1})));

        assert_eq!(report.delivered, 2);
        assert_eq!(report.pruned, 1);
        assert!(!report.evicted);
        assert_eq!(rx1.recv().await.unwrap().data, json!({"score": 1}));
        assert_eq!(rx3.recv().await.unwrap().data, json!({"score": 1}));

        let remaining = engine.registry().subscribers_of(&rid("feed/1"));
        assert_eq!(remaining.len(), 2);
        assert!(!remaining.contains(s2.id()));
        assert!(engine.registry().bound_resource(s2.id()).is_none());
    }

    #[tokio::test]
    async fn test_pruning_last_session_evicts() {
        let (engine, _requests) = engine();
        let (session, rx) = engine.open_session(rid("feed/1"));
        engine.connect(&session).unwrap();
        session.mark_closed();
        drop(rx);

        let report = engine.publish(update("feed/1", json!({"score": 1})));

        assert_eq!(report.pruned, 1);
        assert!(report.evicted);
        assert!(engine.store().get(&rid("feed/1")).is_none());
        assert!(!engine.registry().is_subscribed(&rid("feed/1")));
    }

    #[tokio::test]
    async fn test_full_queue_drops_delivery_but_keeps_session() {
        let (requests, _rx) = RequestQueue::channel(4);
        let config = HubConfig {
            session_buffer: 1,
            ..HubConfig::default()
        };
        let engine = BroadcastEngine::new(requests, &config);
        let (session, mut rx) = engine.open_session(rid("feed/1"));
        engine.connect(&session).unwrap();

        engine.publish(update("feed/1", json!({"score": 1})));
        let report = engine.publish(update("feed/1", json!({"score": 2})));

        assert_eq!(report.dropped, 1);
        assert_eq!(report.pruned, 0);
        assert!(engine.registry().subscribers_of(&rid("feed/1")).contains(session.id()));
        assert_eq!(rx.recv().await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_disconnect_last_subscriber_evicts() {
        let (engine, _requests) = engine();
        let (session, _rx) = engine.open_session(rid("feed/1"));
        engine.connect(&session).unwrap();
        engine.publish(update("feed/1", json!({"score": 1})));

        let left = engine.disconnect(session.id()).unwrap();

        assert!(left.evicted);
        assert!(engine.store().get(&rid("feed/1")).is_none());
        assert!(engine.disconnect(session.id()).is_none());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_keeps_orphan_until_swept() {
        let (engine, _requests) = engine();

        let report = engine.publish(update("feed/1", json!({"score": 1})));
        assert_eq!(report, DeliveryReport::default());
        assert!(engine.store().contains(&rid("feed/1")));

        assert_eq!(engine.sweep_orphans(Duration::from_secs(60)), 0);
        assert_eq!(engine.sweep_orphans(Duration::ZERO), 1);
        assert!(engine.store().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_skips_observed_resources() {
        let (engine, _requests) = engine();
        let (session, _rx) = engine.open_session(rid("feed/1"));
        engine.connect(&session).unwrap();
        engine.publish(update("feed/1", json!({"score": 1})));

        assert_eq!(engine.sweep_orphans(Duration::ZERO), 0);
        assert!(engine.store().contains(&rid("feed/1")));
    }

    #[tokio::test]
    async fn test_deliver_reuses_snapshot() {
        let (engine, _requests) = engine();
        let (session, mut rx) = engine.open_session(rid("feed/1"));
        engine.connect(&session).unwrap();

        let snapshot = Arc::new(ResourceSnapshot::new(rid("feed/1"), json!([1, 2]), 7));
        let report = engine.deliver(&rid("feed/1"), Arc::clone(&snapshot));

        assert_eq!(report.delivered, 1);
        assert!(Arc::ptr_eq(&rx.recv().await.unwrap(), &snapshot));
    }

    #[tokio::test]
    async fn test_closed_session_is_not_registered() {
        let (engine, mut requests) = engine();
        let (session, rx) = engine.open_session(rid("feed/1"));
        drop(rx);

        assert_eq!(engine.connect(&session).unwrap(), ConnectOutcome::Closed);
        assert!(!engine.registry().is_subscribed(&rid("feed/1")));
        assert!(requests.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stats() {
        let (engine, _requests) = engine();
        let (session, _rx) = engine.open_session(rid("feed/1"));
        engine.connect(&session).unwrap();
        engine.publish(update("feed/1", json!({})));
        engine.publish(update("feed/2", json!({})));

        assert_eq!(
            engine.stats(),
            HubStats {
                resources: 2,
                subscribed_resources: 1,
                sessions: 1,
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_connects_and_publishes_stay_consistent() {
        let (requests, _rx) = RequestQueue::channel(4096);
        let config = HubConfig {
            session_buffer: 256,
            ..HubConfig::default()
        };
        let engine = Arc::new(BroadcastEngine::new(requests, &config));
        let ids: Vec<ResourceId> = (0..4).map(|i| rid(&format!("feed/{i}"))).collect();

        let mut handles = Vec::new();
        for worker in 0..16 {
            let engine = Arc::clone(&engine);
            let id = ids[(worker / 2) % ids.len()].clone();
            handles.push(tokio::spawn(async move {
                let mut versions = Vec::new();
                for round in 0..20 {
                    if worker % 2 == 0 {
                        engine.publish(update(id.as_str(), json!({ "round": round })));
                        tokio::task::yield_now().await;
                    } else {
                        let (session, mut rx) = engine.open_session(id.clone());
                        engine.connect(&session).unwrap();
                        tokio::task::yield_now().await;
                        engine.disconnect(session.id());
                        while let Ok(snapshot) = rx.try_recv() {
                            versions.push(snapshot.version);
                        }
                        // Each session sees versions in store order
                        assert!(versions.windows(2).all(|w| w[0] < w[1]));
                        versions.clear();
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        for id in &ids {
            assert!(!engine.registry().is_subscribed(id));
            assert!(engine.registry().subscribers_of(id).is_empty());
        }
        assert_eq!(engine.registry().session_count(), 0);
    }
}
