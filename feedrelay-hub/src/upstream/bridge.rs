use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::queue::{RequestReceiver, UpdateSink};
use super::RequestTransport;
use crate::hub::BroadcastEngine;
use crate::metrics;

/// Spawns and owns the tasks linking the engine to the producers
pub struct UpstreamBridge {
    engine: Arc<BroadcastEngine>,
    cancel: CancellationToken,
}

impl UpstreamBridge {
    #[must_use]
    pub const fn new(engine: Arc<BroadcastEngine>, cancel: CancellationToken) -> Self {
        Self { engine, cancel }
    }

    /// Forward queued requests to `transport`, at most `max_inflight` at a time
    ///
    /// A slow or failing producer never holds back later requests until the
    /// cap is reached. A permit is taken before the next request is received,
    /// so a stalled producer backs the queue up and further requests are
    /// dropped by [`RequestQueue::request`](super::RequestQueue::request).
    /// Failures are logged and not retried.
    pub fn spawn_request_pump(
        &self,
        mut requests: RequestReceiver,
        transport: Arc<dyn RequestTransport>,
        max_inflight: usize,
    ) -> JoinHandle<()> {
        let cancel = self.cancel.clone();
        let inflight = Arc::new(Semaphore::new(max_inflight.max(1)));
        tokio::spawn(async move {
            info!(
                transport = transport.name(),
                max_inflight = max_inflight,
                "Upstream request pump started"
            );
            loop {
                let permit = tokio::select! {
                    () = cancel.cancelled() => break,
                    permit = Arc::clone(&inflight).acquire_owned() => permit,
                };
                let Ok(permit) = permit else {
                    break;
                };

                let request = tokio::select! {
                    () = cancel.cancelled() => break,
                    request = requests.recv() => request,
                };
                let Some(request) = request else {
                    break;
                };

                let transport = Arc::clone(&transport);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let result = tokio::select! {
                        () = cancel.cancelled() => return,
                        result = transport.send_request(&request) => result,
                    };
                    match result {
                        Ok(()) => {
                            debug!(
                                resource_id = %request.resource_id,
                                transport = transport.name(),
                                "Upstream request sent"
                            );
                            metrics::record_upstream_request("sent");
                        }
                        Err(e) => {
                            warn!(
                                resource_id = %request.resource_id,
                                transport = transport.name(),
                                error = %e,
                                "Upstream request failed"
                            );
                            metrics::record_upstream_request("failed");
                        }
                    }
                });
            }
            info!("Upstream request pump stopped");
        })
    }

    /// Start the ingest task and return the sink every inbound binding writes to
    ///
    /// Updates are applied one at a time in arrival order.
    pub fn spawn_ingest(&self, capacity: usize) -> (UpdateSink, JoinHandle<()>) {
        let (sink, mut updates) = UpdateSink::channel(capacity);
        let engine = Arc::clone(&self.engine);
        let cancel = self.cancel.clone();

        let handle = tokio::spawn(async move {
            loop {
                let update = tokio::select! {
                    () = cancel.cancelled() => break,
                    update = updates.recv() => update,
                };
                let Some(update) = update else {
                    break;
                };

                let resource_id = update.resource_id().clone();
                let report = engine.publish(update);
                metrics::record_update("applied");
                debug!(
                    resource_id = %resource_id,
                    delivered = report.delivered,
                    pruned = report.pruned,
                    "Applied upstream update"
                );
            }
            info!("Update ingest stopped");
        });

        (sink, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RelayError, Result};
    use crate::upstream::RequestQueue;
    use async_trait::async_trait;
    use feedrelay_core::config::HubConfig;
    use feedrelay_core::models::{ResourceId, ResourceRequest, ResourceUpdate};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    struct RecordingTransport {
        seen: mpsc::UnboundedSender<ResourceRequest>,
        fail: bool,
    }

    #[async_trait]
    impl RequestTransport for RecordingTransport {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn send_request(&self, request: &ResourceRequest) -> Result<()> {
            let _ = self.seen.send(request.clone());
            if self.fail {
                return Err(RelayError::UpstreamStatus(503));
            }
            Ok(())
        }
    }

    fn setup(fail: bool) -> (
        Arc<BroadcastEngine>,
        UpstreamBridge,
        mpsc::UnboundedReceiver<ResourceRequest>,
        CancellationToken,
    ) {
        let (requests, request_rx) = RequestQueue::channel(16);
        let engine = Arc::new(BroadcastEngine::new(requests, &HubConfig::default()));
        let cancel = CancellationToken::new();
        let bridge = UpstreamBridge::new(Arc::clone(&engine), cancel.clone());

        let (seen, seen_rx) = mpsc::unbounded_channel();
        bridge.spawn_request_pump(request_rx, Arc::new(RecordingTransport { seen, fail }), 4);
        (engine, bridge, seen_rx, cancel)
    }

    #[tokio::test]
    async fn test_miss_reaches_transport() {
        let (engine, _bridge, mut seen, _cancel) = setup(false);
        let (session, _rx) = engine.open_session(ResourceId::parse("feed/8/main").unwrap());

        engine.connect(&session).unwrap();

        let request = timeout(Duration::from_secs(1), seen.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.to_json().unwrap(), r#"{"resourceId":"feed/8/main"}"#);
    }

    #[tokio::test]
    async fn test_failing_transport_does_not_stop_pump() {
        let (engine, _bridge, mut seen, _cancel) = setup(true);

        for id in ["feed/1", "feed/2"] {
            let (session, _rx) = engine.open_session(ResourceId::parse(id).unwrap());
            engine.connect(&session).unwrap();
        }

        let mut ids = Vec::new();
        for _ in 0..2 {
            let request = timeout(Duration::from_secs(1), seen.recv())
                .await
                .unwrap()
                .unwrap();
            ids.push(request.resource_id.to_string());
        }
        ids.sort();
        assert_eq!(ids, vec!["feed/1", "feed/2"]);
    }

    /// Never answers, so every permit it gets stays taken
    struct StalledTransport {
        started: mpsc::UnboundedSender<ResourceRequest>,
    }

    #[async_trait]
    impl RequestTransport for StalledTransport {
        fn name(&self) -> &'static str {
            "stalled"
        }

        async fn send_request(&self, request: &ResourceRequest) -> Result<()> {
            let _ = self.started.send(request.clone());
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stalled_transport_backs_up_queue() {
        let (engine, _bridge, _seen, cancel) = setup(false);
        let bridge = UpstreamBridge::new(engine, cancel.clone());
        let (queue, queue_rx) = RequestQueue::channel(2);
        let (started, mut started_rx) = mpsc::unbounded_channel();
        bridge.spawn_request_pump(queue_rx, Arc::new(StalledTransport { started }), 2);

        let id = |n: usize| ResourceId::parse(format!("feed/{n}")).unwrap();

        assert!(queue.request(id(1)));
        assert!(queue.request(id(2)));
        for _ in 0..2 {
            timeout(Duration::from_secs(1), started_rx.recv())
                .await
                .unwrap()
                .unwrap();
        }

        // Both permits are held; the next two wait in the queue
        assert!(queue.request(id(3)));
        assert!(queue.request(id(4)));
        assert!(!queue.request(id(5)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(started_rx.try_recv().is_err());

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_ingest_applies_updates_in_order() {
        let (engine, bridge, _seen, _cancel) = setup(false);
        let (sink, _handle) = bridge.spawn_ingest(16);
        let id = ResourceId::parse("feed/1").unwrap();
        let (session, mut rx) = engine.open_session(id.clone());
        engine.connect(&session).unwrap();

        for score in 1..=3 {
            sink.submit(ResourceUpdate::new(id.clone(), json!({ "score": score })).unwrap())
                .unwrap();
        }

        for score in 1..=3 {
            let snapshot = timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(snapshot.data, json!({ "score": score }));
        }
    }

    #[tokio::test]
    async fn test_cancel_stops_ingest() {
        let (_engine, bridge, _seen, cancel) = setup(false);
        let (sink, handle) = bridge.spawn_ingest(4);

        cancel.cancel();
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();

        let update =
            ResourceUpdate::new(ResourceId::parse("feed/1").unwrap(), json!({})).unwrap();
        assert!(matches!(sink.submit(update), Err(RelayError::BridgeClosed)));
    }
}
