//! Server lifecycle management
//!
//! Wires the broadcast engine to the upstream binding selected by
//! `upstream.mode`, serves HTTP until SIGINT/SIGTERM, then stops the
//! background tasks.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use feedrelay_api::{create_router, AppState, PushState};
use feedrelay_core::{config::UpstreamMode, Config};
use feedrelay_hub::{
    BroadcastEngine, HttpFetcher, RedisBus, RequestQueue, RequestTransport, UpstreamBridge,
};

/// How long background tasks get to finish after cancellation
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RelayServer {
    config: Config,
    cancel: CancellationToken,
}

impl RelayServer {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub async fn run(self) -> Result<()> {
        let config = &self.config;

        let (requests, request_rx) = RequestQueue::channel(config.upstream.request_queue_capacity);
        let engine = Arc::new(BroadcastEngine::new(requests, &config.hub));
        let bridge = UpstreamBridge::new(Arc::clone(&engine), self.cancel.clone());

        let (sink, ingest) = bridge.spawn_ingest(config.upstream.update_queue_capacity);
        let mut tasks: Vec<JoinHandle<()>> = vec![ingest];

        let push = match config.upstream.mode {
            UpstreamMode::Http => {
                let fetcher = HttpFetcher::new(
                    config.upstream.fetcher_url.clone(),
                    config.upstream.fetcher_key.clone(),
                    config.upstream.request_timeout(),
                )
                .context("Failed to build fetcher HTTP client")?;
                info!(fetcher_url = %config.upstream.fetcher_url, "Upstream requests go to fetcher");

                tasks.push(bridge.spawn_request_pump(
                    request_rx,
                    Arc::new(fetcher),
                    config.upstream.max_inflight_requests,
                ));
                Some(PushState::new(sink, config.upstream.push_key.as_str()))
            }
            UpstreamMode::Redis => {
                let bus = Arc::new(
                    RedisBus::new(
                        &config.bus.url,
                        config.bus.request_channel.clone(),
                        config.bus.update_channel.clone(),
                        self.cancel.clone(),
                    )
                    .context("Failed to create Redis client")?,
                );
                info!(
                    request_channel = %config.bus.request_channel,
                    update_channel = %config.bus.update_channel,
                    "Upstream traffic goes over Redis pub/sub"
                );

                let transport: Arc<dyn RequestTransport> = Arc::clone(&bus) as _;
                tasks.push(bridge.spawn_request_pump(
                    request_rx,
                    transport,
                    config.upstream.max_inflight_requests,
                ));
                tasks.push(bus.spawn_update_feed(sink));
                None
            }
        };

        tasks.push(engine.spawn_sweeper(
            config.hub.sweep_interval(),
            config.hub.orphan_ttl(),
            self.cancel.clone(),
        ));

        let router = create_router(
            AppState {
                engine: Arc::clone(&engine),
                push,
            },
            config.server.static_dir.as_deref(),
        );

        let address = config.http_address();
        let listener = tokio::net::TcpListener::bind(&address)
            .await
            .with_context(|| format!("Failed to bind HTTP listener on {address}"))?;
        info!("HTTP server listening on {}", address);

        let served = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await;

        if let Err(e) = &served {
            error!("HTTP server error: {}", e);
        }

        self.shutdown(tasks).await;
        served.context("HTTP server failed")
    }

    async fn shutdown(&self, tasks: Vec<JoinHandle<()>>) {
        info!("Shutting down feedrelay...");
        self.cancel.cancel();

        for task in tasks {
            match tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Background task failed during shutdown: {}", e),
                Err(_) => warn!(
                    "Background task did not stop within {}s",
                    TASK_SHUTDOWN_TIMEOUT.as_secs()
                ),
            }
        }

        info!("feedrelay stopped");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {}
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C, starting graceful shutdown"); }
        () = terminate => { info!("Received SIGTERM, starting graceful shutdown"); }
    }
}
