mod server;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use feedrelay_core::{bootstrap::load_config, logging};

use server::RelayServer;

/// Live resource relay: fans out producer updates to WebSocket subscribers
#[derive(Debug, Parser)]
#[command(name = "feedrelay", version, about)]
struct Cli {
    /// Path to a YAML or TOML config file
    #[arg(short, long, env = "FEEDRELAY_CONFIG_PATH")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load and validate configuration (fails fast on misconfiguration)
    let config = load_config(cli.config.as_deref())?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        upstream_mode = %config.upstream.mode,
        "feedrelay starting"
    );
    info!("HTTP address: {}", config.http_address());

    // 3. Run until a shutdown signal arrives
    RelayServer::new(config).run().await
}
