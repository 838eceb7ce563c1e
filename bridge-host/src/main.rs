//! signbridge-host binary entry point.
//!
//! Serves the line-delimited JSON frontend on stdin/stdout; logs go to
//! stderr.
//!
//! Usage:
//! ```bash
//! signbridge-host --config bridge.toml
//! RUST_LOG=signbridge_host=debug signbridge-host
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use signbridge_host::agent::ProcessAgentConnector;
use signbridge_host::blocklist::{
    spawn_refresh_task, BlockListService, BlockListSource, HttpBlockListSource,
    StaticBlockListSource,
};
use signbridge_host::config::ConfigError;
use signbridge_host::store::StateStore;
use signbridge_host::{frontend, BridgeHost, Config};
use signbridge_relay::{DeviceSyncManager, HubTransportFactory};
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

/// Bridge between web callers and the local signing agent.
#[derive(Parser, Debug)]
#[command(name = "signbridge-host")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, short, default_value = "bridge.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    let store = Arc::new(
        StateStore::open(&config.storage.path)
            .await
            .with_context(|| format!("Failed to open state file {}", config.storage.path.display()))?,
    );

    let source: Arc<dyn BlockListSource> = match &config.blocklist.url {
        Some(url) => Arc::new(HttpBlockListSource::new(url.clone())),
        None => Arc::new(StaticBlockListSource::default()),
    };
    let blocklist = Arc::new(BlockListService::new(
        source,
        Duration::from_millis(config.blocklist.refresh_after_block_ms),
    ));
    let refresh = spawn_refresh_task(
        blocklist.clone(),
        Duration::from_secs(config.blocklist.refresh_interval_secs),
    );

    let devices = match config.hub_transport_config() {
        Some(hub) => {
            let server = hub.server_url.clone();
            let factory = HubTransportFactory::new(hub).context("Failed to build relay client")?;
            let manager =
                DeviceSyncManager::new(config.device_sync_config(), store.clone(), Arc::new(factory));
            if let Err(e) = manager.refresh_roster().await {
                tracing::warn!("Failed to load paired devices: {}", e);
            }
            tracing::info!("Paired devices reachable through relay {}", server);
            Some(manager)
        }
        None => {
            tracing::info!("No relay server configured; paired devices are disabled");
            None
        }
    };

    let connector = Arc::new(ProcessAgentConnector::new(&config.agent));
    let host = Arc::new(BridgeHost::from_config(
        &config,
        connector,
        store,
        blocklist,
        devices,
    ));

    tracing::info!(
        "signbridge-host v{} serving (agent: {})",
        env!("CARGO_PKG_VERSION"),
        config.agent.program.display()
    );

    frontend::serve(host, BufReader::new(tokio::io::stdin()), tokio::io::stdout())
        .await
        .context("Frontend failed")?;

    refresh.abort();
    tracing::info!("signbridge-host stopped");
    Ok(())
}

/// Load the configuration, falling back to defaults when the file is absent.
fn load_config(path: &Path) -> Result<Config> {
    match Config::from_file(path) {
        Ok(config) => Ok(config),
        Err(ConfigError::ReadError { source, .. })
            if source.kind() == std::io::ErrorKind::NotFound =>
        {
            tracing::warn!("Config file {} not found, using defaults", path.display());
            Ok(Config::default())
        }
        Err(e) => Err(e).context("Failed to load configuration"),
    }
}
