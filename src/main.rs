//! Headless sync daemon.
//!
//! Usage: `pos-sync [config.json]`. Without a file, configuration comes
//! from `POS_*` environment variables only.

use anyhow::Context;
use std::path::PathBuf;
use the_small_pos_sync::{diagnostics, CoreConfig, PosEngine};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = CoreConfig::load(config_path.as_deref()).context("loading configuration")?;

    let _log_guard = diagnostics::init_logging(&config.log_dir()).context("initializing logging")?;
    info!("Starting The Small POS sync v{}", env!("CARGO_PKG_VERSION"));

    let engine = PosEngine::start(&config).context("starting sync engine")?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown requested");

    match engine.reconciler().status() {
        Ok(status) => info!(
            pending_orders = status.queue.pending_orders,
            pending_mutations = status.queue.pending_mutations,
            "Queue state at shutdown"
        ),
        Err(e) => tracing::warn!("Could not read queue state: {e}"),
    }

    engine.shutdown().await;
    Ok(())
}
