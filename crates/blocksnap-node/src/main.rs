//! blocksnap node - snapshot maintenance daemon.

use std::sync::Arc;

use blocksnap_core::ChainStore;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use blocksnap_node::{recorded_status, Args, Node};

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "blocksnap_node=info,blocksnap_snapshot=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let status_only = args.status;
    let config = args.into_config();

    if status_only {
        let store = ChainStore::open(config.storage_config())?;
        let statuses = recorded_status(&store)?;
        println!("{}", serde_json::to_string_pretty(&statuses)?);
        return Ok(());
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_path = %config.data_path.display(),
        snapshot_dir = %config.snapshot_dir.display(),
        epoch_size = config.epoch_size,
        inline = config.run_inline,
        "starting blocksnap node"
    );

    let node = Arc::new(Node::open(config)?);

    // Set up graceful shutdown
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl+c");
            return;
        }
        tracing::info!("received shutdown signal");
        let _ = shutdown_tx.send(());
    });

    match node.run(shutdown_rx).await {
        Ok(()) => {
            tracing::info!("node shutdown complete");
        }
        Err(e) => {
            tracing::error!(error = %e, "node error");
            return Err(e.into());
        }
    }

    Ok(())
}
