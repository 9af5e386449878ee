//! Plugvisor host
//!
//! Loads the plugins listed in a TOML host file, keeps them supervised and
//! stops them on Ctrl+C / SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use plugvisor::{
    CrashNotification, HostConfig, PluginManager, ProcessConnector, RawCapability, RpcClient,
};

/// Plugvisor plugin host
#[derive(Parser, Debug)]
#[command(name = "plugvisor")]
#[command(about = "Run and supervise out-of-process plugins", long_about = None)]
struct Args {
    /// Path to the host configuration file
    #[arg(short, long, default_value = "./plugvisor.toml")]
    config: PathBuf,

    /// Don't restart crashed plugins
    #[arg(long)]
    unmanaged: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("plugvisor=info,plugin=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    info!("Starting plugvisor v{}", env!("CARGO_PKG_VERSION"));

    let host = HostConfig::load(&args.config)
        .await
        .with_context(|| format!("loading {}", args.config.display()))?;

    let mut config = host.manager_config();
    if args.unmanaged {
        config.restart.managed = false;
    }

    // Every plugin hands out its RPC client under the host's name
    let connector = ProcessConnector::new(host.handshake.clone())
        .with_plugin(host.name.clone(), |client: RpcClient| Box::new(client) as RawCapability);
    let manager: Arc<PluginManager<RpcClient>> =
        Arc::new(PluginManager::new(host.name.clone(), Arc::new(connector), config));

    let killed = manager.plugin_killed();
    tokio::spawn(log_crashes(killed));

    if let Err(e) = manager.load_plugins(host.plugins.clone()).await {
        error!("Failed to load plugins: {}", e);
        manager.shutdown().await?;
        return Err(e.into());
    }

    for plugin in manager.list_plugins() {
        info!(
            plugin = %plugin.key,
            restarts = plugin.restarts,
            "Running {}",
            plugin.bin_path.display()
        );
    }
    info!(
        plugins = host.plugins.len(),
        supervised = manager.is_supervised(),
        "Plugins loaded"
    );

    shutdown_signal().await;

    manager.shutdown().await?;
    info!("Plugvisor shutdown complete");
    Ok(())
}

async fn log_crashes(mut killed: broadcast::Receiver<CrashNotification>) {
    loop {
        match killed.recv().await {
            Ok(crash) => warn!(
                plugin = %crash.key,
                restarts = crash.restarts,
                "Plugin crashed"
            ),
            Err(RecvError::Lagged(missed)) => warn!(missed, "Missed crash notifications"),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
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
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
