//! Echo plugin
//!
//! Minimal plugin binary used to exercise a host end to end. Methods:
//!
//! - `echo`: returns its params
//! - `pid`: returns the plugin's process id
//! - `crash`: exits the process without replying

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use plugvisor::{HandshakeConfig, PluginHandler, serve};

struct EchoHandler;

#[async_trait]
impl PluginHandler for EchoHandler {
    async fn call(&self, method: &str, params: Value) -> Result<Value, String> {
        match method {
            "echo" => Ok(params),
            "pid" => Ok(Value::from(std::process::id())),
            "crash" => {
                warn!("Crash requested, exiting");
                std::process::exit(3);
            }
            other => Err(format!("unknown method '{}'", other)),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Stdout carries frames
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("plugvisor=info,plugvisor_echo=info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!(pid = std::process::id(), "Echo plugin starting");
    serve(&HandshakeConfig::default(), &["echo"], EchoHandler).await?;
    info!("Echo plugin exiting");
    Ok(())
}
