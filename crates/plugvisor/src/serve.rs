//! Plugin side of the process protocol
//!
//! A plugin binary calls [`serve`] from `main`. It checks the magic cookie
//! exported by the host, announces itself with a Ready frame, then answers
//! pings and calls on stdio until the host sends Shutdown or closes stdin.
//!
//! Stdout carries frames, so a plugin must send its own logs to stderr.

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::config::HandshakeConfig;
use crate::connection::ipc::{
    CallMessage, FrameReader, FrameWriter, LogMessage, MessageType, PROTOCOL_VERSION_ENV,
    PingMessage, ReadyMessage, ReplyMessage,
};
use crate::error::{PluginError, PluginResult};

/// Answers calls made through a host's [`RpcClient`](crate::RpcClient)
#[async_trait]
pub trait PluginHandler: Send + Sync + 'static {
    async fn call(&self, method: &str, params: Value) -> Result<Value, String>;
}

/// Serve `handler` on the process's stdio
pub async fn serve<H: PluginHandler>(
    handshake: &HandshakeConfig,
    plugins: &[&str],
    handler: H,
) -> PluginResult<()> {
    check_cookie(handshake)?;

    if let Ok(host_version) = std::env::var(PROTOCOL_VERSION_ENV) {
        if host_version != handshake.protocol_version.to_string() {
            warn!(
                host_version,
                plugin_version = handshake.protocol_version,
                "Host speaks a different protocol version"
            );
        }
    }

    serve_on(handshake, plugins, handler, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Serve `handler` on an arbitrary stream pair
pub async fn serve_on<H, R, W>(
    handshake: &HandshakeConfig,
    plugins: &[&str],
    handler: H,
    input: R,
    output: W,
) -> PluginResult<()>
where
    H: PluginHandler,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = FrameReader::new(input);
    let mut writer = FrameWriter::new(output);

    writer
        .send_json(
            MessageType::Ready,
            &ReadyMessage {
                protocol_version: handshake.protocol_version,
                plugins: plugins.iter().map(|p| p.to_string()).collect(),
            },
        )
        .await?;

    writer
        .send_json(
            MessageType::Log,
            &LogMessage {
                level: "debug".into(),
                message: format!("serving {}", plugins.join(", ")),
            },
        )
        .await?;

    loop {
        let Some(msg) = reader.recv().await? else {
            debug!("Host closed connection");
            return Ok(());
        };

        match msg.msg_type {
            MessageType::Ping => {
                let ping: PingMessage = msg.parse_json()?;
                writer.send_json(MessageType::Pong, &ping).await?;
            }
            MessageType::Call => {
                let call: CallMessage = msg.parse_json()?;
                let reply = match handler.call(&call.method, call.params).await {
                    Ok(result) => ReplyMessage {
                        id: call.id,
                        result: Some(result),
                        error: None,
                    },
                    Err(error) => ReplyMessage {
                        id: call.id,
                        result: None,
                        error: Some(error),
                    },
                };
                writer.send_json(MessageType::Reply, &reply).await?;
            }
            MessageType::Shutdown => {
                debug!("Host requested shutdown");
                return Ok(());
            }
            other => {
                warn!("Unexpected message type from host: {:?}", other);
            }
        }
    }
}

fn check_cookie(handshake: &HandshakeConfig) -> PluginResult<()> {
    match std::env::var(&handshake.magic_cookie_key) {
        Ok(value) if value == handshake.magic_cookie_value => Ok(()),
        _ => Err(PluginError::HandshakeFailed(
            "This binary is a plugin. It must be launched by a plugvisor host".into(),
        )),
    }
}
