//! Request / response client over a plugin's stdio
//!
//! [`RpcClient`] is cheap to clone. Every clone shares the same writer and
//! the same table of requests waiting for a reply. A background reader task
//! (see [`RpcClient::spawn_reader`]) routes replies back to their callers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::ipc::{
    CallMessage, FrameReader, FrameWriter, LogMessage, MessageType, PingMessage, PluginMessage,
    ReplyMessage,
};
use crate::error::{PluginError, PluginResult};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type ReplySender = oneshot::Sender<Result<Value, String>>;

struct Pending {
    closed: bool,
    waiting: HashMap<u64, ReplySender>,
}

/// Client side of a plugin connection
#[derive(Clone)]
pub struct RpcClient {
    plugin: Arc<str>,
    writer: Arc<tokio::sync::Mutex<FrameWriter<BoxedWriter>>>,
    pending: Arc<Mutex<Pending>>,
    next_id: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

impl RpcClient {
    /// Wrap the writing half of a plugin connection
    pub fn new<W>(plugin: impl Into<String>, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer: BoxedWriter = Box::new(writer);
        Self {
            plugin: Arc::from(plugin.into()),
            writer: Arc::new(tokio::sync::Mutex::new(FrameWriter::new(writer))),
            pending: Arc::new(Mutex::new(Pending {
                closed: false,
                waiting: HashMap::new(),
            })),
            next_id: Arc::new(AtomicU64::new(1)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Key of the plugin on the other end
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// Whether the plugin side has gone away
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Invoke `method` on the plugin and wait for its reply
    pub async fn call(&self, method: &str, params: Value) -> PluginResult<Value> {
        let (id, rx) = self.register()?;
        let msg = PluginMessage::json(
            MessageType::Call,
            &CallMessage {
                id,
                method: method.to_string(),
                params,
            },
        )?;

        if let Err(e) = self.send(&msg).await {
            self.pending.lock().waiting.remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(PluginError::Call {
                method: method.to_string(),
                message,
            }),
            Err(_) => Err(PluginError::Connection(format!(
                "Plugin {} closed before replying to '{}'",
                self.plugin, method
            ))),
        }
    }

    /// Round-trip a ping, false if no pong arrives within `timeout`
    pub async fn ping(&self, timeout: Duration) -> bool {
        let Ok((id, rx)) = self.register() else {
            return false;
        };

        let sent = match PluginMessage::json(MessageType::Ping, &PingMessage { id }) {
            Ok(msg) => self.send(&msg).await.is_ok(),
            Err(_) => false,
        };

        let answered = sent && matches!(tokio::time::timeout(timeout, rx).await, Ok(Ok(Ok(_))));
        if !answered {
            self.pending.lock().waiting.remove(&id);
        }
        answered
    }

    /// Ask the plugin to exit, ignoring write failures
    pub async fn shutdown(&self) {
        if let Err(e) = self.send(&PluginMessage::empty(MessageType::Shutdown)).await {
            debug!(plugin = %self.plugin, error = %e, "Could not send shutdown");
        }
    }

    /// Start routing frames from `reader` to waiting callers
    pub fn spawn_reader<R>(&self, reader: FrameReader<R>) -> JoinHandle<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let client = self.clone();
        tokio::spawn(async move { client.read_loop(reader).await })
    }

    async fn read_loop<R: AsyncRead + Unpin>(self, mut reader: FrameReader<R>) {
        loop {
            match reader.recv().await {
                Ok(Some(msg)) => self.dispatch(msg),
                Ok(None) => {
                    debug!(plugin = %self.plugin, "Plugin closed connection");
                    break;
                }
                Err(e) => {
                    warn!(plugin = %self.plugin, error = %e, "Error reading from plugin");
                    break;
                }
            }
        }
        self.mark_closed();
    }

    fn dispatch(&self, msg: PluginMessage) {
        match msg.msg_type {
            MessageType::Reply => match msg.parse_json::<ReplyMessage>() {
                Ok(reply) => {
                    let outcome = match reply.error {
                        Some(error) => Err(error),
                        None => Ok(reply.result.unwrap_or(Value::Null)),
                    };
                    self.complete(reply.id, outcome);
                }
                Err(e) => warn!(plugin = %self.plugin, error = %e, "Dropping reply"),
            },
            MessageType::Pong => match msg.parse_json::<PingMessage>() {
                Ok(pong) => self.complete(pong.id, Ok(Value::Null)),
                Err(e) => warn!(plugin = %self.plugin, error = %e, "Dropping pong"),
            },
            MessageType::Log => {
                if let Ok(log) = msg.parse_json::<LogMessage>() {
                    let plugin = &*self.plugin;
                    let message = &log.message;
                    match log.level.as_str() {
                        "trace" => tracing::trace!(target: "plugin", "[{plugin}] {message}"),
                        "debug" => tracing::debug!(target: "plugin", "[{plugin}] {message}"),
                        "warn" => tracing::warn!(target: "plugin", "[{plugin}] {message}"),
                        "error" => tracing::error!(target: "plugin", "[{plugin}] {message}"),
                        _ => tracing::info!(target: "plugin", "[{plugin}] {message}"),
                    }
                }
            }
            other => {
                warn!(plugin = %self.plugin, "Unexpected message type from plugin: {:?}", other);
            }
        }
    }

    fn register(&self) -> PluginResult<(u64, oneshot::Receiver<Result<Value, String>>)> {
        let mut pending = self.pending.lock();
        if pending.closed {
            return Err(PluginError::Connection(format!(
                "Plugin {} connection is closed",
                self.plugin
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        pending.waiting.insert(id, tx);
        Ok((id, rx))
    }

    fn complete(&self, id: u64, outcome: Result<Value, String>) {
        let waiter = self.pending.lock().waiting.remove(&id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => debug!(plugin = %self.plugin, id, "Reply for unknown request"),
        }
    }

    /// Fail every waiting request and refuse new ones
    pub(crate) fn mark_closed(&self) {
        let mut pending = self.pending.lock();
        pending.closed = true;
        pending.waiting.clear();
        self.closed.store(true, Ordering::SeqCst);
    }

    async fn send(&self, msg: &PluginMessage) -> PluginResult<()> {
        self.writer.lock().await.send(msg).await
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("plugin", &self.plugin)
            .field("closed", &self.is_closed())
            .finish()
    }
}
