//! Process-isolated plugin connections
//!
//! [`ProcessConnector`] launches each plugin binary as a child process and
//! talks to it over stdin/stdout using the frames in [`super::ipc`]. The
//! child's stderr is inherited so plugin diagnostics land in the host's
//! stderr.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::ipc::{FrameReader, MessageType, PROTOCOL_VERSION_ENV, ReadyMessage};
use super::rpc::RpcClient;
use super::{Connector, PluginConnection, RawCapability, checksum};
use crate::config::HandshakeConfig;
use crate::error::{PluginError, PluginResult};
use crate::info::PluginInfo;

/// Builds a capability value from a connection's client
pub type Dispenser = Arc<dyn Fn(RpcClient) -> RawCapability + Send + Sync>;

/// Launches plugin binaries as child processes
#[derive(Clone)]
pub struct ProcessConnector {
    handshake: HandshakeConfig,
    dispensers: Arc<HashMap<String, Dispenser>>,
    /// How long a plugin gets to send its Ready frame
    start_timeout: Duration,
    /// How long a plugin gets to exit after Shutdown before it is killed
    stop_timeout: Duration,
    /// How long a health ping may take
    ping_timeout: Duration,
}

impl ProcessConnector {
    pub fn new(handshake: HandshakeConfig) -> Self {
        Self {
            handshake,
            dispensers: Arc::new(HashMap::new()),
            start_timeout: Duration::from_secs(60),
            stop_timeout: Duration::from_secs(5),
            ping_timeout: Duration::from_secs(5),
        }
    }

    /// Register the capability factory dispensed under `name`
    pub fn with_plugin<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(RpcClient) -> RawCapability + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.dispensers).insert(name.into(), Arc::new(factory));
        self
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    pub fn handshake(&self) -> &HandshakeConfig {
        &self.handshake
    }

    /// Spawn the plugin binary with the handshake exported
    fn spawn_process(&self, info: &PluginInfo) -> PluginResult<Child> {
        info!(
            plugin = %info.key,
            "Spawning plugin process: {}",
            info.bin_path.display()
        );

        let mut cmd = Command::new(&info.bin_path);
        cmd.env(&self.handshake.magic_cookie_key, &self.handshake.magic_cookie_value)
            .env(PROTOCOL_VERSION_ENV, self.handshake.protocol_version.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        cmd.spawn().map_err(|e| {
            PluginError::Connection(format!(
                "Failed to spawn {}: {}",
                info.bin_path.display(),
                e
            ))
        })
    }

    /// Wait for the Ready frame and check it against the handshake
    async fn await_ready<R>(
        &self,
        info: &PluginInfo,
        reader: &mut FrameReader<R>,
    ) -> PluginResult<ReadyMessage>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let msg = tokio::time::timeout(self.start_timeout, reader.recv())
            .await
            .map_err(|_| {
                PluginError::HandshakeFailed(format!("Timeout waiting for Ready from {}", info.key))
            })?
            .map_err(|e| PluginError::HandshakeFailed(format!("IPC error: {}", e)))?
            .ok_or_else(|| {
                PluginError::HandshakeFailed(format!("Plugin {} closed before Ready", info.key))
            })?;

        if msg.msg_type != MessageType::Ready {
            return Err(PluginError::HandshakeFailed(format!(
                "Expected Ready, got {:?}",
                msg.msg_type
            )));
        }

        let ready: ReadyMessage = msg
            .parse_json()
            .map_err(|e| PluginError::HandshakeFailed(e.to_string()))?;

        if ready.protocol_version != self.handshake.protocol_version {
            return Err(PluginError::HandshakeFailed(format!(
                "Protocol version mismatch: host speaks {}, plugin {} speaks {}",
                self.handshake.protocol_version, info.key, ready.protocol_version
            )));
        }
        Ok(ready)
    }
}

#[async_trait]
impl Connector for ProcessConnector {
    async fn connect(&self, info: &PluginInfo) -> PluginResult<Box<dyn PluginConnection>> {
        if let Some(expected) = &info.checksum {
            checksum::verify_file(&info.bin_path, expected).await?;
        }

        let mut child = self.spawn_process(info)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PluginError::Connection("Failed to get stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PluginError::Connection("Failed to get stdout".into()))?;

        let mut reader = FrameReader::new(stdout);
        let ready = match self.await_ready(info, &mut reader).await {
            Ok(ready) => ready,
            Err(e) => {
                let _ = child.kill().await;
                return Err(e);
            }
        };

        debug!(plugin = %info.key, plugins = ?ready.plugins, "Plugin is ready");

        let client = RpcClient::new(info.key.clone(), stdin);
        let reader_handle = client.spawn_reader(reader);

        Ok(Box::new(ProcessConnection {
            key: info.key.clone(),
            child: tokio::sync::Mutex::new(Some(child)),
            client,
            reader: parking_lot::Mutex::new(Some(reader_handle)),
            advertised: ready.plugins,
            dispensers: Arc::clone(&self.dispensers),
            closed: AtomicBool::new(false),
            stop_timeout: self.stop_timeout,
            ping_timeout: self.ping_timeout,
        }))
    }
}

/// One running plugin process
pub struct ProcessConnection {
    key: String,
    child: tokio::sync::Mutex<Option<Child>>,
    client: RpcClient,
    /// Handle to the background frame reader task
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
    advertised: Vec<String>,
    dispensers: Arc<HashMap<String, Dispenser>>,
    closed: AtomicBool,
    stop_timeout: Duration,
    ping_timeout: Duration,
}

impl ProcessConnection {
    async fn has_exited(&self) -> bool {
        let mut child = self.child.lock().await;
        match child.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(Some(status)) => {
                    warn!(plugin = %self.key, %status, "Plugin process exited");
                    true
                }
                Ok(None) => false,
                Err(e) => {
                    error!(plugin = %self.key, error = %e, "Error polling plugin process");
                    true
                }
            },
            None => true,
        }
    }
}

#[async_trait]
impl PluginConnection for ProcessConnection {
    fn dispense(&self, name: &str) -> PluginResult<RawCapability> {
        if !self.advertised.iter().any(|p| p == name) {
            return Err(PluginError::Dispense {
                name: name.to_string(),
                reason: format!("plugin {} does not serve it", self.key),
            });
        }

        let factory = self.dispensers.get(name).ok_or_else(|| PluginError::Dispense {
            name: name.to_string(),
            reason: "no factory registered on the connector".to_string(),
        })?;
        Ok(factory(self.client.clone()))
    }

    async fn is_healthy(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) || self.client.is_closed() {
            return false;
        }
        if self.has_exited().await {
            return false;
        }
        self.client.ping(self.ping_timeout).await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.client.shutdown().await;

        // Wait for process to exit gracefully
        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(self.stop_timeout, child.wait()).await {
                Ok(Ok(status)) => {
                    info!(plugin = %self.key, "Plugin exited with status: {}", status);
                }
                Ok(Err(e)) => {
                    error!(plugin = %self.key, "Error waiting for plugin: {}", e);
                }
                Err(_) => {
                    warn!(plugin = %self.key, "Plugin did not exit in time, killing");
                    let _ = child.kill().await;
                }
            }
        }

        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        self.client.mark_closed();
    }
}
