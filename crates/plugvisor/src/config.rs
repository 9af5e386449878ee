//! Manager and Host Configuration
//!
//! [`ManagerConfig`] drives a [`PluginManager`](crate::PluginManager).
//! [`HostConfig`] is the on-disk shape read by the `plugvisor` binary
//! (`plugvisor.toml`).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PluginError, PluginResult};
use crate::info::PluginInfo;

/// Default health sampling interval
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(10);

/// Default restart ceiling per plugin
pub const DEFAULT_MAX_RESTARTS: u32 = 5;

/// Default capacity of the crash notification queue
pub const DEFAULT_NOTIFY_BUFFER: usize = 16;

// ─────────────────────────────────────────────────────────────────────────────
// Restart Config
// ─────────────────────────────────────────────────────────────────────────────

/// Restart supervision settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    /// Spawn the supervisor and restart crashed plugins
    pub managed: bool,

    /// How often each watcher samples plugin health
    #[serde(rename = "ping_interval_ms", with = "duration_ms")]
    pub ping_interval: Duration,

    /// Crash notifications carrying this many restarts are dropped
    pub max_restarts: u32,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            managed: false,
            ping_interval: DEFAULT_PING_INTERVAL,
            max_restarts: DEFAULT_MAX_RESTARTS,
        }
    }
}

impl RestartConfig {
    /// Supervised restarts with default interval and ceiling
    pub fn managed() -> Self {
        Self {
            managed: true,
            ..Default::default()
        }
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_max_restarts(mut self, max_restarts: u32) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    /// Replace zero values with defaults
    pub fn normalized(mut self) -> Self {
        if self.max_restarts == 0 {
            self.max_restarts = DEFAULT_MAX_RESTARTS;
        }
        if self.ping_interval.is_zero() {
            self.ping_interval = DEFAULT_PING_INTERVAL;
        }
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Manager Config
// ─────────────────────────────────────────────────────────────────────────────

/// Configuration for a plugin manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub restart: RestartConfig,

    /// Capacity of the crash notification queue and observer channel
    pub notify_buffer: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            restart: RestartConfig::default(),
            notify_buffer: DEFAULT_NOTIFY_BUFFER,
        }
    }
}

impl ManagerConfig {
    pub fn new(restart: RestartConfig) -> Self {
        Self {
            restart,
            ..Default::default()
        }
    }

    pub fn with_notify_buffer(mut self, capacity: usize) -> Self {
        self.notify_buffer = capacity;
        self
    }

    /// Replace zero values with defaults
    pub fn normalized(mut self) -> Self {
        self.restart = self.restart.normalized();
        if self.notify_buffer == 0 {
            self.notify_buffer = DEFAULT_NOTIFY_BUFFER;
        }
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handshake Config
// ─────────────────────────────────────────────────────────────────────────────

/// Handshake shared by a host and the plugins it launches
///
/// The host exports the magic cookie into the child's environment and the
/// plugin refuses to serve without it. This is not a security measure, it
/// only stops a plugin binary from being run by hand by accident.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeConfig {
    pub protocol_version: u32,
    pub magic_cookie_key: String,
    pub magic_cookie_value: String,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            protocol_version: 1,
            magic_cookie_key: "PLUGVISOR_PLUGIN".to_string(),
            magic_cookie_value: "7c1b8f0e-plugvisor".to_string(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Host Config
// ─────────────────────────────────────────────────────────────────────────────

/// Host file (plugvisor.toml)
///
/// ```toml
/// name = "kv"
///
/// [restart]
/// managed = true
/// ping_interval_ms = 2000
/// max_restarts = 3
///
/// [[plugins]]
/// key = "db"
/// bin_path = "/opt/plugins/kv-db"
/// checksum = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Interface name every plugin must dispense
    pub name: String,

    #[serde(default)]
    pub handshake: HandshakeConfig,

    #[serde(default)]
    pub restart: RestartConfig,

    #[serde(default = "default_notify_buffer")]
    pub notify_buffer: usize,

    #[serde(default)]
    pub plugins: Vec<PluginInfo>,
}

fn default_notify_buffer() -> usize {
    DEFAULT_NOTIFY_BUFFER
}

impl HostConfig {
    /// Parse a host file from TOML text
    pub fn from_toml(content: &str) -> PluginResult<Self> {
        let config: HostConfig = toml::from_str(content)
            .map_err(|e| PluginError::Config(format!("Invalid host file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a host file from disk
    pub async fn load(path: &Path) -> PluginResult<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_toml(&content)
    }

    /// Manager settings carried by this file
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            restart: self.restart.clone(),
            notify_buffer: self.notify_buffer,
        }
        .normalized()
    }

    fn validate(&self) -> PluginResult<()> {
        if self.name.trim().is_empty() {
            return Err(PluginError::Config("name must not be empty".into()));
        }

        let mut seen = std::collections::HashSet::new();
        for plugin in &self.plugins {
            if plugin.key.trim().is_empty() {
                return Err(PluginError::Config(format!(
                    "plugin with path {} has an empty key",
                    plugin.bin_path.display()
                )));
            }
            if !seen.insert(plugin.key.as_str()) {
                return Err(PluginError::Config(format!(
                    "duplicate plugin key '{}'",
                    plugin.key
                )));
            }
        }
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
