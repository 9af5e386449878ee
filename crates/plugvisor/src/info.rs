//! Plugin metadata passed between callers and the manager

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Metadata describing one plugin slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Caller-assigned key, unique within one manager
    pub key: String,

    /// Path to the plugin binary
    pub bin_path: PathBuf,

    /// Expected SHA-256 of the binary, hex encoded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,

    /// Times the manager has restarted this plugin
    #[serde(default)]
    pub restarts: u32,
}

impl PluginInfo {
    pub fn new(key: impl Into<String>, bin_path: impl Into<PathBuf>) -> Self {
        Self {
            key: key.into(),
            bin_path: bin_path.into(),
            checksum: None,
            restarts: 0,
        }
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    pub fn with_restarts(mut self, restarts: u32) -> Self {
        self.restarts = restarts;
        self
    }
}

/// Sent when a watcher sees its plugin die
///
/// Carries enough metadata to relaunch the plugin. `generation` identifies
/// the instance that died so a notification outliving its instance can be
/// told apart from one about the instance currently registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashNotification {
    pub key: String,
    pub bin_path: PathBuf,
    pub checksum: Option<String>,
    pub restarts: u32,
    pub generation: u64,
}

impl CrashNotification {
    pub fn new(info: &PluginInfo, generation: u64) -> Self {
        Self {
            key: info.key.clone(),
            bin_path: info.bin_path.clone(),
            checksum: info.checksum.clone(),
            restarts: info.restarts,
            generation,
        }
    }

    /// Metadata needed to launch the plugin again
    pub fn to_info(&self) -> PluginInfo {
        PluginInfo {
            key: self.key.clone(),
            bin_path: self.bin_path.clone(),
            checksum: self.checksum.clone(),
            restarts: self.restarts,
        }
    }
}
