//! Plugin Errors
//!
//! Every fallible operation in the crate returns [`PluginResult`]. Crash
//! detection is not an error: it travels as a
//! [`CrashNotification`](crate::CrashNotification) instead.

use std::path::PathBuf;
use std::sync::Arc;

/// Errors that can occur while managing plugins
#[derive(Debug, Clone, thiserror::Error)]
pub enum PluginError {
    #[error("Plugin not found: {0}")]
    NotFound(String),

    #[error("Plugin already running: {0}")]
    AlreadyRunning(String),

    #[error("Plugin manager is shutting down")]
    ShuttingDown,

    #[error("Checksum mismatch for {}: expected {expected}, got {actual}", .path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("Invalid checksum '{checksum}': {reason}")]
    InvalidChecksum { checksum: String, reason: String },

    #[error("Plugin handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Plugin connection error: {0}")]
    Connection(String),

    #[error("Failed to dispense '{name}': {reason}")]
    Dispense { name: String, reason: String },

    #[error("Plugin '{key}' does not implement the '{name}' interface")]
    InterfaceMismatch { key: String, name: String },

    #[error("Plugin call '{method}' failed: {message}")]
    Call { method: String, message: String },

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for PluginError {
    fn from(err: std::io::Error) -> Self {
        PluginError::Io(Arc::new(err))
    }
}

impl PluginError {
    /// Whether the error means the key was not registered
    pub fn is_not_found(&self) -> bool {
        matches!(self, PluginError::NotFound(_))
    }
}

/// Result type for plugin operations
pub type PluginResult<T> = Result<T, PluginError>;
