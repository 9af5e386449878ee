//! Plugvisor
//!
//! Supervisor for out-of-process plugins. A host launches plugin binaries as
//! child processes, keeps a registry of the running ones, watches their
//! health and restarts crashed plugins up to a limit.
//!
//! # Layout
//!
//! - [`manager`]: [`PluginManager`], the public façade
//! - [`instance`]: one running plugin and its health watcher
//! - [`connection`]: the connector interface and the process connector
//! - [`serve`]: the plugin side of the process protocol
//! - [`config`]: manager, restart, handshake and host file settings

pub mod config;
pub mod connection;
pub mod error;
pub mod info;
pub mod instance;
pub mod manager;
pub mod serve;
pub mod supervisor;

mod notify;
mod registry;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{HandshakeConfig, HostConfig, ManagerConfig, RestartConfig};
pub use connection::{Connector, PluginConnection, ProcessConnector, RawCapability, RpcClient};
pub use error::{PluginError, PluginResult};
pub use info::{CrashNotification, PluginInfo};
pub use instance::{PluginInstance, PluginState};
pub use manager::PluginManager;
pub use serve::{PluginHandler, serve};
pub use supervisor::SupervisorState;
