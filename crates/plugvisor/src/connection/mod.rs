//! Plugin Connections
//!
//! The manager never talks to a plugin process directly. It asks a
//! [`Connector`] for a [`PluginConnection`], dispenses the capability it
//! needs from that connection, and polls the connection's health.
//!
//! [`process::ProcessConnector`] is the connector shipped with the crate: it
//! launches the plugin binary as a child process and speaks the framed
//! protocol in [`ipc`] over its stdio.

pub mod checksum;
pub mod ipc;
pub mod process;
pub mod rpc;

pub use process::ProcessConnector;
pub use rpc::RpcClient;

use std::any::Any;

use async_trait::async_trait;

use crate::error::PluginResult;
use crate::info::PluginInfo;

/// Untyped capability handed out by a connection
///
/// The manager downcasts it to its capability type and reports
/// [`PluginError::InterfaceMismatch`](crate::PluginError::InterfaceMismatch)
/// when the types differ.
pub type RawCapability = Box<dyn Any + Send + Sync>;

/// A live connection to one plugin process
#[async_trait]
pub trait PluginConnection: Send + Sync + 'static {
    /// Obtain the capability registered under `name`
    fn dispense(&self, name: &str) -> PluginResult<RawCapability>;

    /// Whether the plugin process is alive and answering
    async fn is_healthy(&self) -> bool;

    /// Release the connection and its process
    ///
    /// Must be safe to call more than once.
    async fn close(&self);
}

/// Launches plugins and connects to them
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Launch the plugin described by `info` and connect to it
    ///
    /// Implementations verify `info.checksum` (when set) before launching.
    async fn connect(&self, info: &PluginInfo) -> PluginResult<Box<dyn PluginConnection>>;
}
