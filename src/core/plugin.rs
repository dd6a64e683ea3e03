//! Protocol plugins: reachability, mounting and waking of source devices.

mod command;
mod simulated;

pub use command::CommandPlugin;
pub use simulated::SimulatedPlugin;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::AppConfig;
use crate::core::models::{Device, Protocol, Share};
use crate::core::wake;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("{0}")]
    Unreachable(String),

    #[error("{0}")]
    Mount(String),

    #[error("{0}")]
    Unmount(String),

    #[error("wake-on-lan: {0}")]
    Wake(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ProtocolPlugin: Send + Sync {
    /// Cheap reachability probe. Must not move any data.
    async fn test_connection(&self, device: &Device) -> Result<(), PluginError>;

    /// Make the share (or the whole device when `share` is `None`) available
    /// locally and return the path the engine should read.
    async fn mount(&self, device: &Device, share: Option<&Share>) -> Result<PathBuf, PluginError>;

    /// Undo a successful `mount`.
    async fn unmount(&self, mount_point: &Path) -> Result<(), PluginError>;

    /// Send a wake-on-LAN packet if the device has one configured.
    async fn wake(&self, device: &Device) -> Result<(), PluginError> {
        match &device.wake_on_lan {
            Some(wol) => wake::send_magic_packet(wol).await,
            None => Ok(()),
        }
    }
}

/// One plugin per protocol. Lookup is an exhaustive match, so adding a
/// protocol fails to compile until it has a plugin.
#[derive(Clone)]
pub struct PluginRegistry {
    smb: Arc<dyn ProtocolPlugin>,
    ssh: Arc<dyn ProtocolPlugin>,
    rsync: Arc<dyn ProtocolPlugin>,
}

impl PluginRegistry {
    pub fn new(
        smb: Arc<dyn ProtocolPlugin>,
        ssh: Arc<dyn ProtocolPlugin>,
        rsync: Arc<dyn ProtocolPlugin>,
    ) -> Self {
        Self { smb, ssh, rsync }
    }

    /// Serve every protocol with the same plugin.
    pub fn uniform(plugin: Arc<dyn ProtocolPlugin>) -> Self {
        Self {
            smb: plugin.clone(),
            ssh: plugin.clone(),
            rsync: plugin,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let build = |protocol: Protocol| -> Arc<dyn ProtocolPlugin> {
            Arc::new(CommandPlugin::new(
                protocol,
                config.protocols.get(protocol).clone(),
                config.staging_root.clone(),
                config.connect_timeout(),
            ))
        };
        Self::new(
            build(Protocol::Smb),
            build(Protocol::Ssh),
            build(Protocol::Rsync),
        )
    }

    pub fn for_protocol(&self, protocol: Protocol) -> Arc<dyn ProtocolPlugin> {
        match protocol {
            Protocol::Smb => self.smb.clone(),
            Protocol::Ssh => self.ssh.clone(),
            Protocol::Rsync => self.rsync.clone(),
        }
    }
}
