//! Device and share inventory.
//!
//! The orchestrator only reads the inventory. Every scheduling pass and every
//! execution asks the store again, so edits take effect on the next
//! `reschedule_all` without a restart.

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::core::models::{Device, GlobalConfig, Share, check_id};

#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn global_config(&self) -> Result<GlobalConfig>;

    async fn list_devices(&self) -> Result<Vec<Device>>;

    /// Shares of one device, or an empty list if the device is unknown.
    async fn list_shares(&self, device_id: &str) -> Result<Vec<Share>>;

    async fn device(&self, device_id: &str) -> Result<Option<Device>> {
        Ok(self
            .list_devices()
            .await?
            .into_iter()
            .find(|d| d.id == device_id))
    }
}

#[derive(Debug, Default, Deserialize)]
struct InventoryFile {
    #[serde(default)]
    global: GlobalConfig,
    #[serde(default)]
    devices: Vec<DeviceEntry>,
}

#[derive(Debug, Deserialize)]
struct DeviceEntry {
    #[serde(flatten)]
    device: Device,
    #[serde(default)]
    shares: Vec<Share>,
}

/// Inventory kept in a TOML file:
///
/// ```toml
/// [global]
/// schedule = "0 2 * * *"
///
/// [[devices]]
/// id = "nas"
/// protocol = "smb"
/// host = "10.0.0.2"
/// exclude = ["*.tmp"]
///
/// [[devices.shares]]
/// id = "photos"
/// path = "/photos"
/// schedule = "0 3 * * SUN"
/// ```
///
/// The file is read on every call.
pub struct TomlInventory {
    path: PathBuf,
}

impl TomlInventory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> Result<InventoryFile> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read inventory {}", self.path.display()))?;
        parse_inventory(&raw)
            .with_context(|| format!("Invalid inventory {}", self.path.display()))
    }
}

fn parse_inventory(raw: &str) -> Result<InventoryFile> {
    let file: InventoryFile = toml::from_str(raw)?;

    let mut device_ids = HashSet::new();
    for entry in &file.devices {
        check_id("device", &entry.device.id).map_err(anyhow::Error::msg)?;
        for share in &entry.shares {
            check_id("share", &share.id)
                .map_err(|e| anyhow!("device '{}': {}", entry.device.id, e))?;
        }
        if !device_ids.insert(entry.device.id.as_str()) {
            bail!("duplicate device id '{}'", entry.device.id);
        }
        let mut share_ids = HashSet::new();
        for share in &entry.shares {
            if !share_ids.insert(share.id.as_str()) {
                bail!(
                    "duplicate share id '{}' on device '{}'",
                    share.id,
                    entry.device.id
                );
            }
        }
    }
    Ok(file)
}

#[async_trait]
impl ConfigStore for TomlInventory {
    async fn global_config(&self) -> Result<GlobalConfig> {
        Ok(self.load().await?.global)
    }

    async fn list_devices(&self) -> Result<Vec<Device>> {
        Ok(self
            .load()
            .await?
            .devices
            .into_iter()
            .map(|e| e.device)
            .collect())
    }

    async fn list_shares(&self, device_id: &str) -> Result<Vec<Share>> {
        Ok(self
            .load()
            .await?
            .devices
            .into_iter()
            .find(|e| e.device.id == device_id)
            .map(|e| e.shares)
            .unwrap_or_default())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    global: GlobalConfig,
    devices: Vec<(Device, Vec<Share>)>,
}

/// Inventory held in memory, for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryInventory {
    state: RwLock<MemoryState>,
}

impl MemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_global(&self, global: GlobalConfig) {
        self.state.write().await.global = global;
    }

    /// Insert or replace a device, keeping its shares.
    pub async fn upsert_device(&self, device: Device) {
        let mut state = self.state.write().await;
        match state.devices.iter_mut().find(|(d, _)| d.id == device.id) {
            Some((existing, _)) => *existing = device,
            None => state.devices.push((device, Vec::new())),
        }
    }

    /// Insert or replace a share. Returns `false` if the device is unknown.
    pub async fn upsert_share(&self, device_id: &str, share: Share) -> bool {
        let mut state = self.state.write().await;
        let Some((_, shares)) = state.devices.iter_mut().find(|(d, _)| d.id == device_id) else {
            return false;
        };
        match shares.iter_mut().find(|s| s.id == share.id) {
            Some(existing) => *existing = share,
            None => shares.push(share),
        }
        true
    }

    pub async fn remove_device(&self, device_id: &str) -> bool {
        let mut state = self.state.write().await;
        let before = state.devices.len();
        state.devices.retain(|(d, _)| d.id != device_id);
        state.devices.len() != before
    }

    pub async fn remove_share(&self, device_id: &str, share_id: &str) -> bool {
        let mut state = self.state.write().await;
        match state.devices.iter_mut().find(|(d, _)| d.id == device_id) {
            Some((_, shares)) => {
                let before = shares.len();
                shares.retain(|s| s.id != share_id);
                shares.len() != before
            }
            None => false,
        }
    }
}

#[async_trait]
impl ConfigStore for MemoryInventory {
    async fn global_config(&self) -> Result<GlobalConfig> {
        Ok(self.state.read().await.global.clone())
    }

    async fn list_devices(&self) -> Result<Vec<Device>> {
        Ok(self
            .state
            .read()
            .await
            .devices
            .iter()
            .map(|(d, _)| d.clone())
            .collect())
    }

    async fn list_shares(&self, device_id: &str) -> Result<Vec<Share>> {
        Ok(self
            .state
            .read()
            .await
            .devices
            .iter()
            .find(|(d, _)| d.id == device_id)
            .map(|(_, shares)| shares.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{Protocol, Schedule};
    use std::io::Write;

    const SAMPLE: &str = r#"
[global]
schedule = "0 2 * * *"
exclude = ["*.tmp"]

[global.retention]
keep_daily = 14

[[devices]]
id = "nas"
protocol = "smb"
host = "10.0.0.2"
username = "backup"
password = "hunter2"

[devices.wake_on_lan]
mac = "AA:BB:CC:DD:EE:FF"

[[devices.shares]]
id = "photos"
path = "/photos"
schedule = "off"

[[devices.shares]]
id = "docs"
path = "/docs"

[[devices]]
id = "laptop"
protocol = "ssh"
host = "laptop.lan"
port = 2222
enabled = false
"#;

    #[tokio::test]
    async fn reads_nested_inventory_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let store = TomlInventory::new(file.path());

        let global = store.global_config().await.unwrap();
        assert_eq!(
            global.overrides.schedule,
            Some(Schedule::Cron("0 2 * * *".to_string()))
        );
        assert_eq!(global.overrides.retention.keep_daily, Some(14));

        let devices = store.list_devices().await.unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].protocol, Protocol::Smb);
        assert_eq!(devices[0].password.as_deref(), Some("hunter2"));
        assert_eq!(devices[0].wake_on_lan.as_ref().unwrap().port, 9);
        assert_eq!(devices[1].port, Some(2222));
        assert!(!devices[1].enabled);

        let shares = store.list_shares("nas").await.unwrap();
        assert_eq!(shares.len(), 2);
        assert_eq!(shares[0].overrides.schedule, Some(Schedule::Disabled));
        assert!(store.list_shares("laptop").await.unwrap().is_empty());
        assert!(store.list_shares("ghost").await.unwrap().is_empty());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let raw = r#"
[[devices]]
id = "nas"
protocol = "smb"
host = "a"

[[devices]]
id = "nas"
protocol = "ssh"
host = "b"
"#;
        assert!(parse_inventory(raw).is_err());
    }

    #[test]
    fn ids_that_break_archive_names_are_rejected() {
        let dotted_device = r#"
[[devices]]
id = "nas.local"
protocol = "smb"
host = "a"
"#;
        let err = parse_inventory(dotted_device).unwrap_err();
        assert!(err.to_string().contains("invalid character '.'"), "{}", err);

        let reserved_share = r#"
[[devices]]
id = "nas"
protocol = "smb"
host = "a"

[[devices.shares]]
id = "_device"
path = "/"
"#;
        let err = parse_inventory(reserved_share).unwrap_err();
        assert!(err.to_string().contains("must not start with '_'"), "{}", err);
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = TomlInventory::new(dir.path().join("nope.toml"));
        assert!(store.list_devices().await.is_err());
    }

    #[tokio::test]
    async fn memory_inventory_upserts() {
        let store = MemoryInventory::new();
        store
            .upsert_device(Device::new("nas", Protocol::Rsync, "10.0.0.3"))
            .await;
        assert!(store.upsert_share("nas", Share::new("docs", "/docs")).await);
        assert!(!store.upsert_share("ghost", Share::new("docs", "/docs")).await);

        let mut replacement = Device::new("nas", Protocol::Rsync, "10.0.0.4");
        replacement.enabled = false;
        store.upsert_device(replacement).await;

        let device = store.device("nas").await.unwrap().unwrap();
        assert_eq!(device.host, "10.0.0.4");
        assert_eq!(store.list_shares("nas").await.unwrap().len(), 1);

        assert!(store.remove_share("nas", "docs").await);
        assert!(store.remove_device("nas").await);
        assert!(store.device("nas").await.unwrap().is_none());
    }
}
