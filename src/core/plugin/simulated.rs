use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::info;

use crate::core::models::{Device, Share, WHOLE_DEVICE};
use crate::core::plugin::{PluginError, ProtocolPlugin};

#[derive(Debug, Default)]
struct SimState {
    unreachable: bool,
    mount_fails: bool,
    unmount_fails: bool,
    mounted: HashSet<PathBuf>,
    connection_tests: u64,
    mounts: u64,
    unmounts: u64,
    wakes: u64,
}

/// In-memory plugin for simulation mode and tests. Nothing touches the
/// network or the filesystem; failures are switched on per instance.
#[derive(Clone)]
pub struct SimulatedPlugin {
    root: PathBuf,
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedPlugin {
    fn default() -> Self {
        Self::new("/tmp/bkfleet-sim")
    }
}

impl SimulatedPlugin {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    pub fn set_mount_fails(&self, fails: bool) {
        self.state().mount_fails = fails;
    }

    pub fn set_unmount_fails(&self, fails: bool) {
        self.state().unmount_fails = fails;
    }

    /// Paths currently mounted.
    pub fn mounted(&self) -> Vec<PathBuf> {
        self.state().mounted.iter().cloned().collect()
    }

    pub fn connection_tests(&self) -> u64 {
        self.state().connection_tests
    }

    pub fn mounts(&self) -> u64 {
        self.state().mounts
    }

    pub fn unmounts(&self) -> u64 {
        self.state().unmounts
    }

    pub fn wakes(&self) -> u64 {
        self.state().wakes
    }
}

#[async_trait]
impl ProtocolPlugin for SimulatedPlugin {
    async fn test_connection(&self, device: &Device) -> Result<(), PluginError> {
        let mut state = self.state();
        state.connection_tests += 1;
        if state.unreachable {
            return Err(PluginError::Unreachable(format!(
                "{}: simulated connection refused",
                device.host
            )));
        }
        Ok(())
    }

    async fn mount(&self, device: &Device, share: Option<&Share>) -> Result<PathBuf, PluginError> {
        let mut state = self.state();
        if state.mount_fails {
            return Err(PluginError::Mount(format!(
                "simulated mount failure on {}",
                device.id
            )));
        }
        let path = self
            .root
            .join(&device.id)
            .join(share.map_or(WHOLE_DEVICE, |s| s.id.as_str()));
        state.mounts += 1;
        state.mounted.insert(path.clone());
        info!(device = %device.id, path = %path.display(), "(Simulated) mounted");
        Ok(path)
    }

    async fn unmount(&self, mount_point: &Path) -> Result<(), PluginError> {
        let mut state = self.state();
        state.unmounts += 1;
        state.mounted.remove(mount_point);
        if state.unmount_fails {
            return Err(PluginError::Unmount(format!(
                "simulated unmount failure on {}",
                mount_point.display()
            )));
        }
        Ok(())
    }

    async fn wake(&self, device: &Device) -> Result<(), PluginError> {
        if device.wake_on_lan.is_some() {
            self.state().wakes += 1;
        }
        Ok(())
    }
}
