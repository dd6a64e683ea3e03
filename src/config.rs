use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::models::Protocol;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/bkfleet/config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Backup engine invocation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub binary: PathBuf,
    /// Arguments placed before the subcommand.
    pub extra_args: Vec<String>,
    pub repository: String,
    /// Time between SIGTERM and SIGKILL when a run is cancelled.
    pub stop_grace_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("bkfleet-engine"),
            extra_args: Vec::new(),
            repository: "/var/lib/bkfleet/repository".to_string(),
            stop_grace_secs: 10,
        }
    }
}

impl EngineConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

/// How one protocol is reached and mounted.
///
/// Commands are argv templates. Recognised placeholders: `{host}`, `{port}`,
/// `{username}`, `{password}`, `{path}`, `{mount_point}`, `{device}`, `{share}`.
/// An empty unmount command makes unmount a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default)]
    pub port: Option<u16>,
    pub mount_command: Vec<String>,
    #[serde(default)]
    pub unmount_command: Vec<String>,
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

impl ProtocolConfig {
    pub fn default_for(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Smb => Self {
                port: None,
                mount_command: argv(&[
                    "mount",
                    "-t",
                    "cifs",
                    "//{host}/{path}",
                    "{mount_point}",
                    "-o",
                    "ro,port={port},username={username},password={password}",
                ]),
                unmount_command: argv(&["umount", "{mount_point}"]),
            },
            Protocol::Ssh => Self {
                port: None,
                mount_command: argv(&[
                    "sshfs",
                    "-o",
                    "ro,port={port}",
                    "{username}@{host}:/{path}",
                    "{mount_point}",
                ]),
                unmount_command: argv(&["fusermount", "-u", "{mount_point}"]),
            },
            Protocol::Rsync => Self {
                port: None,
                mount_command: argv(&[
                    "rsync",
                    "-a",
                    "--delete",
                    "--port={port}",
                    "rsync://{host}/{path}/",
                    "{mount_point}/",
                ]),
                unmount_command: Vec::new(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolsConfig {
    pub smb: ProtocolConfig,
    pub ssh: ProtocolConfig,
    pub rsync: ProtocolConfig,
}

impl Default for ProtocolsConfig {
    fn default() -> Self {
        Self {
            smb: ProtocolConfig::default_for(Protocol::Smb),
            ssh: ProtocolConfig::default_for(Protocol::Ssh),
            rsync: ProtocolConfig::default_for(Protocol::Rsync),
        }
    }
}

impl ProtocolsConfig {
    pub fn get(&self, protocol: Protocol) -> &ProtocolConfig {
        match protocol {
            Protocol::Smb => &self.smb,
            Protocol::Ssh => &self.ssh,
            Protocol::Rsync => &self.rsync,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// TOML file holding `[global]` and `[[devices]]`.
    pub inventory_path: PathBuf,
    pub execution_log: PathBuf,
    /// Mount points are created beneath this directory.
    pub staging_root: PathBuf,
    pub max_concurrent_backups: usize,
    pub wake_grace_secs: u64,
    pub connect_timeout_secs: u64,
    pub scheduler_tick_millis: u64,
    pub rpc_bind: SocketAddr,
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
    pub engine: EngineConfig,
    pub protocols: ProtocolsConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            inventory_path: PathBuf::from("/etc/bkfleet/inventory.toml"),
            execution_log: PathBuf::from("/var/lib/bkfleet/executions.jsonl"),
            staging_root: PathBuf::from("/var/lib/bkfleet/staging"),
            max_concurrent_backups: 3,
            wake_grace_secs: 60,
            connect_timeout_secs: 10,
            scheduler_tick_millis: 1000,
            rpc_bind: SocketAddr::from(([127, 0, 0, 1], 7373)),
            simulation: false,
            verbose: false,
            json_logs: false,
            engine: EngineConfig::default(),
            protocols: ProtocolsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Layer defaults, the TOML file, `BKFLEET_*` environment variables and
    /// finally CLI overrides. Nested keys use `__` in the environment, e.g.
    /// `BKFLEET_ENGINE__REPOSITORY`.
    pub fn new<T: Serialize>(
        config_file: Option<&Path>,
        overrides: Option<&T>,
    ) -> Result<Self, ConfigError> {
        let path = config_file.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("BKFLEET_").split("__"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        let config: AppConfig = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_backups == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_backups must be at least 1".to_string(),
            ));
        }
        if self.scheduler_tick_millis == 0 {
            return Err(ConfigError::Invalid(
                "scheduler_tick_millis must be at least 1".to_string(),
            ));
        }
        if !self.simulation && self.engine.repository.trim().is_empty() {
            return Err(ConfigError::Invalid("engine.repository is empty".to_string()));
        }
        for protocol in [Protocol::Smb, Protocol::Ssh, Protocol::Rsync] {
            if self.protocols.get(protocol).mount_command.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "protocols.{}.mount_command is empty",
                    protocol
                )));
            }
        }
        Ok(())
    }

    pub fn wake_grace(&self) -> Duration {
        Duration::from_secs(self.wake_grace_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[derive(Serialize)]
    struct Overrides {
        #[serde(skip_serializing_if = "Option::is_none")]
        simulation: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        max_concurrent_backups: Option<usize>,
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            AppConfig::new(Some(&dir.path().join("absent.toml")), None::<&Overrides>).unwrap();
        assert_eq!(config.max_concurrent_backups, 3);
        assert_eq!(config.rpc_bind.port(), 7373);
        assert_eq!(config.protocols.smb, ProtocolConfig::default_for(Protocol::Smb));
    }

    #[test]
    fn file_then_cli_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
max_concurrent_backups = 5
wake_grace_secs = 5

[engine]
repository = "/srv/repo"
"#
        )
        .unwrap();

        let overrides = Overrides {
            simulation: Some(true),
            max_concurrent_backups: None,
        };
        let config = AppConfig::new(Some(file.path()), Some(&overrides)).unwrap();
        assert_eq!(config.max_concurrent_backups, 5);
        assert_eq!(config.wake_grace(), Duration::from_secs(5));
        assert_eq!(config.engine.repository, "/srv/repo");
        // untouched engine fields keep their defaults
        assert_eq!(config.engine.stop_grace_secs, 10);
        assert!(config.simulation);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let overrides = Overrides {
            simulation: None,
            max_concurrent_backups: Some(0),
        };
        let err = AppConfig::new(Some(&dir.path().join("absent.toml")), Some(&overrides));
        assert!(matches!(err, Err(ConfigError::Invalid(_))));
    }
}
