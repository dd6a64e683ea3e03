use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::{Captures, Regex};
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::ProtocolConfig;
use crate::core::models::{Device, Protocol, Share, WHOLE_DEVICE};
use crate::core::plugin::{PluginError, ProtocolPlugin};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{([a-z_]+)\}").unwrap());

/// Plugin driven entirely by configuration: reachability is a TCP connect to
/// the protocol port, mount and unmount run the configured argv templates.
pub struct CommandPlugin {
    protocol: Protocol,
    config: ProtocolConfig,
    staging_root: PathBuf,
    connect_timeout: Duration,
}

impl CommandPlugin {
    pub fn new(
        protocol: Protocol,
        config: ProtocolConfig,
        staging_root: PathBuf,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            protocol,
            config,
            staging_root,
            connect_timeout,
        }
    }

    fn port(&self, device: &Device) -> u16 {
        device
            .port
            .or(self.config.port)
            .unwrap_or_else(|| self.protocol.default_port())
    }

    /// Where the share of `device` is mounted under the staging root.
    pub fn mount_point(&self, device: &Device, share: Option<&Share>) -> PathBuf {
        let dir = share.map_or(WHOLE_DEVICE, |s| s.id.as_str());
        self.staging_root
            .join(path_component(&device.id))
            .join(path_component(dir))
    }
}

fn path_component(id: &str) -> String {
    id.replace(['/', '\\'], "_")
}

/// Substitute `{name}` placeholders. Unknown names are left untouched.
pub(crate) fn render(template: &[String], values: &HashMap<&str, String>) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            PLACEHOLDER
                .replace_all(arg, |caps: &Captures| {
                    values
                        .get(&caps[1])
                        .cloned()
                        .unwrap_or_else(|| caps[0].to_string())
                })
                .into_owned()
        })
        .collect()
}

async fn run(argv: &[String]) -> Result<(), String> {
    let Some((program, args)) = argv.split_first() else {
        return Ok(());
    };

    // Arguments can carry credentials, so only the program name is logged.
    debug!(program = %program, "Running plugin command");
    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| format!("failed to run {}: {}", program, e))?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr.lines().last().unwrap_or("").trim();
        Err(format!("{} exited with {}: {}", program, output.status, detail))
    }
}

#[async_trait]
impl ProtocolPlugin for CommandPlugin {
    async fn test_connection(&self, device: &Device) -> Result<(), PluginError> {
        let addr = format!("{}:{}", device.host, self.port(device));
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(_)) => {
                debug!(device = %device.id, addr = %addr, "Device reachable");
                Ok(())
            }
            Ok(Err(e)) => Err(PluginError::Unreachable(format!("{}: {}", addr, e))),
            Err(_) => Err(PluginError::Unreachable(format!(
                "{}: timed out after {}s",
                addr,
                self.connect_timeout.as_secs()
            ))),
        }
    }

    async fn mount(&self, device: &Device, share: Option<&Share>) -> Result<PathBuf, PluginError> {
        let mount_point = self.mount_point(device, share);
        tokio::fs::create_dir_all(&mount_point).await.map_err(|e| {
            PluginError::Mount(format!("cannot create {}: {}", mount_point.display(), e))
        })?;

        let values = HashMap::from([
            ("host", device.host.clone()),
            ("port", self.port(device).to_string()),
            ("username", device.username.clone().unwrap_or_default()),
            ("password", device.password.clone().unwrap_or_default()),
            (
                "path",
                share
                    .map(|s| s.path.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
            ),
            ("mount_point", mount_point.display().to_string()),
            ("device", device.id.clone()),
            ("share", share.map(|s| s.id.clone()).unwrap_or_default()),
        ]);

        run(&render(&self.config.mount_command, &values))
            .await
            .map_err(PluginError::Mount)?;

        info!(device = %device.id, mount_point = %mount_point.display(), "Mounted");
        Ok(mount_point)
    }

    async fn unmount(&self, mount_point: &Path) -> Result<(), PluginError> {
        let values = HashMap::from([("mount_point", mount_point.display().to_string())]);
        run(&render(&self.config.unmount_command, &values))
            .await
            .map_err(PluginError::Unmount)?;

        // Only succeeds for an empty directory, which is what a clean unmount leaves.
        if let Err(e) = tokio::fs::remove_dir(mount_point).await {
            debug!(mount_point = %mount_point.display(), error = %e, "Mount point left in place");
        }
        if !self.config.unmount_command.is_empty() {
            info!(mount_point = %mount_point.display(), "Unmounted");
        } else {
            warn!(mount_point = %mount_point.display(), "No unmount command configured; staging copy kept");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn plugin(config: ProtocolConfig, root: &Path) -> CommandPlugin {
        CommandPlugin::new(
            Protocol::Smb,
            config,
            root.to_path_buf(),
            Duration::from_millis(500),
        )
    }

    fn template(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn renders_known_placeholders_only() {
        let values = HashMap::from([("host", "10.0.0.2".to_string()), ("path", "docs".to_string())]);
        let argv = render(
            &template(&["//{host}/{path}", "{unknown}", "-o", "x={host}"]),
            &values,
        );
        assert_eq!(argv, vec!["//10.0.0.2/docs", "{unknown}", "-o", "x=10.0.0.2"]);
    }

    #[tokio::test]
    async fn connection_test_uses_device_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let dir = tempfile::tempdir().unwrap();
        let plugin = plugin(ProtocolConfig::default_for(Protocol::Smb), dir.path());

        let mut device = Device::new("nas", Protocol::Smb, "127.0.0.1");
        device.port = Some(port);
        plugin.test_connection(&device).await.unwrap();

        drop(listener);
        assert!(matches!(
            plugin.test_connection(&device).await,
            Err(PluginError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn mount_and_unmount_run_templates() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProtocolConfig {
            port: None,
            mount_command: template(&["touch", "{mount_point}/.mounted-{share}"]),
            unmount_command: template(&["rm", "{mount_point}/.mounted-docs"]),
        };
        let plugin = plugin(config, dir.path());
        let device = Device::new("nas", Protocol::Smb, "127.0.0.1");
        let share = Share::new("docs", "/srv/docs");

        let mount_point = plugin.mount(&device, Some(&share)).await.unwrap();
        assert_eq!(mount_point, dir.path().join("nas").join("docs"));
        assert!(mount_point.join(".mounted-docs").exists());

        plugin.unmount(&mount_point).await.unwrap();
        assert!(!mount_point.exists());
    }

    #[tokio::test]
    async fn failing_mount_command_is_a_mount_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProtocolConfig {
            port: None,
            mount_command: template(&["false"]),
            unmount_command: Vec::new(),
        };
        let plugin = plugin(config, dir.path());
        let device = Device::new("nas", Protocol::Smb, "127.0.0.1");

        assert!(matches!(
            plugin.mount(&device, None).await,
            Err(PluginError::Mount(_))
        ));
    }
}
