use std::path::Path;

use anyhow::{Context, Result};

pub mod execution_log;

pub use execution_log::{ExecutionLog, replay};

/// Open (creating if needed) the execution log at `path`.
pub async fn init(path: &Path) -> Result<ExecutionLog> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    ExecutionLog::open(path)
        .await
        .with_context(|| format!("Failed to open execution log {}", path.display()))
}
