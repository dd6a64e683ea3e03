//! Append-only execution log.
//!
//! One JSON object per line, each a full `BackupJob`. A job is written when
//! it starts and again when it ends, so the newest line for an id is its
//! current state. Writes go through a single async mutex and are synced
//! before `append` returns.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex;
use tracing::warn;

use crate::core::models::BackupJob;

#[derive(Clone)]
pub struct ExecutionLog {
    path: PathBuf,
    writer: Arc<Mutex<File>>,
}

impl ExecutionLog {
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)
            .await?;

        // A crash mid-write leaves a torn last line; start the next entry on
        // a fresh line so only the torn one is lost.
        let len = file.metadata().await?.len();
        if len > 0 {
            file.seek(SeekFrom::Start(len - 1)).await?;
            let mut last = [0u8; 1];
            file.read_exact(&mut last).await?;
            if last[0] != b'\n' {
                file.write_all(b"\n").await?;
                file.sync_data().await?;
            }
        }

        Ok(Self {
            path,
            writer: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durably append the job's current state.
    pub async fn append(&self, job: &BackupJob) -> io::Result<()> {
        let mut line = serde_json::to_vec(job)?;
        line.push(b'\n');

        let mut file = self.writer.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        file.sync_data().await
    }

    /// Latest state of every job ever logged.
    pub async fn load_all(&self) -> io::Result<HashMap<String, BackupJob>> {
        // Hold the writer so no append lands half-read.
        let _writer = self.writer.lock().await;
        let bytes = tokio::fs::read(&self.path).await?;
        Ok(replay(&bytes))
    }

    pub async fn get(&self, job_id: &str) -> io::Result<Option<BackupJob>> {
        Ok(self.load_all().await?.remove(job_id))
    }

    /// Most recently created jobs first.
    pub async fn history(&self, limit: usize) -> io::Result<Vec<BackupJob>> {
        let mut jobs: Vec<BackupJob> = self.load_all().await?.into_values().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        jobs.truncate(limit);
        Ok(jobs)
    }
}

/// Fold log contents into the latest entry per job id. Lines that are not
/// valid UTF-8 or not a job are skipped with a warning.
pub fn replay(bytes: &[u8]) -> HashMap<String, BackupJob> {
    let mut jobs = HashMap::new();

    for (idx, raw) in bytes.split(|b| *b == b'\n').enumerate() {
        let line_no = idx + 1;
        let Ok(line) = std::str::from_utf8(raw) else {
            warn!(line = line_no, "Skipping non UTF-8 execution log line");
            continue;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<BackupJob>(line) {
            Ok(job) => {
                jobs.insert(job.id.clone(), job);
            }
            Err(e) => warn!(line = line_no, error = %e, "Skipping malformed execution log line"),
        }
    }

    jobs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{FailureKind, JobFailure, JobRequest, JobStatus};

    fn job(device: &str) -> BackupJob {
        BackupJob::new(&JobRequest::manual(device, Some("docs".to_string())))
    }

    #[tokio::test]
    async fn last_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        let log = ExecutionLog::open(dir.path().join("log.jsonl")).await.unwrap();

        let mut job = job("nas");
        log.append(&job).await.unwrap();
        job.mark_running();
        log.append(&job).await.unwrap();
        job.finish(
            JobStatus::Failed,
            Some(JobFailure {
                kind: FailureKind::Mount,
                message: "denied".to_string(),
            }),
        );
        log.append(&job).await.unwrap();

        let all = log.load_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[&job.id].status, JobStatus::Failed);
        assert_eq!(all[&job.id], job);
    }

    #[test]
    fn replay_tolerates_corrupt_lines() {
        let first = job("nas");
        let mut second = job("pc");
        let mut bytes = Vec::new();
        bytes.extend(serde_json::to_vec(&first).unwrap());
        bytes.extend(b"\n{\"id\": \"half a li\n");
        bytes.extend(b"\xff\xfe\xfd\n");
        bytes.extend(b"[1, 2, 3]\n\n");
        bytes.extend(serde_json::to_vec(&second).unwrap());
        bytes.push(b'\n');
        second.finish(JobStatus::Completed, None);
        bytes.extend(serde_json::to_vec(&second).unwrap());

        let jobs = replay(&bytes);
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[&first.id].status, JobStatus::Pending);
        assert_eq!(jobs[&second.id].status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn reopen_after_torn_write_keeps_new_entries_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let kept = job("nas");
        let mut contents = serde_json::to_vec(&kept).unwrap();
        contents.extend(b"\n{\"id\":\"torn");
        tokio::fs::write(&path, &contents).await.unwrap();

        let log = ExecutionLog::open(&path).await.unwrap();
        let fresh = job("pc");
        log.append(&fresh).await.unwrap();

        let all = log.load_all().await.unwrap();
        assert!(all.contains_key(&kept.id));
        assert!(all.contains_key(&fresh.id));
    }

    #[tokio::test]
    async fn history_is_newest_first_and_limited() {
        let dir = tempfile::tempdir().unwrap();
        let log = ExecutionLog::open(dir.path().join("log.jsonl")).await.unwrap();
        let mut ids = Vec::new();
        for device in ["a", "b", "c"] {
            let j = job(device);
            ids.push(j.id.clone());
            log.append(&j).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let history = log.history(2).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, ids[2]);
        assert_eq!(history[1].id, ids[1]);
    }
}
