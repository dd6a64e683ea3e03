use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::sync::LazyLock;
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Split};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::config::EngineConfig;
use crate::core::engine::{
    BackupEngine, EngineError, EngineEvent, EngineFailure, EngineFuture, EngineProgress,
    EngineSummary, PruneRequest, SnapshotRequest,
};

/// Stderr lines kept for error reporting.
const STDERR_TAIL: usize = 20;

static STORAGE_EXHAUSTED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)no space left on device|disk (is )?full|storage exhausted|insufficient (disk )?space|quota exceeded")
        .unwrap()
});

/// Parse one line of engine stdout.
pub fn parse_event_line(line: &str) -> Result<EngineEvent, serde_json::Error> {
    serde_json::from_str(line.trim())
}

/// Lazy, finite sequence of events read from one engine invocation.
///
/// Lines that are not valid events are logged and skipped.
pub struct EventStream<R> {
    lines: Split<BufReader<R>>,
    skipped: u64,
}

impl<R: AsyncRead + Unpin> EventStream<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).split(b'\n'),
            skipped: 0,
        }
    }

    /// Next well-formed event, or `None` at end of output.
    pub async fn next_event(&mut self) -> Option<EngineEvent> {
        loop {
            let raw = match self.lines.next_segment().await {
                Ok(Some(raw)) => raw,
                Ok(None) => return None,
                Err(e) => {
                    warn!(error = %e, "Failed reading engine output");
                    return None;
                }
            };

            let line = String::from_utf8_lossy(&raw);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match parse_event_line(line) {
                Ok(event) => return Some(event),
                Err(e) => {
                    self.skipped += 1;
                    let preview: String = line.chars().take(120).collect();
                    warn!(line = %preview, error = %e, "Skipping malformed engine output line");
                }
            }
        }
    }

    /// Number of malformed lines skipped so far.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

/// Everything observed from one engine process.
struct EngineRun {
    status: ExitStatus,
    summary: Option<EngineSummary>,
    reported_error: Option<EngineFailure>,
    stderr_tail: Vec<String>,
}

impl EngineRun {
    fn storage_exhausted(&self) -> Option<String> {
        if let Some(err) = &self.reported_error {
            let by_kind = err.kind.as_deref() == Some("storage_exhausted");
            if by_kind || STORAGE_EXHAUSTED.is_match(&err.message) {
                return Some(err.message.clone());
            }
        }
        self.stderr_tail
            .iter()
            .find(|line| STORAGE_EXHAUSTED.is_match(line))
            .cloned()
    }

    fn failure(&self, what: &str) -> EngineError {
        if let Some(message) = self.storage_exhausted() {
            return EngineError::StorageExhausted(message);
        }
        let detail = self
            .reported_error
            .as_ref()
            .map(|e| e.message.clone())
            .or_else(|| self.stderr_tail.last().cloned())
            .unwrap_or_else(|| "no diagnostic output".to_string());
        EngineError::Failed(format!("{} ({}): {}", what, self.status, detail))
    }
}

/// Runs the configured engine binary.
///
/// Invocations look like
/// `<binary> <extra_args..> create --json-lines --repo <repo> --archive <name> [--include p].. [--exclude p].. <source>`
/// and `<binary> <extra_args..> prune --json-lines --repo <repo> --prefix <prefix> --keep-latest N ..`.
pub struct SubprocessEngine {
    config: EngineConfig,
}

impl SubprocessEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    fn command(&self, subcommand: &str) -> Command {
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(&self.config.extra_args)
            .arg(subcommand)
            .arg("--json-lines")
            .arg("--repo")
            .arg(&self.config.repository)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl BackupEngine for SubprocessEngine {
    fn create(
        &self,
        req: &SnapshotRequest,
        tx: mpsc::Sender<EngineProgress>,
        cancel: CancellationToken,
    ) -> EngineFuture<EngineSummary> {
        let mut cmd = self.command("create");
        cmd.arg("--archive").arg(&req.archive_name);
        for pattern in &req.rules.include {
            cmd.arg("--include").arg(pattern);
        }
        for pattern in &req.rules.exclude {
            cmd.arg("--exclude").arg(pattern);
        }
        cmd.arg(&req.source);

        let stop_grace = self.config.stop_grace();
        let span = info_span!("engine_create", job_id = %req.job_id, archive = %req.archive_name);

        Box::pin(
            async move {
                info!("Starting backup engine");
                let run = run_engine(cmd, Some(tx), cancel, stop_grace).await?;
                match run.summary.clone() {
                    Some(summary) => {
                        if !run.status.success() {
                            warn!(status = %run.status, "Engine reported a summary but exited non-zero");
                        }
                        info!(
                            files = summary.files,
                            bytes = summary.bytes,
                            changed_files = summary.changed_files,
                            "Backup engine finished"
                        );
                        Ok(summary)
                    }
                    None if run.status.success() => Err(match run.storage_exhausted() {
                        Some(message) => EngineError::StorageExhausted(message),
                        None => EngineError::Failed(
                            "engine exited without a summary".to_string(),
                        ),
                    }),
                    None => Err(run.failure("engine exited")),
                }
            }
            .instrument(span),
        )
    }

    fn prune(&self, req: &PruneRequest, cancel: CancellationToken) -> EngineFuture<()> {
        let mut cmd = self.command("prune");
        let keep = &req.retention;
        cmd.arg("--prefix")
            .arg(&req.archive_prefix)
            .arg("--keep-latest")
            .arg(keep.keep_latest.to_string())
            .arg("--keep-daily")
            .arg(keep.keep_daily.to_string())
            .arg("--keep-weekly")
            .arg(keep.keep_weekly.to_string())
            .arg("--keep-monthly")
            .arg(keep.keep_monthly.to_string())
            .arg("--keep-yearly")
            .arg(keep.keep_yearly.to_string());

        let stop_grace = self.config.stop_grace();
        let span = info_span!("engine_prune", job_id = %req.job_id, prefix = %req.archive_prefix);

        Box::pin(
            async move {
                debug!("Applying retention");
                let run = run_engine(cmd, None, cancel, stop_grace).await?;
                if run.status.success() {
                    Ok(())
                } else {
                    Err(run.failure("prune exited"))
                }
            }
            .instrument(span),
        )
    }
}

async fn run_engine(
    mut cmd: Command,
    tx: Option<mpsc::Sender<EngineProgress>>,
    cancel: CancellationToken,
    stop_grace: Duration,
) -> Result<EngineRun, EngineError> {
    let mut child = cmd
        .spawn()
        .map_err(|e| EngineError::Failed(format!("failed to spawn backup engine: {}", e)))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| EngineError::Failed("engine stdout not captured".to_string()))?;
    let stderr_task = child.stderr.take().map(|stderr| tokio::spawn(collect_stderr(stderr)));

    let mut events = EventStream::new(stdout);
    let mut summary = None;
    let mut reported_error = None;

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                terminate(&mut child, stop_grace).await;
                return Err(EngineError::Cancelled);
            }
            event = events.next_event() => event,
        };

        match event {
            Some(EngineEvent::Progress(progress)) => {
                if let Some(tx) = &tx {
                    // Receiver gone means nobody is watching; keep draining stdout.
                    let _ = tx.send(progress).await;
                }
            }
            Some(EngineEvent::Summary(s)) => summary = Some(s),
            Some(EngineEvent::Error(err)) => {
                warn!(message = %err.message, kind = ?err.kind, "Engine reported an error");
                reported_error = Some(err);
            }
            None => break,
        }
    }

    let status = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            terminate(&mut child, stop_grace).await;
            return Err(EngineError::Cancelled);
        }
        status = child.wait() => status
            .map_err(|e| EngineError::Failed(format!("failed to wait for engine: {}", e)))?,
    };

    let stderr_tail = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => Vec::new(),
    };

    if events.skipped() > 0 {
        warn!(skipped = events.skipped(), "Engine output contained malformed lines");
    }

    Ok(EngineRun {
        status,
        summary,
        reported_error,
        stderr_tail,
    })
}

async fn collect_stderr<R: AsyncRead + Unpin>(stderr: R) -> Vec<String> {
    let mut lines = BufReader::new(stderr).split(b'\n');
    let mut tail = VecDeque::with_capacity(STDERR_TAIL);
    while let Ok(Some(raw)) = lines.next_segment().await {
        let line = String::from_utf8_lossy(&raw).trim().to_string();
        if line.is_empty() {
            continue;
        }
        debug!(line = %line, "engine stderr");
        if tail.len() == STDERR_TAIL {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into()
}

/// SIGTERM, then SIGKILL if the engine has not exited within `grace`.
async fn terminate(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(pid, error = %e, "Failed to signal engine");
        }
    }
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        warn!("Engine ignored SIGTERM, killing");
        let _ = child.kill().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_event_kind() {
        let progress = parse_event_line(
            r#"{"type":"progress","files":3,"bytes":4096,"percent":12.5,"current_file":"a.txt"}"#,
        )
        .unwrap();
        assert_eq!(
            progress,
            EngineEvent::Progress(EngineProgress {
                files: 3,
                bytes: 4096,
                percent: Some(12.5),
                current_file: Some("a.txt".to_string()),
            })
        );

        let summary =
            parse_event_line(r#"{"type":"summary","files":10,"bytes":100,"changed_files":0}"#)
                .unwrap();
        assert!(matches!(
            summary,
            EngineEvent::Summary(EngineSummary { files: 10, changed_files: 0, .. })
        ));

        let error = parse_event_line(r#"{"type":"error","message":"repo locked"}"#).unwrap();
        assert!(matches!(error, EngineEvent::Error(EngineFailure { kind: None, .. })));
    }

    #[test]
    fn rejects_unknown_and_garbage_lines() {
        assert!(parse_event_line("not json").is_err());
        assert!(parse_event_line(r#"{"type":"mystery"}"#).is_err());
        assert!(parse_event_line(r#"{"files":1}"#).is_err());
    }

    #[tokio::test]
    async fn stream_skips_malformed_lines() {
        let output: &[u8] = b"{\"type\":\"progress\",\"files\":1,\"bytes\":10}\n\
garbage here\n\
\n\
\xff\xfe\n\
{\"type\":\"progress\",\"files\":2,\"bytes\":20}\n\
{\"type\":\"summary\",\"files\":2,\"bytes\":20}";

        let mut stream = EventStream::new(output);
        let mut events = Vec::new();
        while let Some(event) = stream.next_event().await {
            events.push(event);
        }

        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], EngineEvent::Progress(EngineProgress { files: 1, .. })));
        assert!(matches!(events[1], EngineEvent::Progress(EngineProgress { files: 2, .. })));
        assert!(matches!(events[2], EngineEvent::Summary(_)));
        assert_eq!(stream.skipped(), 2);
    }

    #[test]
    fn storage_exhaustion_detected_from_stderr() {
        let run = EngineRun {
            status: ExitStatus::default(),
            summary: None,
            reported_error: None,
            stderr_tail: vec!["write failed: No space left on device".to_string()],
        };
        assert!(matches!(run.failure("engine exited"), EngineError::StorageExhausted(_)));
    }
}
