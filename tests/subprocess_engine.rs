use std::path::{Path, PathBuf};
use std::time::Duration;

use bkfleet::config::EngineConfig;
use bkfleet::core::cascade::PatternRules;
use bkfleet::core::engine::{
    BackupEngine, EngineError, PruneRequest, SnapshotRequest, SubprocessEngine,
};
use bkfleet::core::models::RetentionPolicy;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Engine that runs `script` through `/bin/sh`, so the script sees the
/// subcommand as `$1` and the remaining engine arguments after it.
fn engine(dir: &TempDir, script: &str) -> SubprocessEngine {
    let path = dir.path().join("engine.sh");
    std::fs::write(&path, script).unwrap();
    SubprocessEngine::new(EngineConfig {
        binary: PathBuf::from("/bin/sh"),
        extra_args: vec![path.to_string_lossy().into_owned()],
        repository: dir.path().join("repo").to_string_lossy().into_owned(),
        stop_grace_secs: 2,
    })
}

fn snapshot(source: &Path) -> SnapshotRequest {
    SnapshotRequest {
        job_id: "job-1".to_string(),
        archive_name: "nas.docs.2026-01-01T00:00:00Z".to_string(),
        source: source.to_path_buf(),
        rules: PatternRules {
            include: vec!["*.pdf".to_string()],
            exclude: vec!["tmp/".to_string()],
        },
    }
}

fn retention() -> RetentionPolicy {
    RetentionPolicy {
        keep_latest: 3,
        keep_daily: 7,
        keep_weekly: 4,
        keep_monthly: 6,
        keep_yearly: 1,
    }
}

#[tokio::test]
async fn test_create_streams_progress_and_summary() {
    let dir = tempfile::tempdir().unwrap();
    let args = dir.path().join("args");
    let script = format!(
        r#"echo "$@" > {args}
echo '{{"type":"progress","files":1,"bytes":100,"current_file":"a.pdf"}}'
echo 'not json at all'
echo '{{"type":"progress","files":2,"bytes":200,"percent":50.0}}'
echo '{{"type":"summary","files":2,"bytes":200,"changed_files":1,"snapshot":"snap-1"}}'
"#,
        args = args.display()
    );
    let engine = engine(&dir, &script);
    let (tx, mut rx) = mpsc::channel(16);

    let summary = timeout(
        Duration::from_secs(10),
        engine.create(&snapshot(Path::new("/mnt/docs")), tx, CancellationToken::new()),
    )
    .await
    .expect("timeout waiting for engine")
    .unwrap();

    assert_eq!(summary.files, 2);
    assert_eq!(summary.bytes, 200);
    assert_eq!(summary.changed_files, 1);
    assert_eq!(summary.snapshot.as_deref(), Some("snap-1"));

    let first = rx.recv().await.unwrap();
    assert_eq!(first.files, 1);
    assert_eq!(first.current_file.as_deref(), Some("a.pdf"));
    let second = rx.recv().await.unwrap();
    assert_eq!(second.files, 2);
    assert_eq!(second.percent, Some(50.0));
    assert!(rx.recv().await.is_none());

    let argv = std::fs::read_to_string(&args).unwrap();
    assert!(argv.starts_with("create --json-lines --repo "));
    assert!(argv.contains("--archive nas.docs.2026-01-01T00:00:00Z"));
    assert!(argv.contains("--include *.pdf --exclude tmp/"));
    assert!(argv.trim_end().ends_with("/mnt/docs"));
}

#[tokio::test]
async fn test_summary_with_nonzero_exit_still_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(
        &dir,
        r#"echo '{"type":"summary","files":5,"bytes":10}'
exit 1
"#,
    );
    let (tx, _rx) = mpsc::channel(16);

    let summary = engine
        .create(&snapshot(Path::new("/src")), tx, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.files, 5);
}

#[tokio::test]
async fn test_crash_reports_stderr_tail() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(
        &dir,
        r#"echo '{"type":"progress","files":1,"bytes":1}'
echo 'repository lock held by another process' >&2
exit 2
"#,
    );
    let (tx, _rx) = mpsc::channel(16);

    let err = engine
        .create(&snapshot(Path::new("/src")), tx, CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        EngineError::Failed(message) => {
            assert!(message.contains("repository lock held"), "{}", message);
        }
        other => panic!("expected Failed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_clean_exit_without_summary_is_a_failure() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir, "echo '{\"type\":\"progress\",\"files\":1,\"bytes\":1}'\n");
    let (tx, _rx) = mpsc::channel(16);

    let err = engine
        .create(&snapshot(Path::new("/src")), tx, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Failed(_)));
}

#[tokio::test]
async fn test_storage_exhaustion_is_classified() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(
        &dir,
        r#"echo '{"type":"progress","files":1,"bytes":1}'
echo 'write chunk: No space left on device' >&2
exit 1
"#,
    );
    let (tx, _rx) = mpsc::channel(16);

    let err = engine
        .create(&snapshot(Path::new("/src")), tx, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::StorageExhausted(_)), "{:?}", err);

    let reported = engine_reporting_kind(&dir).await;
    assert!(matches!(reported, EngineError::StorageExhausted(_)), "{:?}", reported);
}

async fn engine_reporting_kind(dir: &TempDir) -> EngineError {
    let engine = engine(
        dir,
        r#"echo '{"type":"error","message":"repository full","kind":"storage_exhausted"}'
exit 3
"#,
    );
    let (tx, _rx) = mpsc::channel(16);
    engine
        .create(&snapshot(Path::new("/src")), tx, CancellationToken::new())
        .await
        .unwrap_err()
}

#[tokio::test]
async fn test_cancel_terminates_engine() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(
        &dir,
        r#"trap 'exit 143' TERM
echo '{"type":"progress","files":1,"bytes":1}'
while true; do sleep 0.05; done
"#,
    );
    let (tx, mut rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();

    let req = snapshot(Path::new("/src"));
    let run = engine.create(&req, tx, cancel.clone());
    let handle = tokio::spawn(run);

    timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timeout waiting for progress")
        .expect("channel closed");
    cancel.cancel();

    let result = timeout(Duration::from_secs(10), handle)
        .await
        .expect("engine did not stop")
        .unwrap();
    assert_eq!(result.unwrap_err(), EngineError::Cancelled);
}

#[tokio::test]
async fn test_prune_passes_retention() {
    let dir = tempfile::tempdir().unwrap();
    let args = dir.path().join("args");
    let engine = engine(&dir, &format!("echo \"$@\" > {}\n", args.display()));

    engine
        .prune(
            &PruneRequest {
                job_id: "job-1".to_string(),
                archive_prefix: "nas.docs.".to_string(),
                retention: retention(),
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let argv = std::fs::read_to_string(&args).unwrap();
    assert!(argv.starts_with("prune --json-lines --repo "));
    assert!(argv.contains(
        "--prefix nas.docs. --keep-latest 3 --keep-daily 7 --keep-weekly 4 --keep-monthly 6 --keep-yearly 1"
    ));
}

#[tokio::test]
async fn test_prune_failure_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir, "echo 'prune: repository corrupted' >&2\nexit 4\n");

    let err = engine
        .prune(
            &PruneRequest {
                job_id: "job-1".to_string(),
                archive_prefix: "nas._device.".to_string(),
                retention: retention(),
            },
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    match err {
        EngineError::Failed(message) => assert!(message.contains("corrupted"), "{}", message),
        other => panic!("expected Failed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_binary_fails_to_spawn() {
    let engine = SubprocessEngine::new(EngineConfig {
        binary: PathBuf::from("/nonexistent/bkfleet-engine"),
        extra_args: Vec::new(),
        repository: "/tmp/repo".to_string(),
        stop_grace_secs: 1,
    });
    let (tx, _rx) = mpsc::channel(16);

    let err = engine
        .create(&snapshot(Path::new("/src")), tx, CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        EngineError::Failed(message) => assert!(message.contains("failed to spawn")),
        other => panic!("expected Failed, got {:?}", other),
    }
}
