//! End-to-end runs of real `sh` workers through the pipe backend
//!
//! Each worker is `sh -c <script> sh <descriptor>`, so scripts see the
//! descriptor path as `$1`.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use jobwatch_core::application::{Supervisor, SupervisorConfig, WorkerCommand};
use jobwatch_core::domain::{JobId, JobState};
use jobwatch_core::port::time_provider::SystemTimeProvider;
use jobwatch_infra_system::{FsDescriptorStore, PipeBackend};
use tempfile::TempDir;

fn supervisor(script: &str, config: SupervisorConfig, backend: PipeBackend) -> Supervisor {
    let command = WorkerCommand::new("sh").args(["-c", script, "sh"]);
    Supervisor::new(
        config,
        command,
        Arc::new(backend),
        Arc::new(FsDescriptorStore::new()),
        Arc::new(SystemTimeProvider),
    )
    .unwrap()
}

fn shell_supervisor(script: &str) -> Supervisor {
    supervisor(script, SupervisorConfig::default(), PipeBackend::new())
}

fn write_descriptor(dir: &TempDir, name: &str, json: serde_json::Value) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, json.to_string()).unwrap();
    path
}

async fn wait_for_state(supervisor: &Supervisor, id: &JobId, want: JobState) {
    for _ in 0..1000 {
        if supervisor.get(id).await.map(|j| j.state) == Some(want) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "job {id} never reached {want}, is {:?}",
        supervisor.get(id).await.map(|j| j.state)
    );
}

async fn wait_for_log(supervisor: &Supervisor, id: &JobId, needle: &str) {
    for _ in 0..1000 {
        let log = supervisor.log(id).await.unwrap_or_default();
        if log.iter().any(|e| e.message.contains(needle)) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("log of {id} never contained {needle:?}");
}

async fn messages(supervisor: &Supervisor, id: &JobId) -> Vec<String> {
    supervisor
        .log(id)
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|e| e.message)
        .collect()
}

/// Wait until the worker script has appended `count` lines to `marker`
async fn wait_for_runs(marker: &Path, count: usize) {
    for _ in 0..1000 {
        let runs = std::fs::read_to_string(marker).unwrap_or_default();
        if runs.lines().count() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("worker never ran {count} times");
}

fn exists(path: &Path) -> bool {
    path.try_exists().unwrap()
}

#[tokio::test]
async fn test_success_with_delete_me_removes_descriptor() {
    let dir = TempDir::new().unwrap();
    let path = write_descriptor(&dir, "a.json", serde_json::json!({"deleteMe": true}));
    let supervisor = shell_supervisor(r#"echo "processing $1"; echo oops >&2"#);

    let job = supervisor.discover(&path).await.unwrap();
    wait_for_state(&supervisor, &job.id, JobState::Succeeded).await;
    wait_for_log(&supervisor, &job.id, "Deleted: a.json").await;

    let log = messages(&supervisor, &job.id).await;
    assert!(log.contains(&format!("processing {}", path.display())));
    assert!(log.contains(&"oops".to_string()), "stderr is merged into the log");
    assert!(log.contains(&"✓ Success: a.json".to_string()));
    assert!(log.contains(&"Deleted: a.json".to_string()));
    assert!(!exists(&path));

    let snapshot = supervisor.get(&job.id).await.unwrap();
    assert_eq!(snapshot.exit_code, Some(0));
}

#[tokio::test]
async fn test_failure_keeps_descriptor_even_with_delete_me() {
    let dir = TempDir::new().unwrap();
    let path = write_descriptor(&dir, "b.json", serde_json::json!({"deleteMe": true}));
    let supervisor = shell_supervisor("echo 'download failed'; exit 3");

    let job = supervisor.discover(&path).await.unwrap();
    wait_for_state(&supervisor, &job.id, JobState::Failed).await;

    let log = messages(&supervisor, &job.id).await;
    assert!(log.contains(&"✗ Failed: b.json (exit code: 3)".to_string()));
    assert!(exists(&path));
    assert_eq!(supervisor.get(&job.id).await.unwrap().exit_code, Some(3));
}

#[tokio::test]
async fn test_success_without_delete_me_keeps_descriptor() {
    let dir = TempDir::new().unwrap();
    let path = write_descriptor(&dir, "c.json", serde_json::json!({"url": "https://x"}));
    let supervisor = shell_supervisor("exit 0");

    let job = supervisor.discover(&path).await.unwrap();
    wait_for_state(&supervisor, &job.id, JobState::Succeeded).await;
    assert!(exists(&path));
}

#[tokio::test]
async fn test_progress_stream_is_rate_limited() {
    let dir = TempDir::new().unwrap();
    let path = write_descriptor(&dir, "p.json", serde_json::json!({}));
    let script = r#"
        printf 'Vid 1%%\rVid 2%%\rVid 4%%\rVid 10%%\n'
        echo 'Aud 3%'
        echo 'Aud 5%'
        echo 'Merging 50%'
        echo 'Merging 51%'
    "#;
    let supervisor = shell_supervisor(script);

    let job = supervisor.discover(&path).await.unwrap();
    wait_for_state(&supervisor, &job.id, JobState::Succeeded).await;

    let log = messages(&supervisor, &job.id).await;
    for kept in ["Vid 1%", "Vid 10%", "Aud 3%", "Merging 50%", "Merging 51%"] {
        assert!(log.contains(&kept.to_string()), "missing {kept}: {log:?}");
    }
    for dropped in ["Vid 2%", "Vid 4%", "Aud 5%"] {
        assert!(!log.contains(&dropped.to_string()), "kept {dropped}: {log:?}");
    }
}

#[tokio::test]
async fn test_prompt_without_newline_is_confirmed() {
    let dir = TempDir::new().unwrap();
    let path = write_descriptor(&dir, "q.json", serde_json::json!({}));
    let supervisor = supervisor(
        "printf 'Press Enter to run '; read answer; echo confirmed",
        SupervisorConfig::default(),
        PipeBackend::new().with_initial_confirmation(false),
    );

    let job = supervisor.discover(&path).await.unwrap();
    wait_for_state(&supervisor, &job.id, JobState::Succeeded).await;

    let log = messages(&supervisor, &job.id).await;
    assert!(log.contains(&"[Auto-confirming - sending Enter...]".to_string()));
    assert!(log.contains(&"confirmed".to_string()));
}

#[tokio::test]
async fn test_stop_then_retry_reruns_worker() {
    let dir = TempDir::new().unwrap();
    let path = write_descriptor(&dir, "s.json", serde_json::json!({"deleteMe": true}));
    let marker = dir.path().join("runs");
    let script = format!("echo run >> '{}'; exec sleep 30", marker.display());
    let supervisor = shell_supervisor(&script);

    let job = supervisor.discover(&path).await.unwrap();
    wait_for_state(&supervisor, &job.id, JobState::Running).await;
    wait_for_runs(&marker, 1).await;

    assert_eq!(supervisor.stop(&job.id).await.unwrap(), JobState::Stopped);
    assert_eq!(supervisor.active_count().await, 0);
    // the exit caused by our signal must not be recorded as a failure
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(supervisor.get(&job.id).await.unwrap().state, JobState::Stopped);
    assert!(exists(&path), "a stopped job keeps its descriptor");

    assert_eq!(supervisor.retry(&job.id).await.unwrap(), JobState::Running);
    wait_for_state(&supervisor, &job.id, JobState::Running).await;
    wait_for_runs(&marker, 2).await;

    let log = messages(&supervisor, &job.id).await;
    assert!(log.contains(&"⏹ STOPPING PROCESS...".to_string()));
    assert!(log.contains(&"🔄 RETRYING PROCESS...".to_string()));
    assert_eq!(supervisor.get(&job.id).await.unwrap().retries, 1);

    assert_eq!(supervisor.stop_all().await, 1);
    wait_for_state(&supervisor, &job.id, JobState::Stopped).await;
}

#[tokio::test]
async fn test_missing_executable_fails_job() {
    let dir = TempDir::new().unwrap();
    let path = write_descriptor(&dir, "m.json", serde_json::json!({}));
    let supervisor = Supervisor::new(
        SupervisorConfig::default(),
        WorkerCommand::new("/nonexistent/jobwatch-worker"),
        Arc::new(PipeBackend::new()),
        Arc::new(FsDescriptorStore::new()),
        Arc::new(SystemTimeProvider),
    )
    .unwrap();

    let job = supervisor.discover(&path).await.unwrap();
    wait_for_state(&supervisor, &job.id, JobState::Failed).await;

    let log = messages(&supervisor, &job.id).await;
    assert!(log.iter().any(|m| m.starts_with("✗ Error processing m.json")));
    assert_eq!(supervisor.active_count().await, 0);
    assert!(exists(&path));
}

#[tokio::test]
async fn test_capacity_limits_parallel_workers() {
    let dir = TempDir::new().unwrap();
    let config = SupervisorConfig {
        capacity: 2,
        ..SupervisorConfig::default()
    };
    let supervisor = supervisor("sleep 0.3", config, PipeBackend::new());

    let mut ids = Vec::new();
    for i in 0..4 {
        let path = write_descriptor(&dir, &format!("{i}.json"), serde_json::json!({}));
        ids.push(supervisor.discover(&path).await.unwrap().id);
    }
    assert_eq!(supervisor.active_count().await, 2);
    assert_eq!(supervisor.queued().await, ids[2..].to_vec());

    for id in &ids {
        wait_for_state(&supervisor, id, JobState::Succeeded).await;
    }
    assert_eq!(supervisor.active_count().await, 0);
}
