//! End-to-end tests of the transfer worker as a real OS process.
//!
//! These spawn the actual modeldock binary's hidden `worker` subcommand
//! (via CARGO_BIN_EXE) against unreachable endpoints, exercising process
//! isolation, the retry loop, the transfer lock and the status record
//! exactly as production does. No network access is required; connections
//! to the reserved port are refused immediately.

#![cfg(unix)]

use std::fs::OpenOptions;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use tempfile::TempDir;

use modeldock::catalog::{ModuleCatalog, ModuleSpec};
use modeldock::config::StoragePaths;
use modeldock::orchestrator::DownloadOrchestrator;
use modeldock::status::{StatusStore, TransferPhase};

const WORKER_BIN: &str = env!("CARGO_BIN_EXE_modeldock");

/// A module whose download URL refuses connections instantly.
fn unreachable_spec(id: &str) -> ModuleSpec {
    let mut spec = ModuleCatalog::builtin()
        .get("tinyllama-1.1b")
        .expect("builtin module")
        .clone();
    spec.id = id.to_string();
    spec.size_bytes = 1_000_000;
    spec.download_url = Some("http://127.0.0.1:9/artifact.gguf".to_string());
    spec
}

fn spawn_worker(spec: &ModuleSpec, dir: &Path) -> std::process::Child {
    let spec_json = serde_json::to_string(spec).expect("serialize spec");
    Command::new(WORKER_BIN)
        .arg("worker")
        .arg("--spec-json")
        .arg(&spec_json)
        .arg("--model-file")
        .arg(dir.join(format!("{}.gguf", spec.id)))
        .arg("--status-file")
        .arg(dir.join("status.json"))
        .arg("--lock-file")
        .arg(dir.join("transfer.lock"))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn worker process")
}

fn wait_terminal(store: &StatusStore, timeout: Duration) -> TransferPhase {
    let deadline = Instant::now() + timeout;
    loop {
        let status = store.read();
        if status.phase.is_terminal() {
            return status.phase;
        }
        assert!(
            Instant::now() < deadline,
            "record never reached a terminal phase (last: {:?})",
            status.phase
        );
        thread::sleep(Duration::from_millis(100));
    }
}

#[test]
fn worker_process_exhausts_retries_and_records_failure() {
    let tmp = TempDir::new().expect("temp dir");
    let spec = unreachable_spec("demo-unreachable");

    let mut child = spawn_worker(&spec, tmp.path());
    let exit = child.wait().expect("wait for worker");
    assert!(!exit.success());

    let status = StatusStore::new(tmp.path().join("status.json")).read();
    assert_eq!(status.phase, TransferPhase::Failed);
    // Cap of 3 attempts leaves the retry counter at 2.
    assert_eq!(status.retries, 2);
    assert!(status.error.is_some());
    assert_eq!(status.total_bytes, 1_000_000);
    assert!(!tmp.path().join("demo-unreachable.gguf").exists());
}

#[test]
fn worker_process_fails_fast_when_lock_held() {
    let tmp = TempDir::new().expect("temp dir");
    let spec = unreachable_spec("demo-locked");

    let lock_file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(tmp.path().join("transfer.lock"))
        .expect("open lock");
    lock_file.try_lock_exclusive().expect("hold lock");

    let start = Instant::now();
    let mut child = spawn_worker(&spec, tmp.path());
    let exit = child.wait().expect("wait for worker");
    assert!(!exit.success());
    // Fail-fast: the 1s lock bound, not the multi-second retry schedule.
    assert!(start.elapsed() < Duration::from_secs(5));

    let status = StatusStore::new(tmp.path().join("status.json")).read();
    assert_eq!(status.phase, TransferPhase::Failed);
    assert_eq!(status.error.as_deref(), Some("transfer already in progress"));
    assert_eq!(status.retries, 0);
}

#[test]
fn orchestrator_refuses_duplicate_start_and_reports_failure() {
    let tmp = TempDir::new().expect("temp dir");
    let paths = StoragePaths::new(tmp.path());
    paths.ensure().expect("layout");
    let orchestrator = DownloadOrchestrator::new(paths.clone())
        .expect("orchestrator")
        .with_worker_program(WORKER_BIN);

    let spec = unreachable_spec("demo-duplicate");
    assert!(orchestrator.start(&spec).expect("first start"));

    // The worker spends seconds in its retry schedule; a second start in
    // that window must be refused by the handle table or the lock.
    thread::sleep(Duration::from_millis(300));
    assert!(!orchestrator.start(&spec).expect("second start"));

    let store = StatusStore::new(paths.status_file(&spec.id));
    assert_eq!(
        wait_terminal(&store, Duration::from_secs(30)),
        TransferPhase::Failed
    );
    let report = orchestrator.status(&spec.id);
    assert_eq!(report.status.retries, 2);

    // The worker lingers briefly after the terminal write (sampler
    // shutdown); once it exits the handle is reapable and a fresh start is
    // accepted again.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        orchestrator.reap_finished();
        if orchestrator.tracked_workers() == 0 {
            break;
        }
        assert!(Instant::now() < deadline, "worker process never exited");
        thread::sleep(Duration::from_millis(100));
    }
    assert!(orchestrator.start(&spec).expect("restart"));
    wait_terminal(&store, Duration::from_secs(30));
}

#[test]
fn orchestrator_cancel_terminates_worker_within_bound() {
    let tmp = TempDir::new().expect("temp dir");
    let paths = StoragePaths::new(tmp.path());
    paths.ensure().expect("layout");
    let orchestrator = DownloadOrchestrator::new(paths.clone())
        .expect("orchestrator")
        .with_worker_program(WORKER_BIN);

    let spec = unreachable_spec("demo-cancel");
    assert!(orchestrator.start(&spec).expect("start"));

    // Let the worker reach its first backoff sleep, then cancel.
    thread::sleep(Duration::from_millis(500));
    let start = Instant::now();
    assert!(orchestrator.cancel(&spec.id));
    assert!(start.elapsed() < Duration::from_secs(6));

    let report = orchestrator.status(&spec.id);
    assert_eq!(report.status.phase, TransferPhase::Cancelled);
    assert!(!report.worker_alive);

    // Cancelling again reports nothing in flight.
    assert!(!orchestrator.cancel(&spec.id));
}
