// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Supervision of transfer worker processes.
//!
//! The orchestrator spawns one isolated OS process per in-flight artifact
//! (the binary's hidden `worker` subcommand) and tracks the child handles
//! in memory. At most one worker may be alive per module id, enforced
//! twice: the handle table catches duplicates within this process, and the
//! per-artifact transfer lock, acquired and held by the worker itself for
//! its whole lifetime, catches duplicates across processes, including a
//! worker orphaned by a crashed orchestrator. The probe in [`start`] is a
//! fast-fail courtesy against such orphans; the worker-held lock is what
//! guarantees a single writer.
//!
//! [`start`]: DownloadOrchestrator::start

use std::collections::HashMap;
use std::env;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::RwLock;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::Serialize;

use crate::catalog::{ModuleCatalog, ModuleSpec};
use crate::config::StoragePaths;
use crate::locks::{resilient_read, resilient_write};
use crate::status::{StatusPatch, StatusStore, TransferPhase, TransferStatus};

/// Bounded wait between graceful and forceful worker termination.
const CANCEL_WAIT: Duration = Duration::from_secs(5);

/// Poll interval while waiting for a terminating worker to exit.
const CANCEL_POLL: Duration = Duration::from_millis(100);

/// A tracked transfer worker process.
#[derive(Debug)]
struct WorkerHandle {
    child: Child,
    pid: u32,
}

impl WorkerHandle {
    fn new(child: Child) -> Self {
        let pid = child.id();
        Self { child, pid }
    }

    /// Whether the worker process is still running. Reaps the child when it
    /// has exited.
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Cooperative-then-forceful termination: graceful signal, bounded
    /// wait, then kill.
    fn terminate(&mut self, wait: Duration) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM);
        }
        #[cfg(not(unix))]
        {
            let _ = self.child.kill();
        }

        let deadline = Instant::now() + wait;
        while Instant::now() < deadline {
            if matches!(self.child.try_wait(), Ok(Some(_)) | Err(_)) {
                return;
            }
            thread::sleep(CANCEL_POLL);
        }

        tracing::warn!(pid = self.pid, "Worker ignored graceful stop, killing");
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Transfer status augmented with worker process liveness.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadReport {
    #[serde(flatten)]
    pub status: TransferStatus,
    pub worker_alive: bool,
    pub worker_pid: Option<u32>,
}

/// A locally available artifact.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadedModule {
    pub id: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Supervises one transfer worker per in-flight module id.
pub struct DownloadOrchestrator {
    paths: StoragePaths,
    workers: RwLock<HashMap<String, WorkerHandle>>,
    worker_program: PathBuf,
}

impl DownloadOrchestrator {
    /// Create an orchestrator over `paths`, spawning workers from the
    /// current executable.
    pub fn new(paths: StoragePaths) -> Result<Self> {
        let worker_program =
            env::current_exe().context("Failed to resolve current executable for worker spawn")?;
        Ok(Self {
            paths,
            workers: RwLock::new(HashMap::new()),
            worker_program,
        })
    }

    /// Spawn workers from a different binary (packaging and tests).
    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = program.into();
        self
    }

    /// Start a background transfer for `spec`.
    ///
    /// Returns false without side effects when a worker for this id is
    /// already alive or the transfer lock is held elsewhere. Otherwise
    /// clears any stale status record, spawns the worker process and tracks
    /// its handle.
    pub fn start(&self, spec: &ModuleSpec) -> Result<bool> {
        {
            let mut workers = resilient_write(&self.workers);
            if let Some(handle) = workers.get_mut(&spec.id) {
                if handle.is_alive() {
                    tracing::warn!(module_id = %spec.id, "Transfer already in flight");
                    return Ok(false);
                }
                workers.remove(&spec.id);
            }
        }

        if !probe_transfer_lock(&self.paths.lock_file(&spec.id))? {
            tracing::warn!(module_id = %spec.id, "Transfer lock held by another owner");
            return Ok(false);
        }

        // Fresh transfer, fresh record.
        self.status_store(&spec.id).clear()?;

        let spec_json =
            serde_json::to_string(spec).context("Failed to serialize module spec for worker")?;
        let child = Command::new(&self.worker_program)
            .arg("worker")
            .arg("--spec-json")
            .arg(&spec_json)
            .arg("--model-file")
            .arg(self.paths.module_file(&spec.id))
            .arg("--status-file")
            .arg(self.paths.status_file(&spec.id))
            .arg("--lock-file")
            .arg(self.paths.lock_file(&spec.id))
            .stdin(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to spawn transfer worker for {}", spec.id))?;

        let handle = WorkerHandle::new(child);
        tracing::info!(module_id = %spec.id, pid = handle.pid, "Spawned transfer worker");
        resilient_write(&self.workers).insert(spec.id.clone(), handle);
        Ok(true)
    }

    /// The durable status for `module_id`, augmented with worker liveness.
    pub fn status(&self, module_id: &str) -> DownloadReport {
        let status = self.status_store(module_id).read();
        let mut workers = resilient_write(&self.workers);
        let (worker_alive, worker_pid) = match workers.get_mut(module_id) {
            Some(handle) => {
                if handle.is_alive() {
                    (true, Some(handle.pid))
                } else {
                    (false, None)
                }
            }
            None => (false, None),
        };
        DownloadReport {
            status,
            worker_alive,
            worker_pid,
        }
    }

    /// Cancel an in-flight transfer. Returns false when nothing was alive.
    ///
    /// Termination is cooperative first, forceful after a bounded wait.
    /// Partial bytes are deliberately left behind as a resume point.
    pub fn cancel(&self, module_id: &str) -> bool {
        let mut handle = {
            let mut workers = resilient_write(&self.workers);
            match workers.remove(module_id) {
                Some(handle) => handle,
                None => return false,
            }
        };
        if !handle.is_alive() {
            return false;
        }

        tracing::info!(module_id, pid = handle.pid, "Cancelling transfer");
        handle.terminate(CANCEL_WAIT);

        self.status_store(module_id).update(StatusPatch {
            phase: Some(TransferPhase::Cancelled),
            error: Some(Some("download cancelled by user".to_string())),
            ..Default::default()
        });
        true
    }

    /// Drop handles of workers that have exited, bounding table growth.
    pub fn reap_finished(&self) {
        let mut workers = resilient_write(&self.workers);
        let before = workers.len();
        workers.retain(|module_id, handle| {
            let alive = handle.is_alive();
            if !alive {
                tracing::debug!(module_id = %module_id, "Reaped finished transfer worker");
            }
            alive
        });
        let reaped = before - workers.len();
        if reaped > 0 {
            tracing::info!(reaped, "Cleaned up finished transfer workers");
        }
    }

    /// Cancel any active transfer, then remove the artifact, partial bytes
    /// and status record. Returns false when no local bytes existed.
    pub fn delete(&self, module_id: &str) -> Result<bool> {
        self.cancel(module_id);

        let mut removed = false;
        for path in [
            self.paths.module_file(module_id),
            self.paths.partial_file(module_id),
        ] {
            match fs::remove_file(&path) {
                Ok(()) => {
                    tracing::info!(module_id, ?path, "Deleted artifact file");
                    removed = true;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to delete {:?}", path));
                }
            }
        }

        if removed {
            self.status_store(module_id).clear()?;
        }
        Ok(removed)
    }

    /// Whether the completed artifact exists locally. Always derived from
    /// the exact per-id path, never cached.
    pub fn is_downloaded(&self, module_id: &str) -> bool {
        self.paths.module_file(module_id).is_file()
    }

    /// Catalog entries with a local artifact, with path and on-disk size.
    pub fn downloaded_modules(&self, catalog: &ModuleCatalog) -> Vec<DownloadedModule> {
        catalog
            .all()
            .iter()
            .filter_map(|spec| {
                let path = self.paths.module_file(&spec.id);
                let meta = fs::metadata(&path).ok()?;
                Some(DownloadedModule {
                    id: spec.id.clone(),
                    path,
                    size_bytes: meta.len(),
                })
            })
            .collect()
    }

    /// Number of tracked workers (alive or awaiting reap).
    pub fn tracked_workers(&self) -> usize {
        resilient_read(&self.workers).len()
    }

    /// The storage layout this orchestrator operates on.
    pub fn paths(&self) -> &StoragePaths {
        &self.paths
    }

    fn status_store(&self, module_id: &str) -> StatusStore {
        StatusStore::new(self.paths.status_file(module_id))
    }
}

/// Non-blocking probe of the per-artifact transfer lock. True when the lock
/// is free; the probe releases it immediately, the spawned worker takes and
/// holds it for its own lifetime.
fn probe_transfer_lock(path: &Path) -> Result<bool> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create locks directory: {:?}", parent))?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("Failed to open transfer lock: {:?}", path))?;

    match file.try_lock_exclusive() {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(false),
        Err(e) => Err(e).with_context(|| format!("Failed to probe transfer lock: {:?}", path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ModuleCatalog;
    use tempfile::TempDir;

    fn orchestrator_in(tmp: &TempDir) -> DownloadOrchestrator {
        let paths = StoragePaths::new(tmp.path());
        paths.ensure().expect("create layout");
        DownloadOrchestrator::new(paths).expect("orchestrator")
    }

    fn spec() -> ModuleSpec {
        ModuleCatalog::builtin().get("tinyllama-1.1b").unwrap().clone()
    }

    /// A long-running stand-in child for handle-table tests.
    fn sleeper() -> Child {
        Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .spawn()
            .expect("spawn sleeper")
    }

    #[test]
    #[cfg(unix)]
    fn test_start_refused_while_tracked_worker_alive() {
        let tmp = TempDir::new().expect("temp dir");
        let orch = orchestrator_in(&tmp);
        let spec = spec();

        resilient_write(&orch.workers).insert(spec.id.clone(), WorkerHandle::new(sleeper()));

        assert!(!orch.start(&spec).expect("start"));

        // Clean up the sleeper.
        assert!(orch.cancel(&spec.id));
    }

    #[test]
    fn test_start_refused_while_lock_held() {
        let tmp = TempDir::new().expect("temp dir");
        let orch = orchestrator_in(&tmp);
        let spec = spec();

        let lock_path = orch.paths.lock_file(&spec.id);
        let held = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .expect("open lock");
        held.try_lock_exclusive().expect("hold lock");

        assert!(!orch.start(&spec).expect("start"));
        assert_eq!(orch.tracked_workers(), 0);
    }

    #[test]
    #[cfg(unix)]
    fn test_cancel_terminates_worker_and_records_cancelled() {
        let tmp = TempDir::new().expect("temp dir");
        let orch = orchestrator_in(&tmp);
        let spec = spec();

        resilient_write(&orch.workers).insert(spec.id.clone(), WorkerHandle::new(sleeper()));

        let start = Instant::now();
        assert!(orch.cancel(&spec.id));
        // SIGTERM kills a sleeping child immediately; well inside the bound.
        assert!(start.elapsed() < CANCEL_WAIT);

        let report = orch.status(&spec.id);
        assert_eq!(report.status.phase, TransferPhase::Cancelled);
        assert!(!report.worker_alive);
        assert_eq!(orch.tracked_workers(), 0);
    }

    #[test]
    fn test_cancel_without_worker_is_false() {
        let tmp = TempDir::new().expect("temp dir");
        let orch = orchestrator_in(&tmp);
        assert!(!orch.cancel("tinyllama-1.1b"));
    }

    #[test]
    #[cfg(unix)]
    fn test_reap_removes_exited_workers() {
        let tmp = TempDir::new().expect("temp dir");
        let orch = orchestrator_in(&tmp);

        let mut dead = WorkerHandle::new(
            Command::new("true")
                .stdin(Stdio::null())
                .spawn()
                .expect("spawn true"),
        );
        let _ = dead.child.wait();
        resilient_write(&orch.workers).insert("dead-module".to_string(), dead);
        resilient_write(&orch.workers).insert("live-module".to_string(), WorkerHandle::new(sleeper()));

        orch.reap_finished();
        assert_eq!(orch.tracked_workers(), 1);

        assert!(orch.cancel("live-module"));
    }

    #[test]
    fn test_status_synthesizes_idle() {
        let tmp = TempDir::new().expect("temp dir");
        let orch = orchestrator_in(&tmp);
        let report = orch.status("tinyllama-1.1b");
        assert_eq!(report.status.phase, TransferPhase::Idle);
        assert!(!report.worker_alive);
        assert!(report.worker_pid.is_none());
    }

    #[test]
    fn test_is_downloaded_uses_exact_path() {
        let tmp = TempDir::new().expect("temp dir");
        let orch = orchestrator_in(&tmp);

        assert!(!orch.is_downloaded("tinyllama-1.1b"));
        // A file for a different id that merely contains the queried id as a
        // substring must not count.
        fs::write(
            orch.paths.models_dir.join("tinyllama-1.1b-extended.gguf"),
            b"weights",
        )
        .expect("write decoy");
        assert!(!orch.is_downloaded("tinyllama-1.1b"));

        fs::write(orch.paths.module_file("tinyllama-1.1b"), b"weights").expect("write artifact");
        assert!(orch.is_downloaded("tinyllama-1.1b"));
    }

    #[test]
    fn test_delete_removes_artifact_partial_and_status() {
        let tmp = TempDir::new().expect("temp dir");
        let orch = orchestrator_in(&tmp);
        let id = "tinyllama-1.1b";

        fs::write(orch.paths.module_file(id), b"weights").expect("write artifact");
        fs::write(orch.paths.partial_file(id), b"partial").expect("write partial");
        orch.status_store(id).update(StatusPatch {
            phase: Some(TransferPhase::Completed),
            ..Default::default()
        });

        assert!(orch.delete(id).expect("delete"));
        assert!(!orch.paths.module_file(id).exists());
        assert!(!orch.paths.partial_file(id).exists());
        assert_eq!(orch.status(id).status.phase, TransferPhase::Idle);

        assert!(!orch.delete(id).expect("delete again"));
    }

    #[test]
    fn test_downloaded_modules_lists_only_existing() {
        let tmp = TempDir::new().expect("temp dir");
        let orch = orchestrator_in(&tmp);
        let catalog = ModuleCatalog::builtin();

        assert!(orch.downloaded_modules(&catalog).is_empty());

        fs::write(orch.paths.module_file("tinyllama-1.1b"), b"weights").expect("write artifact");
        let downloaded = orch.downloaded_modules(&catalog);
        assert_eq!(downloaded.len(), 1);
        assert_eq!(downloaded[0].id, "tinyllama-1.1b");
        assert_eq!(downloaded[0].size_bytes, 7);
    }

    #[test]
    fn test_probe_transfer_lock_free_and_held() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("probe.lock");

        assert!(probe_transfer_lock(&path).expect("probe free"));

        let held = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .expect("open lock");
        held.try_lock_exclusive().expect("hold lock");
        assert!(!probe_transfer_lock(&path).expect("probe held"));

        drop(held);
        assert!(probe_transfer_lock(&path).expect("probe released"));
    }
}
