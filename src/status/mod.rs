// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Durable transfer status records.
//!
//! One JSON record per module id, shared between the serving process and the
//! transfer worker process that owns the download. Updates merge partial
//! fields under an exclusive per-record file lock and land via a
//! write-temp-then-rename so a crash mid-write can never corrupt the record.
//! Readers take no lock; the rename guarantees they only ever observe a
//! fully written snapshot, possibly a stale one.
//!
//! Lock acquisition is bounded: if the record lock cannot be taken within
//! the timeout, the update is dropped and logged. A dropped update only
//! delays telemetry freshness, it never affects transfer correctness.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

/// Default timeout for acquiring the per-record lock.
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry interval when waiting for lock acquisition.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Phase of one module's transfer lifecycle.
///
/// `Completed`, `Failed` and `Cancelled` are terminal; `Cancelled` is only
/// ever written by the orchestrator after terminating the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferPhase {
    Idle,
    Downloading,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl TransferPhase {
    /// Returns true once the transfer can no longer make progress.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferPhase::Completed | TransferPhase::Failed | TransferPhase::Cancelled
        )
    }

    /// Returns true while a worker is (or should be) moving bytes.
    pub fn is_active(&self) -> bool {
        matches!(self, TransferPhase::Downloading | TransferPhase::Retrying)
    }
}

/// Snapshot of one module's transfer progress and outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferStatus {
    pub phase: TransferPhase,
    /// Percent complete, 0-100. Derived from byte counts; may be stale.
    pub progress: u8,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    /// Instantaneous throughput in bytes per second.
    pub speed_bps: f64,
    /// Estimated seconds remaining; 0 when throughput is unknown.
    pub eta_seconds: f64,
    pub error: Option<String>,
    pub retries: u32,
    pub last_update: DateTime<Utc>,
}

impl TransferStatus {
    /// The synthesized record returned when no transfer has ever run.
    pub fn idle() -> Self {
        Self {
            phase: TransferPhase::Idle,
            progress: 0,
            downloaded_bytes: 0,
            total_bytes: 0,
            speed_bps: 0.0,
            eta_seconds: 0.0,
            error: None,
            retries: 0,
            last_update: Utc::now(),
        }
    }
}

/// Partial update merged into a persisted [`TransferStatus`].
///
/// `None` fields are left untouched. `error` is doubly optional:
/// `Some(None)` clears a previously recorded error, `None` keeps it.
#[derive(Debug, Clone, Default)]
pub struct StatusPatch {
    pub phase: Option<TransferPhase>,
    pub progress: Option<u8>,
    pub downloaded_bytes: Option<u64>,
    pub total_bytes: Option<u64>,
    pub speed_bps: Option<f64>,
    pub eta_seconds: Option<f64>,
    pub error: Option<Option<String>>,
    pub retries: Option<u32>,
}

impl StatusPatch {
    fn apply(&self, status: &mut TransferStatus) {
        if let Some(phase) = self.phase {
            status.phase = phase;
        }
        if let Some(progress) = self.progress {
            status.progress = progress.min(100);
        }
        if let Some(bytes) = self.downloaded_bytes {
            status.downloaded_bytes = bytes;
        }
        if let Some(total) = self.total_bytes {
            status.total_bytes = total;
        }
        if let Some(speed) = self.speed_bps {
            status.speed_bps = speed;
        }
        if let Some(eta) = self.eta_seconds {
            status.eta_seconds = eta;
        }
        if let Some(error) = &self.error {
            status.error = error.clone();
        }
        if let Some(retries) = self.retries {
            status.retries = retries;
        }
        // Invariant: once the total is known, downloaded never exceeds it.
        if status.total_bytes > 0 && status.downloaded_bytes > status.total_bytes {
            status.downloaded_bytes = status.total_bytes;
        }
        status.last_update = Utc::now();
    }
}

/// Handle to one module's durable status record.
#[derive(Debug, Clone)]
pub struct StatusStore {
    path: PathBuf,
}

impl StatusStore {
    /// Create a handle for the record at `path`. Nothing is touched on disk
    /// until the first update.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Lock file guarding updates to this record.
    ///
    /// Separate from the record itself so the lock can be held across the
    /// atomic rename, and distinct from the transfer ownership lock.
    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    /// Read the last durably committed record.
    ///
    /// Missing or unparsable records read as idle; a reader never fails and
    /// never observes a half-written record (writes land via rename).
    pub fn read(&self) -> TransferStatus {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(_) => return TransferStatus::idle(),
        };
        match serde_json::from_str(&content) {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(path = ?self.path, "Unparsable status record, reading as idle: {}", e);
                TransferStatus::idle()
            }
        }
    }

    /// Merge `patch` into the persisted record, stamping `last_update`.
    ///
    /// Dropped (and logged) if the record lock cannot be acquired within the
    /// default timeout or the write fails; callers never block on telemetry.
    pub fn update(&self, patch: StatusPatch) {
        self.update_with_timeout(patch, LOCK_TIMEOUT)
    }

    /// Merge with a custom lock acquisition timeout.
    pub fn update_with_timeout(&self, patch: StatusPatch, timeout: Duration) {
        if let Err(e) = self.try_update(patch, timeout) {
            tracing::warn!(path = ?self.path, "Dropping status update: {:#}", e);
        }
    }

    fn try_update(&self, patch: StatusPatch, timeout: Duration) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create status directory: {:?}", parent))?;
        }

        // Exclusive lock on the lock file, held across read-merge-rename.
        let _lock_guard = acquire_exclusive_with_timeout(&self.lock_path(), timeout)?;

        let mut status = self.read();
        patch.apply(&mut status);

        let content = serde_json::to_string_pretty(&status)
            .with_context(|| "Failed to serialize status record")?;

        let temp_path = self.path.with_extension("tmp");
        {
            let mut temp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;
            temp_file
                .write_all(content.as_bytes())
                .with_context(|| "Failed to write to temp file")?;
            temp_file
                .sync_all()
                .with_context(|| "Failed to sync temp file to disk")?;
        }

        // Atomic rename (atomic on POSIX, best-effort on Windows).
        fs::rename(&temp_path, &self.path).with_context(|| {
            format!(
                "Failed to rename temp file into place: {:?} -> {:?}",
                temp_path, self.path
            )
        })?;

        Ok(())
    }

    /// Remove the record and its lock file. Missing files are not an error.
    pub fn clear(&self) -> Result<()> {
        for path in [&self.path, &self.lock_path()] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to remove status file: {:?}", path))
                }
            }
        }
        Ok(())
    }
}

/// Acquire an exclusive advisory lock, retrying until `timeout` expires.
///
/// Returns the locked file handle; the lock is released when it drops.
pub fn acquire_exclusive_with_timeout(path: &Path, timeout: Duration) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory for lock file: {:?}", parent))?;
    }

    let lock_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("Failed to open lock file: {:?}", path))?;

    let start = Instant::now();
    loop {
        match lock_file.try_lock_exclusive() {
            Ok(()) => return Ok(lock_file),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if start.elapsed() >= timeout {
                    bail!(
                        "Timed out waiting for exclusive lock on {:?} after {:?}. \
                         Another process may be updating this record.",
                        path,
                        timeout
                    );
                }
                thread::sleep(LOCK_RETRY_INTERVAL);
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to acquire exclusive lock on {:?}", path));
            }
        }
    }
}
