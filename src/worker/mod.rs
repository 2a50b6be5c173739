// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Transfer worker: one artifact's download, end to end.
//!
//! A worker runs inside its own OS process (the hidden `worker` subcommand)
//! so a stalled or crashed transfer cannot corrupt the orchestrator or
//! starve the serving process. Inside the process, the fetch runs on the
//! main thread and a progress sampler runs on a second thread; the two
//! coordinate only through the status record on disk.
//!
//! Every outcome, including the worker's own panic-free failure paths,
//! lands in the status record. Nothing escalates past the process boundary.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use fs2::FileExt;

use crate::catalog::ModuleSpec;
use crate::fetch::{partial_path, BlobFetcher};
use crate::status::{StatusPatch, StatusStore, TransferPhase};

/// How often the sampler inspects the on-disk transfer size. Two seconds
/// bounds write amplification on the status record without visibly
/// degrading poll responsiveness.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(2);

/// How long the worker waits to take transfer ownership before giving up.
const TRANSFER_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// Retry interval while waiting on the transfer lock.
const TRANSFER_LOCK_RETRY: Duration = Duration::from_millis(100);

/// Retry schedule for failed fetch attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts before the transfer is marked failed.
    pub max_attempts: u32,
    /// Base backoff; attempt `n` sleeps `base * 2^n`.
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base * 2u32.saturating_pow(attempt)
    }
}

/// Runs one transfer to a terminal state, reporting through the status
/// record only.
pub struct TransferWorker<F: BlobFetcher> {
    fetcher: F,
    policy: RetryPolicy,
    sample_interval: Duration,
}

impl<F: BlobFetcher> TransferWorker<F> {
    pub fn new(fetcher: F) -> Self {
        Self {
            fetcher,
            policy: RetryPolicy::default(),
            sample_interval: SAMPLE_INTERVAL,
        }
    }

    /// Override the retry schedule.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Override the sampler cadence.
    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    /// Run the transfer for `spec` into `dest`.
    ///
    /// Always leaves the record in a terminal phase and returns the final
    /// snapshot. Ownership is taken by acquiring the per-artifact transfer
    /// lock; if another worker holds it, the record is marked failed with
    /// "transfer already in progress" and nothing is retried.
    pub fn run(
        &self,
        spec: &ModuleSpec,
        dest: &Path,
        status_file: &Path,
        lock_file: &Path,
    ) -> crate::status::TransferStatus {
        let store = StatusStore::new(status_file);

        let _lock_guard = match acquire_transfer_lock(lock_file) {
            Ok(guard) => guard,
            Err(e) => {
                tracing::warn!(module_id = %spec.id, "Could not take transfer ownership: {:#}", e);
                store.update(StatusPatch {
                    phase: Some(TransferPhase::Failed),
                    error: Some(Some("transfer already in progress".to_string())),
                    ..Default::default()
                });
                return store.read();
            }
        };
        tracing::info!(module_id = %spec.id, "Transfer lock acquired");

        if let Err(e) = self.run_attempts(spec, dest, &store) {
            // Unrecoverable path outside the retry loop; the record must
            // still reach a terminal phase.
            tracing::error!(module_id = %spec.id, "Transfer aborted: {:#}", e);
            store.update(StatusPatch {
                phase: Some(TransferPhase::Failed),
                error: Some(Some(format!("{:#}", e))),
                ..Default::default()
            });
        }

        store.read()
    }

    fn run_attempts(&self, spec: &ModuleSpec, dest: &Path, store: &StatusStore) -> Result<()> {
        store.update(StatusPatch {
            phase: Some(TransferPhase::Downloading),
            progress: Some(0),
            downloaded_bytes: Some(0),
            total_bytes: Some(spec.size_bytes),
            speed_bps: Some(0.0),
            eta_seconds: Some(0.0),
            error: Some(None),
            retries: Some(0),
            ..Default::default()
        });

        let sampler = spawn_sampler(
            dest.to_path_buf(),
            store.clone(),
            spec.size_bytes,
            self.sample_interval,
        );

        let url = spec.download_url();
        let max_attempts = self.policy.max_attempts.max(1);
        let mut terminal: Option<StatusPatch> = None;
        for attempt in 0..max_attempts {
            tracing::info!(
                module_id = %spec.id,
                attempt = attempt + 1,
                max = max_attempts,
                "Starting fetch attempt"
            );
            if attempt > 0 {
                // Back from a backoff sleep; phase transitions are owned
                // here, never by the sampler.
                store.update(StatusPatch {
                    phase: Some(TransferPhase::Downloading),
                    error: Some(None),
                    ..Default::default()
                });
            }

            match self.fetcher.fetch(&url, dest, spec.sha256.as_deref()) {
                Ok(()) => {
                    let patch = StatusPatch {
                        phase: Some(TransferPhase::Completed),
                        progress: Some(100),
                        downloaded_bytes: Some(spec.size_bytes),
                        total_bytes: Some(spec.size_bytes),
                        speed_bps: Some(0.0),
                        eta_seconds: Some(0.0),
                        error: Some(None),
                        retries: Some(attempt),
                    };
                    store.update(patch.clone());
                    terminal = Some(patch);
                    tracing::info!(module_id = %spec.id, "Transfer completed");
                    break;
                }
                Err(e) if attempt + 1 < max_attempts => {
                    let wait = self.policy.backoff(attempt);
                    tracing::warn!(
                        module_id = %spec.id,
                        attempt = attempt + 1,
                        "Fetch attempt failed, retrying in {:?}: {:#}",
                        wait,
                        e
                    );
                    store.update(StatusPatch {
                        phase: Some(TransferPhase::Retrying),
                        error: Some(Some(format!(
                            "Retry {}/{}: {:#}",
                            attempt + 1,
                            max_attempts,
                            e
                        ))),
                        retries: Some(attempt + 1),
                        ..Default::default()
                    });
                    thread::sleep(wait);
                }
                Err(e) => {
                    tracing::error!(module_id = %spec.id, "All fetch attempts exhausted: {:#}", e);
                    let patch = StatusPatch {
                        phase: Some(TransferPhase::Failed),
                        error: Some(Some(format!("{:#}", e))),
                        retries: Some(max_attempts.saturating_sub(1)),
                        ..Default::default()
                    };
                    store.update(patch.clone());
                    terminal = Some(patch);
                    break;
                }
            }
        }

        // The record is terminal by now; the sampler observes that and
        // exits within one interval.
        if sampler.join().is_err() {
            tracing::warn!(module_id = %spec.id, "Progress sampler panicked");
        }

        // Re-assert the terminal record: a sample racing the terminal write
        // must not be the last word on the transfer's metrics.
        if let Some(patch) = terminal {
            store.update(patch);
        }
        Ok(())
    }
}

/// Take the per-artifact transfer ownership lock, held for the worker's
/// lifetime via the returned handle.
fn acquire_transfer_lock(path: &Path) -> Result<fs::File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;

    let start = Instant::now();
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => return Ok(file),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if start.elapsed() >= TRANSFER_LOCK_TIMEOUT {
                    anyhow::bail!("transfer lock held by another worker: {:?}", path);
                }
                thread::sleep(TRANSFER_LOCK_RETRY);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Progress metrics derived from two on-disk size observations.
///
/// Returns (percent, clamped bytes, bytes/sec, eta seconds).
fn sample_metrics(current: u64, last: u64, elapsed_secs: f64, total: u64) -> (u8, u64, f64, f64) {
    let clamped = if total > 0 { current.min(total) } else { current };
    let percent = if total > 0 {
        ((clamped as f64 / total as f64) * 100.0) as u8
    } else {
        0
    };
    let speed = if elapsed_secs > 0.0 {
        clamped.saturating_sub(last) as f64 / elapsed_secs
    } else {
        0.0
    };
    let eta = if speed > 0.0 {
        total.saturating_sub(clamped) as f64 / speed
    } else {
        0.0
    };
    (percent, clamped, speed, eta)
}

/// Size of the transfer on disk: the partial file while in flight, the
/// final file once the fetcher has renamed it into place.
fn current_transfer_size(dest: &Path) -> u64 {
    let part = partial_path(dest);
    fs::metadata(&part)
        .or_else(|_| fs::metadata(dest))
        .map(|m| m.len())
        .unwrap_or(0)
}

fn spawn_sampler(
    dest: PathBuf,
    store: StatusStore,
    total_bytes: u64,
    interval: Duration,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut last_size = 0u64;
        let mut last_instant = Instant::now();
        loop {
            if store.read().phase.is_terminal() {
                break;
            }

            let current = current_transfer_size(&dest);
            // Metrics only, and only when bytes moved. Phase transitions
            // belong to the retry loop; a static size during a backoff
            // sleep writes nothing at all.
            if current > 0 && current != last_size {
                let now = Instant::now();
                let elapsed = now.duration_since(last_instant).as_secs_f64();
                let (percent, clamped, speed, eta) =
                    sample_metrics(current, last_size, elapsed, total_bytes);
                store.update(StatusPatch {
                    progress: Some(percent),
                    downloaded_bytes: Some(clamped),
                    total_bytes: Some(total_bytes),
                    speed_bps: Some(speed),
                    eta_seconds: Some(eta),
                    ..Default::default()
                });
                last_size = current;
                last_instant = now;
            }

            thread::sleep(interval);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ModuleCatalog;
    use crate::status::TransferStatus;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Fetcher that fails a configured number of times, then writes the
    /// artifact through the real partial-file protocol.
    struct FlakyFetcher {
        failures: AtomicU32,
        payload: Vec<u8>,
    }

    impl FlakyFetcher {
        fn new(failures: u32, payload: &[u8]) -> Self {
            Self {
                failures: AtomicU32::new(failures),
                payload: payload.to_vec(),
            }
        }
    }

    impl BlobFetcher for FlakyFetcher {
        fn fetch(&self, _url: &str, dest: &Path, _sha: Option<&str>) -> Result<()> {
            if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| {
                f.checked_sub(1)
            }).is_ok()
            {
                anyhow::bail!("connection reset by peer");
            }
            let part = partial_path(dest);
            fs::write(&part, &self.payload)?;
            fs::rename(&part, dest)?;
            Ok(())
        }
    }

    fn demo_spec() -> ModuleSpec {
        let mut spec = ModuleCatalog::builtin().get("tinyllama-1.1b").unwrap().clone();
        spec.id = "demo-1b".to_string();
        spec.size_bytes = 1_000_000;
        spec
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff_base: Duration::from_millis(5),
        }
    }

    fn run_worker(fetcher: FlakyFetcher, tmp: &TempDir, spec: &ModuleSpec) -> TransferStatus {
        let dest = tmp.path().join(format!("{}.gguf", spec.id));
        let status_file = tmp.path().join("status.json");
        let lock_file = tmp.path().join("transfer.lock");
        TransferWorker::new(fetcher)
            .with_policy(fast_policy())
            .with_sample_interval(Duration::from_millis(20))
            .run(spec, &dest, &status_file, &lock_file)
    }

    #[test]
    fn test_successful_transfer_completes() {
        let tmp = TempDir::new().expect("temp dir");
        let spec = demo_spec();
        let status = run_worker(FlakyFetcher::new(0, b"weights"), &tmp, &spec);

        assert_eq!(status.phase, TransferPhase::Completed);
        assert_eq!(status.progress, 100);
        assert_eq!(status.downloaded_bytes, 1_000_000);
        assert_eq!(status.total_bytes, 1_000_000);
        assert_eq!(status.retries, 0);
        assert!(status.error.is_none());
        assert!(tmp.path().join("demo-1b.gguf").exists());
    }

    #[test]
    fn test_two_failures_then_success_records_two_retries() {
        let tmp = TempDir::new().expect("temp dir");
        let spec = demo_spec();
        let status = run_worker(FlakyFetcher::new(2, b"weights"), &tmp, &spec);

        assert_eq!(status.phase, TransferPhase::Completed);
        assert_eq!(status.retries, 2);
        assert!(status.error.is_none());
    }

    #[test]
    fn test_exhausted_attempts_record_failure() {
        let tmp = TempDir::new().expect("temp dir");
        let spec = demo_spec();
        let status = run_worker(FlakyFetcher::new(u32::MAX, b""), &tmp, &spec);

        assert_eq!(status.phase, TransferPhase::Failed);
        // Cap of 3 attempts leaves the retry counter at 2.
        assert_eq!(status.retries, 2);
        assert!(status
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("connection reset by peer"));
        assert!(!tmp.path().join("demo-1b.gguf").exists());
    }

    #[test]
    fn test_lock_held_fails_fast_without_retrying() {
        let tmp = TempDir::new().expect("temp dir");
        let spec = demo_spec();
        let lock_file = tmp.path().join("transfer.lock");

        // Simulate a concurrent worker owning the transfer.
        let held = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_file)
            .expect("open lock");
        held.try_lock_exclusive().expect("hold lock");

        let dest = tmp.path().join("demo-1b.gguf");
        let status_file = tmp.path().join("status.json");
        let status = TransferWorker::new(FlakyFetcher::new(0, b"weights"))
            .with_policy(fast_policy())
            .with_sample_interval(Duration::from_millis(20))
            .run(&spec, &dest, &status_file, &lock_file);

        assert_eq!(status.phase, TransferPhase::Failed);
        assert_eq!(status.error.as_deref(), Some("transfer already in progress"));
        assert_eq!(status.retries, 0);
        assert!(!dest.exists());
    }

    #[test]
    fn test_sample_metrics_math() {
        let (percent, clamped, speed, eta) = sample_metrics(500_000, 300_000, 2.0, 1_000_000);
        assert_eq!(percent, 50);
        assert_eq!(clamped, 500_000);
        assert!((speed - 100_000.0).abs() < f64::EPSILON);
        assert!((eta - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_sample_metrics_clamps_to_total() {
        let (percent, clamped, _, eta) = sample_metrics(2_000_000, 0, 2.0, 1_000_000);
        assert_eq!(percent, 100);
        assert_eq!(clamped, 1_000_000);
        assert!((eta - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_sample_metrics_zero_speed_zero_eta() {
        let (_, _, speed, eta) = sample_metrics(100, 100, 2.0, 1_000);
        assert!((speed - 0.0).abs() < f64::EPSILON);
        assert!((eta - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_current_transfer_size_prefers_partial() {
        let tmp = TempDir::new().expect("temp dir");
        let dest = tmp.path().join("demo-1b.gguf");
        assert_eq!(current_transfer_size(&dest), 0);

        fs::write(partial_path(&dest), b"12345").expect("write part");
        assert_eq!(current_transfer_size(&dest), 5);

        fs::write(&dest, b"1234567890").expect("write final");
        // Partial still wins while it exists.
        assert_eq!(current_transfer_size(&dest), 5);

        fs::remove_file(partial_path(&dest)).expect("remove part");
        assert_eq!(current_transfer_size(&dest), 10);
    }

    #[test]
    fn test_backoff_grows_exponentially() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
        };
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
    }

    /// Sampler observations must never push the byte count past the
    /// declared total, even when the on-disk file is larger.
    #[test]
    fn test_oversized_partial_clamped_in_record() {
        let tmp = TempDir::new().expect("temp dir");
        let mut spec = demo_spec();
        spec.size_bytes = 4;

        let status = run_worker(FlakyFetcher::new(0, b"12345678"), &tmp, &spec);
        assert_eq!(status.phase, TransferPhase::Completed);
        assert!(status.downloaded_bytes <= status.total_bytes);
    }

    /// An arc-shared store observed mid-run sees only well-formed records.
    #[test]
    fn test_reader_during_transfer_sees_consistent_snapshots() {
        let tmp = TempDir::new().expect("temp dir");
        let spec = demo_spec();
        let status_file = tmp.path().join("status.json");
        let reader_store = StatusStore::new(&status_file);
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let reader = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    let status = reader_store.read();
                    if status.total_bytes > 0 {
                        assert!(status.downloaded_bytes <= status.total_bytes);
                    }
                    thread::sleep(Duration::from_millis(1));
                }
            })
        };

        let dest = tmp.path().join("demo-1b.gguf");
        let lock_file = tmp.path().join("transfer.lock");
        TransferWorker::new(FlakyFetcher::new(1, b"weights"))
            .with_policy(fast_policy())
            .with_sample_interval(Duration::from_millis(5))
            .run(&spec, &dest, &status_file, &lock_file);

        stop.store(true, Ordering::SeqCst);
        reader.join().expect("reader panicked");
    }
}
