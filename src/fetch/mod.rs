// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Resumable artifact fetching.
//!
//! The transfer worker moves bytes through a [`BlobFetcher`]. In-progress
//! bytes accumulate in `<dest>.part`; a successful fetch renames the partial
//! file onto the final path, so the final path only ever holds complete
//! artifacts. Re-attempts pick up from the partial length with an HTTP
//! `Range` request rather than restarting.

use std::fs::{self, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::header::RANGE;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};

/// Connect timeout for the artifact request. No overall timeout is set;
/// gigabyte transfers legitimately run for hours.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Capability that moves one artifact's bytes to local storage.
pub trait BlobFetcher: Send + Sync {
    /// Fetch `url` into `dest`, resuming from any bytes already present in
    /// the partial file. On success the complete artifact exists at `dest`
    /// and the partial file is gone.
    fn fetch(&self, url: &str, dest: &Path, expected_sha256: Option<&str>) -> Result<()>;
}

/// The partial-file path the fetcher accumulates bytes in for `dest`.
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

/// HTTP fetcher with byte-range resume.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

impl BlobFetcher for HttpFetcher {
    fn fetch(&self, url: &str, dest: &Path, expected_sha256: Option<&str>) -> Result<()> {
        let part = partial_path(dest);
        let existing = fs::metadata(&part).map(|m| m.len()).unwrap_or(0);

        let mut request = self.client.get(url);
        if existing > 0 {
            tracing::info!(?part, existing, "Resuming transfer from partial file");
            request = request.header(RANGE, format!("bytes={}-", existing));
        }

        let mut response = request
            .send()
            .with_context(|| format!("Request failed: {}", url))?;

        let status = response.status();
        let mut append = existing > 0;
        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            // Every byte is already on disk; finish below.
            tracing::info!(?part, "Server reports partial file already complete");
            return finish(&part, dest, expected_sha256);
        } else if existing > 0 && status == StatusCode::OK {
            // Server ignored the range request; start over.
            tracing::warn!(?part, "Server ignored range request, restarting transfer");
            append = false;
        } else if !status.is_success() {
            bail!("Transfer failed: HTTP {} from {}", status, url);
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(append)
            .write(true)
            .truncate(!append)
            .open(&part)
            .with_context(|| format!("Failed to open partial file: {:?}", part))?;

        std::io::copy(&mut response, &mut file)
            .with_context(|| format!("Transfer interrupted: {}", url))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync partial file: {:?}", part))?;
        drop(file);

        finish(&part, dest, expected_sha256)
    }
}

/// Verify (when a checksum is declared) and move the partial file into place.
fn finish(part: &Path, dest: &Path, expected_sha256: Option<&str>) -> Result<()> {
    if let Some(expected) = expected_sha256 {
        let actual = file_sha256(part)?;
        if !actual.eq_ignore_ascii_case(expected) {
            // A corrupt partial file would poison every future resume.
            let _ = fs::remove_file(part);
            bail!(
                "Checksum mismatch for {:?}: expected {}, got {}",
                dest,
                expected,
                actual
            );
        }
    }
    fs::rename(part, dest)
        .with_context(|| format!("Failed to move artifact into place: {:?} -> {:?}", part, dest))
}

/// Streaming SHA-256 of a file, hex encoded.
pub fn file_sha256(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("Failed to open for hashing: {:?}", path))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 65536];
    loop {
        let read = file
            .read(&mut buffer)
            .with_context(|| format!("Failed to read for hashing: {:?}", path))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}
