// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Server settings and on-disk layout.
//!
//! All durable state lives under a single data directory (default
//! `~/.modeldock`):
//!
//! ```text
//! ~/.modeldock/
//!   config.json            optional settings override
//!   models/
//!     <id>.gguf            completed artifact
//!     <id>.gguf.part       in-progress transfer bytes
//!     .status/<id>.json    transfer status record (+ <id>.json.lock)
//!     .locks/<id>.lock     per-artifact transfer ownership lock
//! ```
//!
//! File names are derived from the module id alone, so downloaded-state
//! checks are exact path lookups rather than directory scans.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default HTTP API port.
pub const DEFAULT_PORT: u16 = 8790;

/// Default port the inference engine sidecar listens on.
pub const DEFAULT_ENGINE_PORT: u16 = 8793;

/// Runtime settings for the serving process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Port the API server listens on.
    pub port: u16,
    /// Address to bind to (127.0.0.1 by default for local-only access).
    pub bind_address: String,
    /// Root directory for models, status records and locks.
    pub data_dir: PathBuf,
    /// Port handed to the inference engine sidecar.
    pub engine_port: u16,
    /// Optional catalog file replacing the built-in module list.
    pub catalog_file: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_address: "127.0.0.1".to_string(),
            data_dir: default_data_dir(),
            engine_port: DEFAULT_ENGINE_PORT,
            catalog_file: None,
        }
    }
}

impl Settings {
    /// Load settings from `<data dir>/config.json`, falling back to defaults.
    ///
    /// A missing file is not an error; a malformed file is.
    pub fn load() -> Result<Self> {
        let path = default_data_dir().join("config.json");
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let settings: Settings = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(settings)
    }

    /// The storage layout rooted at this settings' data directory.
    pub fn storage(&self) -> StoragePaths {
        StoragePaths::new(&self.data_dir)
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".modeldock"))
        .unwrap_or_else(|| PathBuf::from(".modeldock"))
}

/// Deterministic mapping from module ids to the files that belong to them.
#[derive(Debug, Clone)]
pub struct StoragePaths {
    /// Flat directory holding completed and in-progress artifact files.
    pub models_dir: PathBuf,
    /// Directory of per-module transfer status records.
    pub status_dir: PathBuf,
    /// Directory of per-module transfer ownership lock files.
    pub locks_dir: PathBuf,
}

impl StoragePaths {
    /// Build the layout under `data_dir` without touching the filesystem.
    pub fn new(data_dir: &Path) -> Self {
        let models_dir = data_dir.join("models");
        Self {
            status_dir: models_dir.join(".status"),
            locks_dir: models_dir.join(".locks"),
            models_dir,
        }
    }

    /// Create all directories in the layout.
    pub fn ensure(&self) -> Result<()> {
        for dir in [&self.models_dir, &self.status_dir, &self.locks_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory: {:?}", dir))?;
        }
        Ok(())
    }

    /// Final artifact path for a module. Existence of this exact file is the
    /// sole source of truth for "downloaded".
    pub fn module_file(&self, module_id: &str) -> PathBuf {
        self.models_dir.join(format!("{}.gguf", module_id))
    }

    /// In-progress transfer bytes for a module.
    pub fn partial_file(&self, module_id: &str) -> PathBuf {
        self.models_dir.join(format!("{}.gguf.part", module_id))
    }

    /// Transfer status record for a module.
    pub fn status_file(&self, module_id: &str) -> PathBuf {
        self.status_dir.join(format!("{}.json", module_id))
    }

    /// Transfer ownership lock file for a module.
    pub fn lock_file(&self, module_id: &str) -> PathBuf {
        self.locks_dir.join(format!("{}.lock", module_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.port, DEFAULT_PORT);
        assert_eq!(settings.bind_address, "127.0.0.1");
        assert!(settings.catalog_file.is_none());
    }

    #[test]
    fn test_paths_are_exact_per_id() {
        let paths = StoragePaths::new(Path::new("/data"));
        assert_eq!(
            paths.module_file("llama-3.2-3b"),
            PathBuf::from("/data/models/llama-3.2-3b.gguf")
        );
        assert_eq!(
            paths.partial_file("llama-3.2-3b"),
            PathBuf::from("/data/models/llama-3.2-3b.gguf.part")
        );
        assert_eq!(
            paths.status_file("llama-3.2-3b"),
            PathBuf::from("/data/models/.status/llama-3.2-3b.json")
        );
        assert_eq!(
            paths.lock_file("llama-3.2-3b"),
            PathBuf::from("/data/models/.locks/llama-3.2-3b.lock")
        );
    }

    #[test]
    fn test_prefix_ids_do_not_collide() {
        // "qwen-7b" must never be mistaken for "qwen-7b-instruct".
        let paths = StoragePaths::new(Path::new("/data"));
        assert_ne!(
            paths.module_file("qwen-7b"),
            paths.module_file("qwen-7b-instruct")
        );
    }

    #[test]
    fn test_ensure_creates_layout() {
        let tmp = tempfile::TempDir::new().expect("temp dir");
        let paths = StoragePaths::new(tmp.path());
        paths.ensure().expect("create layout");
        assert!(paths.models_dir.is_dir());
        assert!(paths.status_dir.is_dir());
        assert!(paths.locks_dir.is_dir());
    }
}
