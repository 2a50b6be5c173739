// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Static catalog of downloadable model artifacts.
//!
//! The catalog is loaded once at startup and never mutated. Each entry
//! describes where the artifact lives remotely, how large it is, and the
//! resource hints handed to the inference engine when the model is loaded.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Broad capability class of a module, used for catalog filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleCategory {
    Coding,
    General,
    Creative,
    Multilingual,
}

/// Immutable descriptor for one downloadable artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleSpec {
    /// Unique stable id; also the stem of every file derived for the module.
    pub id: String,
    pub display_name: String,
    pub description: String,
    pub category: ModuleCategory,
    /// Human-readable size ("4.7 GB").
    pub size: String,
    /// Declared artifact size in bytes, used for progress math.
    pub size_bytes: u64,
    /// Parameter count label ("7B").
    pub parameters: String,
    /// Context window handed to the engine.
    pub context_length: u32,
    /// Thread count handed to the engine.
    pub n_threads: u32,
    /// HuggingFace repository the artifact is published in.
    pub hf_repo: String,
    /// File name inside the repository.
    pub hf_filename: String,
    pub recommended: bool,
    pub bundled: bool,
    /// Minimum RAM hint for the largest models ("32GB+").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_ram: Option<String>,
    /// Expected SHA-256 of the artifact; verified after transfer when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// Direct download URL override for mirrors; defaults to the
    /// HuggingFace resolve URL for `hf_repo`/`hf_filename`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

impl ModuleSpec {
    /// The URL the blob fetcher pulls this artifact from.
    pub fn download_url(&self) -> String {
        match &self.download_url {
            Some(url) => url.clone(),
            None => format!(
                "https://huggingface.co/{}/resolve/main/{}",
                self.hf_repo, self.hf_filename
            ),
        }
    }
}

/// The full set of modules this instance knows about.
#[derive(Debug, Clone)]
pub struct ModuleCatalog {
    modules: Vec<ModuleSpec>,
}

impl ModuleCatalog {
    /// Catalog shipped with the binary.
    pub fn builtin() -> Self {
        Self {
            modules: builtin_modules(),
        }
    }

    /// Load a replacement catalog from a JSON file (array of module specs).
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog file: {:?}", path))?;
        let modules: Vec<ModuleSpec> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse catalog file: {:?}", path))?;
        Ok(Self { modules })
    }

    /// Look up a module by id.
    pub fn get(&self, id: &str) -> Option<&ModuleSpec> {
        self.modules.iter().find(|m| m.id == id)
    }

    /// All modules in catalog order.
    pub fn all(&self) -> &[ModuleSpec] {
        &self.modules
    }

    /// Modules flagged as recommended defaults.
    pub fn recommended(&self) -> Vec<&ModuleSpec> {
        self.modules.iter().filter(|m| m.recommended).collect()
    }

    /// Modules expected to ship with the installer.
    pub fn bundled(&self) -> Vec<&ModuleSpec> {
        self.modules.iter().filter(|m| m.bundled).collect()
    }

    /// Modules in a given category, in catalog order.
    pub fn by_category(&self, category: ModuleCategory) -> Vec<&ModuleSpec> {
        self.modules
            .iter()
            .filter(|m| m.category == category)
            .collect()
    }
}

fn builtin_modules() -> Vec<ModuleSpec> {
    let spec = |id: &str,
                display_name: &str,
                description: &str,
                category: ModuleCategory,
                size: &str,
                size_bytes: u64,
                parameters: &str,
                context_length: u32,
                n_threads: u32,
                hf_repo: &str,
                hf_filename: &str,
                recommended: bool,
                bundled: bool,
                requires_ram: Option<&str>| ModuleSpec {
        id: id.to_string(),
        display_name: display_name.to_string(),
        description: description.to_string(),
        category,
        size: size.to_string(),
        size_bytes,
        parameters: parameters.to_string(),
        context_length,
        n_threads,
        hf_repo: hf_repo.to_string(),
        hf_filename: hf_filename.to_string(),
        recommended,
        bundled,
        requires_ram: requires_ram.map(str::to_string),
        sha256: None,
        download_url: None,
    };

    vec![
        spec(
            "qwen2.5-coder-1.5b",
            "Qwen2.5 Coder 1.5B",
            "Fast and lightweight coding assistant for quick tasks",
            ModuleCategory::Coding,
            "986 MB",
            986_000_000,
            "1.5B",
            4096,
            4,
            "Qwen/Qwen2.5-Coder-1.5B-Instruct-GGUF",
            "qwen2.5-coder-1.5b-instruct-q4_k_m.gguf",
            true,
            true,
            None,
        ),
        spec(
            "qwen2.5-coder-7b",
            "Qwen2.5 Coder 7B",
            "Advanced coding assistant with a good balance of speed and quality",
            ModuleCategory::Coding,
            "4.7 GB",
            4_700_000_000,
            "7B",
            8192,
            6,
            "Qwen/Qwen2.5-Coder-7B-Instruct-GGUF",
            "qwen2.5-coder-7b-instruct-q4_k_m.gguf",
            true,
            false,
            None,
        ),
        spec(
            "tinyllama-1.1b",
            "TinyLlama 1.1B",
            "Ultra-fast tiny model for quick responses on any device",
            ModuleCategory::General,
            "669 MB",
            669_000_000,
            "1.1B",
            2048,
            2,
            "TheBloke/TinyLlama-1.1B-Chat-v1.0-GGUF",
            "tinyllama-1.1b-chat-v1.0.Q4_K_M.gguf",
            false,
            false,
            None,
        ),
        spec(
            "llama-3.2-3b",
            "Llama 3.2 3B",
            "General purpose assistant, good for conversations",
            ModuleCategory::General,
            "2.0 GB",
            2_000_000_000,
            "3B",
            4096,
            4,
            "bartowski/Llama-3.2-3B-Instruct-GGUF",
            "Llama-3.2-3B-Instruct-Q4_K_M.gguf",
            true,
            false,
            None,
        ),
        spec(
            "llama-3.1-8b",
            "Llama 3.1 8B",
            "Meta's flagship model with strong reasoning",
            ModuleCategory::General,
            "4.9 GB",
            4_900_000_000,
            "8B",
            8192,
            6,
            "bartowski/Meta-Llama-3.1-8B-Instruct-GGUF",
            "Meta-Llama-3.1-8B-Instruct-Q4_K_M.gguf",
            true,
            false,
            None,
        ),
        spec(
            "mistral-7b",
            "Mistral 7B",
            "Creative writing and storytelling specialist",
            ModuleCategory::Creative,
            "4.4 GB",
            4_400_000_000,
            "7B",
            8192,
            6,
            "TheBloke/Mistral-7B-Instruct-v0.2-GGUF",
            "mistral-7b-instruct-v0.2.Q4_K_M.gguf",
            false,
            false,
            None,
        ),
        spec(
            "qwen2.5-14b",
            "Qwen2.5 14B",
            "Multilingual powerhouse for work across languages",
            ModuleCategory::Multilingual,
            "8.9 GB",
            8_900_000_000,
            "14B",
            32768,
            8,
            "Qwen/Qwen2.5-14B-Instruct-GGUF",
            "qwen2.5-14b-instruct-q4_k_m.gguf",
            false,
            false,
            Some("16GB+"),
        ),
    ]
}
