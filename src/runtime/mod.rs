// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Single-model runtime.
//!
//! Holds at most one loaded inference engine at a time. Every load releases
//! the previous engine before constructing the replacement, so peak memory
//! is bounded by one model's footprint, never two. A single runtime-wide
//! mutex serializes load and generate; a generate can never observe a
//! half-unloaded or half-loaded engine.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::catalog::ModuleSpec;
use crate::engine::{EngineLoader, TextEngine};
use crate::locks::resilient_lock;

/// Stop sequences handed to the engine on every generation.
pub const STOP_SEQUENCES: &[&str] = &["</s>", "User:", "Assistant:"];

/// One turn of a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

struct LoadedModel {
    module_id: String,
    engine: Box<dyn TextEngine>,
}

/// Owner of the single loaded model.
pub struct ModelRuntime {
    loader: Box<dyn EngineLoader>,
    current: Mutex<Option<LoadedModel>>,
}

impl ModelRuntime {
    pub fn new(loader: Box<dyn EngineLoader>) -> Self {
        Self {
            loader,
            current: Mutex::new(None),
        }
    }

    /// Load `spec` from `model_file`, replacing any currently loaded model.
    ///
    /// The previous engine is always released before the new one is
    /// constructed. On failure no model is left loaded and the error
    /// surfaces to the caller.
    pub fn load(&self, spec: &ModuleSpec, model_file: &Path) -> Result<()> {
        if !model_file.is_file() {
            bail!("Model file not found for {}: {:?}", spec.id, model_file);
        }

        let mut current = resilient_lock(&self.current);
        if let Some(previous) = current.take() {
            tracing::info!(module_id = %previous.module_id, "Unloading current model");
            drop(previous);
        }

        tracing::info!(module_id = %spec.id, "Loading model");
        let engine = self
            .loader
            .load(model_file, spec)
            .with_context(|| format!("Failed to load model {}", spec.id))?;

        *current = Some(LoadedModel {
            module_id: spec.id.clone(),
            engine,
        });
        tracing::info!(module_id = %spec.id, "Model loaded");
        Ok(())
    }

    /// Drop the loaded model, if any.
    pub fn unload(&self) {
        let mut current = resilient_lock(&self.current);
        if let Some(previous) = current.take() {
            tracing::info!(module_id = %previous.module_id, "Unloading model");
        }
    }

    /// Id of the currently loaded model, if any.
    pub fn loaded_module(&self) -> Option<String> {
        resilient_lock(&self.current)
            .as_ref()
            .map(|m| m.module_id.clone())
    }

    /// Generate a reply for the conversation.
    ///
    /// Fails when no model is loaded. The message list is rendered into a
    /// single role-labelled prompt; the result is trimmed of surrounding
    /// whitespace.
    pub fn generate(
        &self,
        messages: &[ChatTurn],
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String> {
        let mut current = resilient_lock(&self.current);
        let loaded = match current.as_mut() {
            Some(loaded) => loaded,
            None => bail!("no model loaded"),
        };

        let prompt = render_prompt(messages);
        let text = loaded
            .engine
            .generate(&prompt, max_tokens, temperature, STOP_SEQUENCES)
            .with_context(|| format!("Generation failed on {}", loaded.module_id))?;
        Ok(text.trim().to_string())
    }
}

/// Render role-labelled turns into one prompt, ending with the assistant
/// cue the engine completes from. Unknown roles are skipped.
fn render_prompt(messages: &[ChatTurn]) -> String {
    let mut prompt = String::new();
    for message in messages {
        let label = match message.role.as_str() {
            "system" => "System",
            "user" => "User",
            "assistant" => "Assistant",
            _ => continue,
        };
        prompt.push_str(label);
        prompt.push_str(": ");
        prompt.push_str(&message.content);
        prompt.push_str("\n\n");
    }
    prompt.push_str("Assistant: ");
    prompt
}
