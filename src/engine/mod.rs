// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Inference engine seam.
//!
//! The runtime only ever talks to [`TextEngine`] and [`EngineLoader`]; what
//! actually turns a prompt into text is pluggable. The production loader
//! spawns a local `llama-server` (llama.cpp) process for the model file and
//! generates over its HTTP completion endpoint. Dropping the engine kills
//! the sidecar, which is what releases the model's memory.

use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::catalog::ModuleSpec;

/// How long the loader waits for the engine to finish mapping the model
/// into memory before giving up.
const READY_TIMEOUT: Duration = Duration::from_secs(180);

/// Poll interval while waiting for engine readiness.
const READY_POLL: Duration = Duration::from_millis(500);

/// A loaded model that can generate text.
pub trait TextEngine: Send {
    /// Generate a completion for `prompt`, honoring the stop sequences.
    fn generate(
        &mut self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
        stop: &[&str],
    ) -> Result<String>;
}

/// Constructs a [`TextEngine`] from a model file and its descriptor.
pub trait EngineLoader: Send + Sync {
    fn load(&self, model_file: &Path, spec: &ModuleSpec) -> Result<Box<dyn TextEngine>>;
}

/// Loader that runs models through a local llama.cpp `llama-server`.
pub struct LlamaServerLoader {
    binary: String,
    port: u16,
}

impl LlamaServerLoader {
    pub fn new(port: u16) -> Self {
        Self {
            binary: "llama-server".to_string(),
            port,
        }
    }

    /// Use a specific server binary instead of whatever is on PATH.
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }
}

impl EngineLoader for LlamaServerLoader {
    fn load(&self, model_file: &Path, spec: &ModuleSpec) -> Result<Box<dyn TextEngine>> {
        tracing::info!(
            module_id = %spec.id,
            ?model_file,
            context_length = spec.context_length,
            n_threads = spec.n_threads,
            "Starting inference engine"
        );

        let child = Command::new(&self.binary)
            .arg("-m")
            .arg(model_file)
            .arg("-c")
            .arg(spec.context_length.to_string())
            .arg("-t")
            .arg(spec.n_threads.to_string())
            .arg("--host")
            .arg("127.0.0.1")
            .arg("--port")
            .arg(self.port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to start inference engine '{}'", self.binary))?;

        let mut engine = LlamaServerEngine {
            child,
            base_url: format!("http://127.0.0.1:{}", self.port),
            client: reqwest::blocking::Client::builder()
                .build()
                .context("Failed to build engine HTTP client")?,
        };

        // The sidecar answers /health with 200 once the weights are mapped.
        // On timeout the Drop impl tears the process down again.
        if let Err(e) = engine.wait_ready(READY_TIMEOUT) {
            return Err(e).with_context(|| format!("Engine failed to become ready for {}", spec.id));
        }

        tracing::info!(module_id = %spec.id, "Inference engine ready");
        Ok(Box::new(engine))
    }
}

/// Engine instance backed by one `llama-server` child process.
struct LlamaServerEngine {
    child: Child,
    base_url: String,
    client: reqwest::blocking::Client,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    prompt: &'a str,
    n_predict: u32,
    temperature: f32,
    stop: Vec<&'a str>,
}

#[derive(Deserialize)]
struct CompletionResponse {
    content: String,
}

impl LlamaServerEngine {
    fn wait_ready(&mut self, timeout: Duration) -> Result<()> {
        let url = format!("{}/health", self.base_url);
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.child.try_wait().ok().flatten() {
                bail!("Engine process exited during startup ({})", status);
            }
            match self.client.get(&url).timeout(READY_POLL).send() {
                Ok(response) if response.status().is_success() => return Ok(()),
                _ => {}
            }
            if Instant::now() >= deadline {
                bail!("Engine did not become ready within {:?}", timeout);
            }
            thread::sleep(READY_POLL);
        }
    }
}

impl TextEngine for LlamaServerEngine {
    fn generate(
        &mut self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
        stop: &[&str],
    ) -> Result<String> {
        let request = CompletionRequest {
            prompt,
            n_predict: max_tokens,
            temperature,
            stop: stop.to_vec(),
        };

        let response = self
            .client
            .post(format!("{}/completion", self.base_url))
            .json(&request)
            .send()
            .context("Engine request failed")?;

        if !response.status().is_success() {
            bail!("Engine returned HTTP {}", response.status());
        }

        let completion: CompletionResponse = response
            .json()
            .context("Failed to parse engine completion response")?;
        Ok(completion.content)
    }
}

impl Drop for LlamaServerEngine {
    /// Releasing the engine must release the model's memory: kill the
    /// sidecar and reap it.
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
