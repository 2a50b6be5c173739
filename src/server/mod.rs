// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! API server
//!
//! HTTP surface over the catalog, the download orchestrator and the model
//! runtime. Responses are structured JSON mirroring the persisted records.
//!
//! # Endpoints
//!
//! - `GET /health` - Health check
//! - `GET /modules/` - Catalog with per-module download state
//! - `GET /modules/downloaded/` - Locally available modules
//! - `POST /modules/download/` - Start a background download
//! - `POST /modules/cancel/` - Cancel an in-flight download
//! - `GET /modules/download-status/:module_id` - One module's status
//! - `GET /modules/download-status/` - All active downloads (poll target)
//! - `POST /modules/delete/` - Remove a downloaded module
//! - `POST /modules/load/` - Load a downloaded module into memory
//! - `GET /modules/status/` - Currently loaded module
//! - `POST /chat/` - Generate a reply (auto-loads the module)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::timeout::TimeoutLayer;

use crate::catalog::{ModuleCatalog, ModuleSpec};
use crate::config::Settings;
use crate::engine::LlamaServerLoader;
use crate::orchestrator::{DownloadOrchestrator, DownloadReport};
use crate::runtime::{ChatTurn, ModelRuntime};
use crate::status::TransferPhase;

// Maximum request body size (1MB); requests carry ids and short messages.
const MAX_BODY_SIZE: usize = 1024 * 1024;

// Generation can legitimately run for minutes on large models.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

// Generation defaults matching the original product behavior.
const CHAT_MAX_TOKENS: u32 = 512;
const CHAT_TEMPERATURE: f32 = 0.7;

// Callers include at most this many trailing history turns.
const CHAT_HISTORY_WINDOW: usize = 10;

const CHAT_SYSTEM_PROMPT: &str = "You are a helpful and intelligent local AI assistant.";

/// Server state shared across handlers.
pub struct AppState {
    pub catalog: ModuleCatalog,
    pub orchestrator: DownloadOrchestrator,
    pub runtime: Arc<ModelRuntime>,
}

/// API server configuration.
pub struct Server {
    settings: Settings,
}

impl Server {
    /// Create a server over the given settings.
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    /// Build the shared state: catalog, storage layout, orchestrator and
    /// runtime.
    fn build_state(&self) -> Result<Arc<AppState>> {
        let catalog = match &self.settings.catalog_file {
            Some(path) => ModuleCatalog::from_file(path)?,
            None => ModuleCatalog::builtin(),
        };

        let paths = self.settings.storage();
        paths.ensure()?;

        let orchestrator = DownloadOrchestrator::new(paths)?;
        let runtime = Arc::new(ModelRuntime::new(Box::new(LlamaServerLoader::new(
            self.settings.engine_port,
        ))));

        Ok(Arc::new(AppState {
            catalog,
            orchestrator,
            runtime,
        }))
    }

    /// Build the router with all routes.
    pub fn build_router(&self) -> Result<Router> {
        let state = self.build_state()?;

        // Rate limiting: 60 requests per minute per IP.
        let governor_conf = Arc::new(
            GovernorConfigBuilder::default()
                .per_second(1)
                .burst_size(60)
                .key_extractor(SmartIpKeyExtractor)
                .finish()
                .expect("Failed to build governor config"),
        );

        Ok(Router::new()
            .route("/health", get(health_handler))
            .route("/modules/", get(list_modules_handler))
            .route("/modules/downloaded/", get(list_downloaded_handler))
            .route("/modules/download/", post(download_handler))
            .route("/modules/cancel/", post(cancel_handler))
            .route(
                "/modules/download-status/:module_id",
                get(download_status_handler),
            )
            .route("/modules/download-status/", get(all_downloads_handler))
            .route("/modules/delete/", post(delete_handler))
            .route("/modules/load/", post(load_handler))
            .route("/modules/status/", get(model_status_handler))
            .route("/chat/", post(chat_handler))
            .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
            .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
            .layer(GovernorLayer {
                config: governor_conf,
            })
            .with_state(state))
    }

    /// Start the server with graceful shutdown.
    pub async fn start(&self) -> Result<()> {
        let router = self.build_router()?;
        let addr = format!("{}:{}", self.settings.bind_address, self.settings.port);

        tracing::info!("Starting server on {}", addr);
        if self.settings.bind_address == "0.0.0.0" {
            tracing::warn!(
                "Server is binding to 0.0.0.0 which exposes the API to the network. \
                Use 127.0.0.1 (default) for local-only access."
            );
        }

        let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                anyhow::anyhow!(
                    "Port {} is already in use. Another modeldock instance may be running; \
                     stop it or change the port in config.json.",
                    self.settings.port
                )
            } else {
                anyhow::anyhow!("Failed to bind to {}: {}", addr, e)
            }
        })?;

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        Ok(())
    }
}

// =============================================================================
// Errors
// =============================================================================

/// User-facing API errors, each carrying the module id it concerns.
#[derive(Debug)]
pub enum ApiError {
    /// Unknown module id (404).
    ModuleNotFound { module_id: String },
    /// Module exists but has not been downloaded (400).
    NotDownloaded { module_id: String },
    /// Cancel requested while nothing was downloading (404).
    NotDownloading { module_id: String },
    /// Engine construction or generation failed (500).
    Engine { module_id: String, message: String },
    /// Malformed request (400).
    InvalidRequest { message: String },
    /// Anything else (500).
    Internal { message: String },
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    module_id: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, module_id) = match self {
            ApiError::ModuleNotFound { module_id } => (
                StatusCode::NOT_FOUND,
                "Module not found".to_string(),
                Some(module_id),
            ),
            ApiError::NotDownloaded { module_id } => (
                StatusCode::BAD_REQUEST,
                "Model not downloaded. Please download it first.".to_string(),
                Some(module_id),
            ),
            ApiError::NotDownloading { module_id } => (
                StatusCode::NOT_FOUND,
                "Module is not downloading".to_string(),
                Some(module_id),
            ),
            ApiError::Engine { module_id, message } => {
                tracing::error!(module_id = %module_id, "Engine failure: {}", message);
                (StatusCode::INTERNAL_SERVER_ERROR, message, Some(module_id))
            }
            ApiError::InvalidRequest { message } => (StatusCode::BAD_REQUEST, message, None),
            ApiError::Internal { message } => {
                tracing::error!("Internal error: {}", message);
                (StatusCode::INTERNAL_SERVER_ERROR, message, None)
            }
        };
        (status, Json(ErrorBody { error, module_id })).into_response()
    }
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    loaded_module: Option<String>,
    tracked_workers: usize,
}

/// Catalog entry plus live download state.
#[derive(Serialize)]
struct ModuleEntry {
    #[serde(flatten)]
    module: ModuleSpec,
    downloaded: bool,
    download_status: DownloadReport,
    is_downloading: bool,
}

#[derive(Serialize)]
struct ModulesResponse {
    modules: Vec<ModuleEntry>,
    timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
struct DownloadedEntry {
    #[serde(flatten)]
    module: ModuleSpec,
    downloaded: bool,
    local_path: String,
    size_on_disk: u64,
}

#[derive(Serialize)]
struct DownloadedResponse {
    modules: Vec<DownloadedEntry>,
}

/// Body for all POST endpoints addressing one module.
#[derive(Deserialize)]
struct ModuleRequest {
    module_id: String,
}

#[derive(Serialize)]
struct ActionResponse {
    status: &'static str,
    message: String,
    module_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    module: Option<ModuleSpec>,
}

impl ActionResponse {
    fn new(status: &'static str, message: String, module_id: String) -> Self {
        Self {
            status,
            message,
            module_id,
            progress: None,
            module: None,
        }
    }
}

#[derive(Serialize)]
struct StatusResponse {
    module_id: String,
    #[serde(flatten)]
    report: DownloadReport,
    module: ModuleSpec,
}

/// Compact per-module entry for the lightweight polling endpoint.
#[derive(Serialize)]
struct ActiveDownload {
    progress: u8,
    speed_bps: f64,
    eta_seconds: f64,
    status: TransferPhase,
    retries: u32,
}

#[derive(Serialize)]
struct AllDownloadsResponse {
    downloads: IndexMap<String, ActiveDownload>,
    count: usize,
}

#[derive(Serialize)]
struct ModelStatusResponse {
    loaded: bool,
    model_id: Option<String>,
    module: Option<ModuleSpec>,
}

#[derive(Deserialize)]
struct ChatRequest {
    module_id: String,
    message: String,
    #[serde(default)]
    history: Vec<ChatTurn>,
}

#[derive(Serialize)]
struct ChatResponse {
    response: String,
    module_name: String,
    module_id: String,
}

// =============================================================================
// Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        loaded_module: state.runtime.loaded_module(),
        tracked_workers: state.orchestrator.tracked_workers(),
    })
}

/// Full catalog with per-module downloaded/downloading state.
async fn list_modules_handler(State(state): State<Arc<AppState>>) -> Json<ModulesResponse> {
    // Opportunistic cleanup of finished worker handles.
    state.orchestrator.reap_finished();

    let modules = state
        .catalog
        .all()
        .iter()
        .map(|module| {
            let report = state.orchestrator.status(&module.id);
            ModuleEntry {
                downloaded: state.orchestrator.is_downloaded(&module.id),
                is_downloading: report.status.phase.is_active(),
                download_status: report,
                module: module.clone(),
            }
        })
        .collect();

    Json(ModulesResponse {
        modules,
        timestamp: Utc::now(),
    })
}

async fn list_downloaded_handler(State(state): State<Arc<AppState>>) -> Json<DownloadedResponse> {
    let modules = state
        .orchestrator
        .downloaded_modules(&state.catalog)
        .into_iter()
        .filter_map(|downloaded| {
            let module = state.catalog.get(&downloaded.id)?.clone();
            Some(DownloadedEntry {
                module,
                downloaded: true,
                local_path: downloaded.path.display().to_string(),
                size_on_disk: downloaded.size_bytes,
            })
        })
        .collect();

    Json(DownloadedResponse { modules })
}

/// Start a background download for a module.
async fn download_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ModuleRequest>,
) -> Result<Json<ActionResponse>, ApiError> {
    let module = lookup(&state, &request.module_id)?.clone();

    if state.orchestrator.is_downloaded(&module.id) {
        return Ok(Json(ActionResponse::new(
            "already_downloaded",
            format!("{} is already downloaded", module.display_name),
            module.id,
        )));
    }

    let report = state.orchestrator.status(&module.id);
    if report.status.phase.is_active() {
        let mut response = ActionResponse::new(
            "already_downloading",
            format!("{} is already being downloaded", module.display_name),
            module.id,
        );
        response.progress = Some(report.status.progress);
        return Ok(Json(response));
    }

    let started = state
        .orchestrator
        .start(&module)
        .map_err(|e| ApiError::Internal {
            message: format!("{:#}", e),
        })?;

    if started {
        let mut response = ActionResponse::new(
            "downloading",
            format!("Download started in background for {}", module.display_name),
            module.id.clone(),
        );
        response.module = Some(module);
        Ok(Json(response))
    } else {
        // Refused by the handle table or the transfer lock: another worker
        // owns this artifact.
        let mut response = ActionResponse::new(
            "already_downloading",
            format!("{} is already being downloaded", module.display_name),
            module.id,
        );
        response.progress = Some(report.status.progress);
        Ok(Json(response))
    }
}

async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ModuleRequest>,
) -> Result<Json<ActionResponse>, ApiError> {
    let module = lookup(&state, &request.module_id)?.clone();

    // Bounded wait before forceful kill; keep it off the reactor.
    let orchestrator_state = Arc::clone(&state);
    let module_id = module.id.clone();
    let cancelled =
        tokio::task::spawn_blocking(move || orchestrator_state.orchestrator.cancel(&module_id))
            .await
            .map_err(|e| ApiError::Internal {
                message: format!("cancel task failed: {}", e),
            })?;

    if cancelled {
        Ok(Json(ActionResponse::new(
            "cancelled",
            format!("Download cancelled for {}", module.display_name),
            module.id,
        )))
    } else {
        Err(ApiError::NotDownloading {
            module_id: module.id,
        })
    }
}

async fn download_status_handler(
    State(state): State<Arc<AppState>>,
    Path(module_id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let module = lookup(&state, &module_id)?.clone();
    let report = state.orchestrator.status(&module.id);
    Ok(Json(StatusResponse {
        module_id: module.id.clone(),
        report,
        module,
    }))
}

/// Only modules with an active transfer; cheap to poll.
async fn all_downloads_handler(State(state): State<Arc<AppState>>) -> Json<AllDownloadsResponse> {
    let mut downloads = IndexMap::new();
    for module in state.catalog.all() {
        let report = state.orchestrator.status(&module.id);
        if report.status.phase.is_active() {
            downloads.insert(
                module.id.clone(),
                ActiveDownload {
                    progress: report.status.progress,
                    speed_bps: report.status.speed_bps,
                    eta_seconds: report.status.eta_seconds,
                    status: report.status.phase,
                    retries: report.status.retries,
                },
            );
        }
    }

    let count = downloads.len();
    Json(AllDownloadsResponse { downloads, count })
}

async fn delete_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ModuleRequest>,
) -> Result<Json<ActionResponse>, ApiError> {
    let module = lookup(&state, &request.module_id)?.clone();

    // Unload first so no engine keeps the file mapped.
    if state.runtime.loaded_module().as_deref() == Some(module.id.as_str()) {
        let runtime = Arc::clone(&state.runtime);
        tokio::task::spawn_blocking(move || runtime.unload())
            .await
            .map_err(|e| ApiError::Internal {
                message: format!("unload task failed: {}", e),
            })?;
    }

    let delete_state = Arc::clone(&state);
    let module_id = module.id.clone();
    let removed = tokio::task::spawn_blocking(move || delete_state.orchestrator.delete(&module_id))
        .await
        .map_err(|e| ApiError::Internal {
            message: format!("delete task failed: {}", e),
        })?
        .map_err(|e| ApiError::Internal {
            message: format!("{:#}", e),
        })?;

    if removed {
        Ok(Json(ActionResponse::new(
            "success",
            format!("{} deleted successfully", module.display_name),
            module.id,
        )))
    } else {
        Err(ApiError::ModuleNotFound {
            module_id: module.id,
        })
    }
}

async fn load_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ModuleRequest>,
) -> Result<Json<ActionResponse>, ApiError> {
    let module = lookup(&state, &request.module_id)?.clone();
    load_module(&state, &module).await?;

    let mut response = ActionResponse::new(
        "success",
        format!("{} loaded successfully", module.display_name),
        module.id.clone(),
    );
    response.module = Some(module);
    Ok(Json(response))
}

async fn model_status_handler(State(state): State<Arc<AppState>>) -> Json<ModelStatusResponse> {
    match state.runtime.loaded_module() {
        Some(model_id) => Json(ModelStatusResponse {
            loaded: true,
            module: state.catalog.get(&model_id).cloned(),
            model_id: Some(model_id),
        }),
        None => Json(ModelStatusResponse {
            loaded: false,
            model_id: None,
            module: None,
        }),
    }
}

async fn chat_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    if request.message.trim().is_empty() {
        return Err(ApiError::InvalidRequest {
            message: "Message is required".to_string(),
        });
    }

    let module = lookup(&state, &request.module_id)?.clone();

    // Auto-load the requested module if something else (or nothing) is live.
    if state.runtime.loaded_module().as_deref() != Some(module.id.as_str()) {
        load_module(&state, &module).await?;
    }

    let mut messages = Vec::with_capacity(request.history.len().min(CHAT_HISTORY_WINDOW) + 2);
    messages.push(ChatTurn::new("system", CHAT_SYSTEM_PROMPT));
    let window_start = request.history.len().saturating_sub(CHAT_HISTORY_WINDOW);
    messages.extend_from_slice(&request.history[window_start..]);
    messages.push(ChatTurn::new("user", request.message));

    let runtime = Arc::clone(&state.runtime);
    let module_id = module.id.clone();
    let response_text = tokio::task::spawn_blocking(move || {
        runtime.generate(&messages, CHAT_MAX_TOKENS, CHAT_TEMPERATURE)
    })
    .await
    .map_err(|e| ApiError::Internal {
        message: format!("generation task failed: {}", e),
    })?
    .map_err(|e| ApiError::Engine {
        module_id,
        message: format!("{:#}", e),
    })?;

    Ok(Json(ChatResponse {
        response: response_text,
        module_name: module.display_name,
        module_id: module.id,
    }))
}

// =============================================================================
// Helpers
// =============================================================================

fn lookup<'a>(state: &'a AppState, module_id: &str) -> Result<&'a ModuleSpec, ApiError> {
    state
        .catalog
        .get(module_id)
        .ok_or_else(|| ApiError::ModuleNotFound {
            module_id: module_id.to_string(),
        })
}

/// Load a module into the runtime, requiring the artifact to exist locally.
async fn load_module(state: &Arc<AppState>, module: &ModuleSpec) -> Result<(), ApiError> {
    if !state.orchestrator.is_downloaded(&module.id) {
        return Err(ApiError::NotDownloaded {
            module_id: module.id.clone(),
        });
    }

    let runtime = Arc::clone(&state.runtime);
    let model_file = state.orchestrator.paths().module_file(&module.id);
    let spec = module.clone();
    let module_id = module.id.clone();

    tokio::task::spawn_blocking(move || runtime.load(&spec, &model_file))
        .await
        .map_err(|e| ApiError::Internal {
            message: format!("load task failed: {}", e),
        })?
        .map_err(|e| ApiError::Engine {
            module_id,
            message: format!("{:#}", e),
        })?;
    Ok(())
}

/// Wait for SIGINT or SIGTERM (Ctrl+C only on non-Unix).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down"),
            _ = sigint.recv() => tracing::info!("Received SIGINT, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        tracing::info!("Received Ctrl+C, shutting down");
    }
}
