//! # Loom-rs
//!
//! Backend for a chat-driven React playground.
//!
//! This server provides:
//! - Per-project workspaces on disk with an install step and a supervised dev server
//! - Live dev server logs over SSE and WebSocket
//! - Chat that answers inline or runs code edits as pollable background jobs
//! - A workspace event stream (file edits, file changes, runtime status)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌──────────────────┐
//! │  Editor UI  │────▶│  Axum HTTP   │────▶│  ProcessManager  │──▶ npm start (per project)
//! └─────────────┘     │  Server      │     │  (runtime.rs)    │        │
//!       ▲             └──────────────┘     └──────────────────┘        ▼
//!       │ SSE / WS          │                                     LogRelay
//!       │                   ▼                                    (relay.rs)
//! ┌─────────────┐     ┌──────────────┐     ┌──────────────────┐
//! │  EventBus   │◀────│ Orchestrator │────▶│   JobRegistry    │
//! │ (events.rs) │     │  (chat.rs)   │     │   (jobs.rs)      │
//! └─────────────┘     └──────────────┘     └──────────────────┘
//! ```
//!
//! ## API Endpoints
//!
//! - `GET /health` - Server health check
//! - `GET /api/events` - Workspace SSE event stream
//! - `POST /api/init-project` - Create (or recreate) a project and install it
//! - `POST /api/start-dev-server` / `POST /api/stop-dev-server`
//! - `GET /api/projects`, `GET|DELETE /api/projects/{name}`
//! - `GET /api/projects/{name}/logs`, `GET /api/projects/{name}/logs/stream`, `GET /ws/logs/{name}`
//! - `GET /api/files`, `GET|PUT /api/file`, `PUT /api/component/{filename}`
//! - `POST /api/chat`, `GET /api/chat/jobs/{id}`, `POST /api/chat/jobs/{id}/cancel`, `GET /api/chat/history`
//! - `POST /api/uploads`, `GET /api/uploads/{name}`

mod chat;
mod config;
mod context;
mod edits;
mod error;
mod events;
mod install;
mod jobs;
mod model;
mod readiness;
mod relay;
mod runtime;
mod template;
mod uploads;
mod watcher;
mod workspace;

use axum::{
    extract::ws::{Message, WebSocket},
    extract::{DefaultBodyLimit, FromRequest, Multipart, Path, Query, Request, State, WebSocketUpgrade},
    http::{header, HeaderMap},
    response::{sse::{Event, KeepAlive, Sse}, IntoResponse, Json},
    routing::{get, post},
    Router,
};
use futures::future::Future;
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    convert::Infallible,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::chat::ChatOrchestrator;
use crate::config::Settings;
use crate::error::{AppError, AppResult};
use crate::events::{EventBus, WorkspaceEvent};
use crate::jobs::{JobRegistry, PollPolicy};
use crate::model::{ChatModel, OpenRouterModel};
use crate::relay::LogRelay;
use crate::runtime::{ProcessManager, ProjectStatus};
use crate::workspace::{FileNode, ProjectSeed, WorkspaceStore};

const HEARTBEAT_SECS: u64 = 15;
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

// ============================================================================
// Application State
// ============================================================================

pub struct AppState {
    start_time: Instant,
    settings: Settings,
    store: Arc<WorkspaceStore>,
    relay: Arc<LogRelay>,
    processes: Arc<ProcessManager>,
    jobs: Arc<JobRegistry>,
    chat: Arc<ChatOrchestrator>,
    events: Arc<EventBus>,
    poll: PollPolicy,
    watcher: Option<watcher::WorkspaceWatcher>,
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl AppState {
    fn new(settings: Settings, model: Arc<dyn ChatModel>) -> std::io::Result<Arc<Self>> {
        let store = Arc::new(WorkspaceStore::new(settings.workspace_dir.clone())?);
        let relay = Arc::new(LogRelay::new(settings.log_buffer, settings.log_backlog));
        let processes = Arc::new(ProcessManager::new(&settings, store.clone(), relay.clone()));
        let jobs = Arc::new(JobRegistry::new(settings.job_timeout, settings.job_retention));
        let events = Arc::new(EventBus::new(256));
        let chat = Arc::new(ChatOrchestrator::new(
            model,
            store.clone(),
            jobs.clone(),
            events.clone(),
            settings.upload_dir.clone(),
        ));

        let watch_root = store.root().canonicalize().unwrap_or_else(|_| store.root().to_path_buf());
        let watcher = match watcher::WorkspaceWatcher::start(watch_root, events.clone()) {
            Ok(watcher) => {
                for project in store.list_projects() {
                    watcher.add_project(&project);
                }
                tracing::info!(dirs = watcher.watched_count(), "Watching existing projects");
                Some(watcher)
            }
            Err(e) => {
                tracing::warn!("File watcher unavailable, external edits will not be pushed: {}", e);
                None
            }
        };

        Ok(Arc::new(Self {
            start_time: Instant::now(),
            poll: PollPolicy::from_settings(&settings),
            settings,
            store,
            relay,
            processes,
            jobs,
            chat,
            events,
            watcher,
            shutdown: tokio::sync::watch::channel(false).0,
        }))
    }

    /// Resolves once shutdown has begun. Long-lived streams end on it so the
    /// graceful drain can finish.
    fn closing(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.shutdown.subscribe();
        async move {
            let _ = rx.wait_for(|closing| *closing).await;
        }
    }

    async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.processes.shutdown_all().await;
    }

    /// Forward runtime status changes onto the workspace event stream.
    fn spawn_runtime_forwarder(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut changes = self.processes.subscribe_changes();
        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(status) => {
                        events.publish(WorkspaceEvent::Runtime { status });
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::debug!("Runtime forwarder lagged by {}", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

// ============================================================================
// Health Endpoint
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    version: &'static str,
    running_projects: usize,
    active_jobs: usize,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.start_time.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION"),
        running_projects: state.processes.running_count(),
        active_jobs: state.jobs.active_count(),
    })
}

// ============================================================================
// Workspace Event Stream
// ============================================================================

fn sse_event(seq: u64, event: &WorkspaceEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_default();
    Event::default().event(event.name()).id(seq.to_string()).data(data)
}

async fn stream_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    if let Some(id) = headers.get("Last-Event-ID").and_then(|v| v.to_str().ok()) {
        tracing::info!("Event client reconnecting from event ID: {}", id);
    }

    let rx = state.events.subscribe();

    let heartbeat_bus = state.events.clone();
    let heartbeat = stream::unfold((), move |()| {
        let bus = heartbeat_bus.clone();
        async move {
            tokio::time::sleep(Duration::from_secs(HEARTBEAT_SECS)).await;
            let event = WorkspaceEvent::Heartbeat {
                timestamp: chrono::Utc::now().timestamp(),
            };
            Some((Ok::<_, Infallible>(sse_event(bus.next_seq(), &event)), ()))
        }
    });

    let broadcast_stream = stream::unfold(rx, move |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok((seq, event)) => return Some((Ok::<_, Infallible>(sse_event(seq, &event)), rx)),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("Event subscriber lagged by {}", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    let merged = tokio_stream::StreamExt::merge(heartbeat, broadcast_stream);
    Sse::new(futures::StreamExt::take_until(merged, state.closing())).keep_alive(KeepAlive::default())
}

// ============================================================================
// Project Lifecycle Endpoints
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitProjectRequest {
    #[serde(alias = "projectName")]
    name: Option<String>,
    #[serde(default)]
    entry_code: String,
    entry_file: Option<String>,
    #[serde(default)]
    dependencies: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct InitProjectResponse {
    success: bool,
    message: String,
    status: ProjectStatus,
}

async fn init_project(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InitProjectRequest>,
) -> AppResult<Json<InitProjectResponse>> {
    let name = req
        .name
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| AppError::bad_request("Project name is required"))?;
    let seed = ProjectSeed {
        entry_code: req.entry_code,
        entry_file: req.entry_file,
        dependencies: req.dependencies,
    };
    let initialized = state.processes.initialize(&name, &seed).await;
    if let Some(watcher) = &state.watcher {
        watcher.add_project(&name);
    }
    let status = initialized?;
    Ok(Json(InitProjectResponse {
        success: true,
        message: format!("Project '{}' initialized", name),
        status,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectRequest {
    project_name: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartResponse {
    success: bool,
    preview_url: String,
}

async fn start_dev_server(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ProjectRequest>,
) -> AppResult<Json<StartResponse>> {
    let preview_url = state.processes.start(&req.project_name).await?;
    Ok(Json(StartResponse {
        success: true,
        preview_url,
    }))
}

#[derive(Serialize)]
struct StopResponse {
    success: bool,
    status: ProjectStatus,
}

async fn stop_dev_server(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ProjectRequest>,
) -> AppResult<Json<StopResponse>> {
    let status = state.processes.stop(&req.project_name).await?;
    Ok(Json(StopResponse { success: true, status }))
}

#[derive(Serialize)]
struct ProjectsResponse {
    projects: Vec<ProjectStatus>,
}

async fn list_projects(State(state): State<Arc<AppState>>) -> Json<ProjectsResponse> {
    Json(ProjectsResponse {
        projects: state.processes.list(),
    })
}

async fn project_status(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> AppResult<Json<ProjectStatus>> {
    Ok(Json(state.processes.status(&name)?))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct DeleteQuery {
    #[serde(default)]
    remove_files: bool,
}

#[derive(Serialize)]
struct SuccessResponse {
    success: bool,
}

async fn delete_project(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> AppResult<Json<SuccessResponse>> {
    state.processes.delete(&name, query.remove_files).await?;
    if query.remove_files {
        if let Some(watcher) = &state.watcher {
            watcher.remove_project(&name);
        }
    }
    Ok(Json(SuccessResponse { success: true }))
}

// ============================================================================
// Log Endpoints
// ============================================================================

#[derive(Deserialize, Default)]
struct LogsQuery {
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Serialize)]
struct LogsResponse {
    lines: Vec<relay::LogLine>,
}

async fn recent_logs(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<LogsQuery>,
) -> AppResult<Json<LogsResponse>> {
    workspace::validate_name(&name)?;
    let limit = query.limit.unwrap_or(state.settings.log_backlog);
    Ok(Json(LogsResponse {
        lines: state.relay.recent(&name, limit),
    }))
}

async fn log_stream(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    workspace::validate_name(&name)?;
    let lines = futures::StreamExt::map(state.relay.subscribe(&name).into_stream(), |line| {
        let data = serde_json::to_string(&line).unwrap_or_default();
        Ok::<_, Infallible>(Event::default().event("log").data(data))
    });
    Ok(Sse::new(futures::StreamExt::take_until(lines, state.closing())).keep_alive(KeepAlive::default()))
}

async fn log_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> AppResult<impl IntoResponse> {
    workspace::validate_name(&name)?;
    Ok(ws.on_upgrade(move |socket| handle_log_ws(socket, state, name)))
}

async fn handle_log_ws(mut socket: WebSocket, state: Arc<AppState>, project: String) {
    let mut sub = state.relay.subscribe(&project);
    let closing = state.closing();
    tokio::pin!(closing);
    tracing::debug!(project = %project, "Log viewer connected");

    loop {
        tokio::select! {
            _ = &mut closing => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            line = sub.recv() => {
                let Some(line) = line else { break };
                let text = serde_json::to_string(&line).unwrap_or_default();
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
    tracing::debug!(project = %project, dropped = sub.dropped(), "Log viewer disconnected");
}

// ============================================================================
// File Endpoints
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FilesQuery {
    project_name: String,
}

#[derive(Serialize)]
struct TreeResponse {
    tree: Vec<FileNode>,
}

async fn file_tree(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FilesQuery>,
) -> AppResult<Json<TreeResponse>> {
    if !state.store.exists(&query.project_name) {
        return Err(AppError::not_found(format!("Project '{}' not found", query.project_name)));
    }
    Ok(Json(TreeResponse {
        tree: state.store.file_tree(&query.project_name).await?,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileQuery {
    project_name: String,
    relative_path: String,
}

#[derive(Serialize)]
struct FileResponse {
    content: String,
}

async fn read_file(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FileQuery>,
) -> AppResult<Json<FileResponse>> {
    let content = state.store.read_file(&query.project_name, &query.relative_path).await?;
    Ok(Json(FileResponse { content }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaveFileRequest {
    project_name: String,
    #[serde(default)]
    relative_path: String,
    content: String,
}

#[derive(Serialize)]
struct SaveFileResponse {
    success: bool,
    path: String,
}

async fn save_file(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SaveFileRequest>,
) -> AppResult<Json<SaveFileResponse>> {
    if req.relative_path.trim().is_empty() {
        return Err(AppError::precondition("No file selected"));
    }
    let path = state
        .store
        .write_file(&req.project_name, &req.relative_path, &req.content)
        .await?;
    Ok(Json(SaveFileResponse { success: true, path }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ComponentRequest {
    project_name: String,
    content: String,
}

#[derive(Serialize)]
struct ComponentResponse {
    success: bool,
    message: String,
    path: String,
}

/// Overwrite (or create) a file under the project's `src/`.
async fn update_component(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
    Json(req): Json<ComponentRequest>,
) -> AppResult<Json<ComponentResponse>> {
    let relative = format!("src/{}", filename.trim_start_matches('/'));
    // `..` must not leave src/ even when it stays inside the project.
    let resolved = workspace::slash_path(&workspace::normalize_relative(&relative)?);
    if !resolved.starts_with("src/") {
        return Err(AppError::bad_request("Component path must stay under src/"));
    }
    let path = state.store.write_file(&req.project_name, &resolved, &req.content).await?;
    Ok(Json(ComponentResponse {
        success: true,
        message: "Component updated successfully".to_string(),
        path,
    }))
}

// ============================================================================
// Uploads
// ============================================================================

async fn upload(State(state): State<Arc<AppState>>, request: Request) -> AppResult<Json<uploads::UploadBatch>> {
    let dir = state.settings.upload_dir.clone();
    let is_form = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("multipart/form-data"));

    let files = if is_form {
        let form = Multipart::from_request(request, &state)
            .await
            .map_err(|e| AppError::bad_request(e.body_text()))?;
        uploads::store_multipart(&dir, form).await?
    } else {
        let (parts, body) = request.into_parts();
        let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
            .await
            .map_err(|e| AppError::bad_request(format!("Could not read upload: {}", e)))?;
        vec![uploads::store(&dir, &parts.headers, bytes).await?]
    };
    Ok(Json(uploads::UploadBatch { files }))
}

async fn serve_upload(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> AppResult<impl IntoResponse> {
    let (mime, bytes) = uploads::read(&state.settings.upload_dir, &name).await?;
    Ok(([(header::CONTENT_TYPE, mime)], bytes))
}

// ============================================================================
// Router & Main
// ============================================================================

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }
    let parsed: Vec<header::HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
    layer.allow_origin(parsed)
}

fn build_router(state: Arc<AppState>) -> Router {
    let static_dir = state.settings.static_dir.clone();
    let cors = cors_layer(&state.settings.cors_origins);

    Router::new()
        // Health
        .route("/health", get(health))
        // SSE
        .route("/api/events", get(stream_events))
        // Project lifecycle
        .route("/api/init-project", post(init_project))
        .route("/api/start-dev-server", post(start_dev_server))
        .route("/api/stop-dev-server", post(stop_dev_server))
        .route("/api/projects", get(list_projects))
        .route("/api/projects/{name}", get(project_status).delete(delete_project))
        // Logs
        .route("/api/projects/{name}/logs", get(recent_logs))
        .route("/api/projects/{name}/logs/stream", get(log_stream))
        .route("/ws/logs/{name}", get(log_ws))
        // Files
        .route("/api/files", get(file_tree))
        .route("/api/file", get(read_file).put(save_file))
        .route("/api/component/{*filename}", axum::routing::put(update_component))
        // Chat & jobs
        .route("/api/chat", post(chat::chat))
        .route("/api/chat/jobs/{id}", get(chat::job_status))
        .route("/api/chat/jobs/{id}/cancel", post(chat::cancel_job))
        .route("/api/chat/history", get(chat::history))
        // Attachments (10MB limit)
        .route("/api/uploads", post(upload))
        .route("/api/uploads/{name}", get(serve_upload))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        // Static UI
        .fallback_service(ServeDir::new(static_dir).append_index_html_on_directories(true))
        .layer(cors)
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}

/// Serve until `signal` fires, then stop every dev server before draining
/// the remaining connections.
async fn serve<F>(listener: tokio::net::TcpListener, state: Arc<AppState>, signal: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(state.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            signal.await;
            state.shutdown().await;
        })
        .await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("loom_rs=info".parse()?)
            .add_directive("tower_http=info".parse()?))
        .init();

    let settings = Settings::from_env();
    if settings.openrouter_api_key.is_none() {
        tracing::warn!("OPENROUTER_API_KEY not set, chat requests will fail");
    }
    let model: Arc<dyn ChatModel> = Arc::new(OpenRouterModel::from_settings(&settings));
    let state = AppState::new(settings, model)?;

    state.spawn_runtime_forwarder();
    state.jobs.spawn_reaper(state.settings.job_reap_interval);

    let addr: SocketAddr = format!("{}:{}", state.settings.bind, state.settings.port).parse()?;
    tracing::info!("Loom-rs v{} listening on {}", env!("CARGO_PKG_VERSION"), addr);
    tracing::info!(
        workspaces = %state.store.root().display(),
        start = %state.settings.start_command.display(),
        "Workspace ready"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve(listener, state, shutdown_signal()).await?;
    tracing::info!("Server stopped");
    Ok(())
}
