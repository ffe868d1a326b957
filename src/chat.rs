//! # Chat/Edit Orchestrator
//!
//! Decides per message whether to answer inline or hand the work to the job
//! registry:
//!
//! - `general` and `code_analyze` call the model and answer synchronously.
//! - `code_edit` submits a background job and returns its id right away. The
//!   worker asks the model for the new file, validates the target, writes it
//!   through the workspace store and announces the edit on the event bus.
//!
//! History is append-only per project. A job's reply is appended when the
//! job finishes, never at submission time.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::context::ProjectContext;
use crate::edits::{inject_route, is_allowed_new_file, is_page, parse_reply};
use crate::error::{AppError, AppResult};
use crate::events::{EventBus, WorkspaceEvent};
use crate::jobs::{
    JobContext, JobError, JobErrorKind, JobInput, JobRecord, JobRegistry, JobResult, JobStatus, PollOutcome,
    poll_until_terminal,
};
use crate::model::{ChatMessage, ChatModel, CompletionRequest, MessageContent, ModelError, Role};
use crate::uploads;
use crate::AppState;

const DEFAULT_HISTORY_KEY: &str = "default";
const MAX_TURNS: usize = 10;

const EDIT_KEYWORDS: &[&str] = &[
    "수정", "변경", "추가", "리팩토링", "고쳐", "fix", "implement", "만들어", "삭제", "리네임", "rename", "적용",
    "반영", "patch",
];

const CODE_KEYWORDS: &[&str] = &[
    "코드", "code", "파일", "file", "컴포넌트", "component", "수정", "변경", "추가", "리팩토링", "오류", "에러",
    "import", "export", "props", "state", "hook", "context", "route", "router", "페이지", "page",
];

const GENERAL_PROMPT: &str = "You are a friendly assistant for a live React playground. \
Answer questions about React, JavaScript and web development clearly and briefly. \
Use short code snippets only when they help.";

const ANALYZE_PROMPT: &str = "You are a senior React engineer reviewing a project. \
Explain what the code does, how the pieces relate and where problems come from. \
Write the answer as a readable report. Do not include code blocks and do not propose a full rewrite.";

const EDIT_PROMPT: &str = "You are a React engineer editing a live project. \
Return the complete new content of exactly one file in a single fenced block tagged tsx or jsx. \
When the target is not the selected file, put a line `FILEPATH: <path>` before the block. \
New files may only be created under src/pages/ or src/components/. \
Follow the existing code style and imports. Keep the explanation outside the block short.";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    General,
    CodeAnalyze,
    CodeEdit,
}

fn contains_any(text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|k| text.contains(k))
}

/// An explicit hint wins. Otherwise keywords decide: with a file selected,
/// anything that is not clearly an edit is treated as analysis.
pub fn classify(hint: Option<&str>, text: &str, has_selection: bool) -> ChatKind {
    match hint.map(str::trim) {
        Some("general") => return ChatKind::General,
        Some("code_analyze") => return ChatKind::CodeAnalyze,
        Some("code_edit") | Some("code") => return ChatKind::CodeEdit,
        _ => {}
    }
    let text = text.to_lowercase();
    if has_selection {
        if contains_any(&text, EDIT_KEYWORDS) {
            ChatKind::CodeEdit
        } else {
            ChatKind::CodeAnalyze
        }
    } else if contains_any(&text, CODE_KEYWORDS) {
        ChatKind::CodeEdit
    } else {
        ChatKind::General
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct IncomingMessage {
    pub role: String,
    pub content: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub messages: Vec<IncomingMessage>,
    /// Shortcut for a single user message.
    pub message: Option<String>,
    pub selected_file: Option<String>,
    pub file_content: Option<String>,
    #[serde(default)]
    pub attachments: Vec<String>,
    pub project_name: Option<String>,
    pub chat_type: Option<String>,
}

impl ChatRequest {
    fn question(&self) -> Option<String> {
        self.message
            .clone()
            .or_else(|| {
                self.messages
                    .iter()
                    .rev()
                    .find(|m| m.role == "user")
                    .map(|m| m.content.clone())
            })
            .filter(|q| !q.trim().is_empty())
    }
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(untagged)]
pub enum ChatReply {
    Answer {
        content: String,
    },
    #[serde(rename_all = "camelCase")]
    Job {
        processing_type: ChatKind,
        job_id: String,
    },
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEntry {
    pub role: Role,
    pub content: String,
    pub time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

/// A file as the client named it and where it lives in the project.
#[derive(Clone, Debug, PartialEq)]
struct Target {
    reported: String,
    stored: String,
}

pub struct ChatOrchestrator {
    model: Arc<dyn ChatModel>,
    store: Arc<crate::workspace::WorkspaceStore>,
    jobs: Arc<JobRegistry>,
    events: Arc<EventBus>,
    upload_dir: PathBuf,
    history: DashMap<String, Vec<ChatEntry>>,
}

fn model_failure(err: ModelError) -> AppError {
    match err {
        ModelError::MissingApiKey => AppError::internal(err.to_string()),
        other => AppError::JobExecution(other.to_string()),
    }
}

impl ChatOrchestrator {
    pub fn new(
        model: Arc<dyn ChatModel>,
        store: Arc<crate::workspace::WorkspaceStore>,
        jobs: Arc<JobRegistry>,
        events: Arc<EventBus>,
        upload_dir: PathBuf,
    ) -> Self {
        Self {
            model,
            store,
            jobs,
            events,
            upload_dir,
            history: DashMap::new(),
        }
    }

    pub fn history(&self, project: Option<&str>) -> Vec<ChatEntry> {
        self.history
            .get(project.unwrap_or(DEFAULT_HISTORY_KEY))
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    fn append(&self, project: Option<&str>, role: Role, content: &str, job_id: Option<&str>) {
        self.history
            .entry(project.unwrap_or(DEFAULT_HISTORY_KEY).to_string())
            .or_default()
            .push(ChatEntry {
                role,
                content: content.to_string(),
                time: Utc::now(),
                job_id: job_id.map(str::to_string),
            });
    }

    /// Map a client path onto the project. Bare names such as `App.tsx` that
    /// only exist under `src/` resolve there.
    fn resolve_target(&self, project: &str, path: &str) -> Target {
        let clean = path.trim().trim_start_matches("./").trim_start_matches('/').to_string();
        let under_src = format!("src/{}", clean);
        let stored = if !self.store.file_exists(project, &clean) && self.store.file_exists(project, &under_src) {
            under_src
        } else {
            clean.clone()
        };
        Target { reported: clean, stored }
    }

    pub async fn handle(self: &Arc<Self>, req: ChatRequest) -> AppResult<ChatReply> {
        let question = req
            .question()
            .ok_or_else(|| AppError::bad_request("No user message in request"))?;
        let project = req.project_name.as_deref().filter(|p| !p.is_empty());
        if let Some(p) = project {
            crate::workspace::validate_name(p)?;
        }

        let has_selection = req.selected_file.as_deref().is_some_and(|f| !f.trim().is_empty());
        let kind = classify(req.chat_type.as_deref(), &question, has_selection);
        info!(project = project.unwrap_or("-"), kind = ?kind, "Chat request");
        self.append(project, Role::User, &question, None);

        match kind {
            ChatKind::General => self.answer_general(&req, project, &question).await,
            ChatKind::CodeAnalyze => self.answer_analysis(&req, project, &question).await,
            ChatKind::CodeEdit => self.submit_edit(&req, project, question),
        }
    }

    async fn answer_general(&self, req: &ChatRequest, project: Option<&str>, question: &str) -> AppResult<ChatReply> {
        let images = uploads::image_data_urls(&self.upload_dir, &req.attachments).await;

        // Earlier turns as context; the question itself goes last, with images.
        let mut earlier = req.messages.as_slice();
        if req.message.is_none() {
            earlier = &earlier[..earlier.len().saturating_sub(1)];
        }
        let earlier = &earlier[earlier.len().saturating_sub(MAX_TURNS)..];

        let mut messages = vec![ChatMessage::system(GENERAL_PROMPT)];
        messages.extend(earlier.iter().map(|m| ChatMessage {
            role: if m.role == "assistant" { Role::Assistant } else { Role::User },
            content: MessageContent::Text(m.content.clone()),
        }));
        messages.push(ChatMessage::user_with_images(question, images));

        let content = self
            .model
            .complete(CompletionRequest {
                messages,
                temperature: Some(0.1),
                purpose: "chat",
            })
            .await
            .map_err(model_failure)?;
        self.append(project, Role::Assistant, &content, None);
        Ok(ChatReply::Answer { content })
    }

    async fn answer_analysis(&self, req: &ChatRequest, project: Option<&str>, question: &str) -> AppResult<ChatReply> {
        let mut system = ANALYZE_PROMPT.to_string();
        let target = match (project, req.selected_file.as_deref()) {
            (Some(p), Some(f)) => Some(self.resolve_target(p, f)),
            _ => None,
        };
        if let Some(file) = req.selected_file.as_deref() {
            let content = match (&req.file_content, project, &target) {
                (Some(c), _, _) => Some(c.clone()),
                (None, Some(p), Some(t)) => self.store.read_file(p, &t.stored).await.ok(),
                _ => None,
            };
            if let Some(content) = content {
                system.push_str(&format!("\n\nSelected file: {}\n{}", file, content));
            }
        }
        if let Some(p) = project {
            let ctx = ProjectContext::build(&self.store, p, question, target.as_ref().map(|t| t.stored.as_str())).await;
            system.push_str(&format!("\n\nProject overview:\n{}", ctx.render()));
        }

        let images = uploads::image_data_urls(&self.upload_dir, &req.attachments).await;
        let content = self
            .model
            .complete(CompletionRequest {
                messages: vec![ChatMessage::system(system), ChatMessage::user_with_images(question, images)],
                temperature: Some(0.2),
                purpose: "analysis",
            })
            .await
            .map_err(model_failure)?;
        self.append(project, Role::Assistant, &content, None);
        Ok(ChatReply::Answer { content })
    }

    fn submit_edit(self: &Arc<Self>, req: &ChatRequest, project: Option<&str>, question: String) -> AppResult<ChatReply> {
        let project = project
            .ok_or_else(|| AppError::precondition("projectName is required for code edits"))?
            .to_string();
        if !self.store.exists(&project) {
            return Err(AppError::precondition(format!("Project '{}' is not initialized", project)));
        }

        let input = JobInput {
            project_name: Some(project.clone()),
            message: question,
            selected_file: req.selected_file.clone(),
            file_content: req.file_content.clone(),
            attachments: req.attachments.clone(),
        };
        let this = self.clone();
        let job_input = input.clone();
        let job_id = self
            .jobs
            .submit(input, move |ctx| async move { this.run_edit(ctx, project, job_input).await });
        Ok(ChatReply::Job {
            processing_type: ChatKind::CodeEdit,
            job_id,
        })
    }

    async fn run_edit(self: Arc<Self>, ctx: JobContext, project: String, input: JobInput) -> Result<JobResult, JobError> {
        ctx.progress("analyzing project");
        let selected = input
            .selected_file
            .as_deref()
            .map(|f| self.resolve_target(&project, f));
        let current = match (&input.file_content, &selected) {
            (Some(c), _) => Some(c.clone()),
            (None, Some(t)) => self.store.read_file(&project, &t.stored).await.ok(),
            _ => None,
        };
        let context =
            ProjectContext::build(&self.store, &project, &input.message, selected.as_ref().map(|t| t.stored.as_str()))
                .await;

        let mut system = EDIT_PROMPT.to_string();
        if let (Some(t), Some(content)) = (&selected, &current) {
            system.push_str(&format!("\n\nSelected file: {}\n```\n{}\n```", t.stored, content));
        }
        system.push_str(&format!("\n\nProject overview:\n{}", context.render()));
        let images = uploads::image_data_urls(&self.upload_dir, &input.attachments).await;

        ctx.progress("generating changes");
        let reply = self
            .model
            .complete(CompletionRequest {
                messages: vec![ChatMessage::system(system), ChatMessage::user_with_images(&input.message, images)],
                temperature: Some(0.1),
                purpose: "code edit",
            })
            .await
            .map_err(|e| JobError::new(JobErrorKind::Model, e.to_string()))?;

        let edit = parse_reply(&reply);
        let content = edit
            .content
            .ok_or_else(|| JobError::new(JobErrorKind::MalformedOutput, "model reply contained no code block"))?;

        ctx.progress("applying changes");
        let target = match (edit.file_path, selected) {
            (Some(path), Some(sel)) if path == sel.stored || path == sel.reported => sel,
            (Some(path), _) => self.resolve_target(&project, &path),
            (None, Some(sel)) => sel,
            (None, None) => {
                return Err(JobError::new(
                    JobErrorKind::InvalidTarget,
                    "no target file: select a file or name one in the reply",
                ));
            }
        };

        let is_new = !self.store.file_exists(&project, &target.stored);
        if is_new {
            if !is_allowed_new_file(&target.stored) {
                return Err(JobError::new(
                    JobErrorKind::InvalidTarget,
                    format!("new files are only allowed under src/pages/ or src/components/, got {}", target.stored),
                ));
            }
            if is_page(&target.stored) {
                self.register_page(&project, &target.stored).await;
            }
        }

        self.store
            .write_file(&project, &target.stored, &content)
            .await
            .map_err(|e| JobError::new(JobErrorKind::WriteFailed, e.to_string()))?;

        self.events.publish(WorkspaceEvent::FileEdited {
            project: project.clone(),
            path: target.stored.clone(),
            job_id: Some(ctx.id().to_string()),
        });
        self.append(Some(&project), Role::Assistant, &edit.display, Some(ctx.id()));
        debug!(job = ctx.id(), project = %project, path = %target.stored, is_new, "Edit applied");

        Ok(JobResult {
            display: edit.display,
            updated_file: Some(target.reported),
            updated_content: Some(content),
        })
    }

    /// Wire a freshly created page into the app router. Best effort.
    async fn register_page(&self, project: &str, page: &str) {
        for app in ["src/App.tsx", "src/App.jsx"] {
            let Ok(source) = self.store.read_file(project, app).await else {
                continue;
            };
            if let Some(updated) = inject_route(&source, page) {
                match self.store.write_file(project, app, &updated).await {
                    Ok(_) => {
                        info!(project, page, app, "Route added for new page");
                        self.events.publish(WorkspaceEvent::FileEdited {
                            project: project.to_string(),
                            path: app.to_string(),
                            job_id: None,
                        });
                    }
                    Err(e) => warn!(project, app, error = %e, "Could not add route"),
                }
            }
            return;
        }
    }
}

// ============================================================================
// HTTP handlers
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: String,
    pub status: JobStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

impl From<JobRecord> for JobView {
    fn from(record: JobRecord) -> Self {
        let result = record.result.unwrap_or_default();
        let done = record.status == JobStatus::Done;
        Self {
            id: record.id,
            status: record.status,
            message: record.message,
            display: done.then_some(result.display),
            updated_file: result.updated_file,
            updated_content: result.updated_content,
            error: record.error,
        }
    }
}

pub async fn chat(State(state): State<Arc<AppState>>, Json(req): Json<ChatRequest>) -> AppResult<Json<ChatReply>> {
    Ok(Json(state.chat.handle(req).await?))
}

#[derive(Deserialize, Default)]
pub struct JobQuery {
    #[serde(default)]
    wait: bool,
}

pub async fn job_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<JobQuery>,
) -> AppResult<Json<JobView>> {
    let record = if query.wait {
        match poll_until_terminal(&state.jobs, &id, state.poll).await? {
            PollOutcome::Finished(r) | PollOutcome::GaveUp(r) => r,
        }
    } else {
        state
            .jobs
            .get(&id)
            .ok_or_else(|| AppError::not_found(format!("job `{}` not found", id)))?
    };
    Ok(Json(record.into()))
}

pub async fn cancel_job(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> AppResult<Json<JobView>> {
    Ok(Json(state.jobs.cancel(&id)?.into()))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    project_name: Option<String>,
}

#[derive(Serialize)]
pub struct HistoryResponse {
    messages: Vec<ChatEntry>,
}

pub async fn history(State(state): State<Arc<AppState>>, Query(query): Query<HistoryQuery>) -> Json<HistoryResponse> {
    Json(HistoryResponse {
        messages: state.chat.history(query.project_name.as_deref()),
    })
}
