//! # Background Job Registry
//!
//! Server-side record of every code-edit job, independent of whichever client
//! happens to be polling it.
//!
//! ```text
//! Queued -> Running -> Done
//!                   -> Errored
//!        -> Cancelled (from Queued or Running)
//! ```
//!
//! Transitions only move forward: once a job is terminal, later writes are
//! ignored. Each job gets exactly one worker attempt. The worker future runs in
//! its own task so a panic, a timeout or a cancel all land in a terminal state
//! instead of vanishing. Terminal jobs stay readable for the retention window,
//! after which the reaper drops them and lookups answer not-found.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::{AppError, AppResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Errored,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Errored | Self::Cancelled)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    Model,
    Timeout,
    MalformedOutput,
    InvalidTarget,
    WriteFailed,
    Panicked,
    Cancelled,
}

#[derive(Clone, Debug, Serialize, thiserror::Error)]
#[error("{message}")]
pub struct JobError {
    pub kind: JobErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new<S: Into<String>>(kind: JobErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// What the job was asked to do.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInput {
    pub project_name: Option<String>,
    pub message: String,
    pub selected_file: Option<String>,
    pub file_content: Option<String>,
    #[serde(default)]
    pub attachments: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub display: String,
    pub updated_file: Option<String>,
    pub updated_content: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    pub status: JobStatus,
    /// Human-readable progress note.
    pub message: String,
    pub input: JobInput,
    pub result: Option<JobResult>,
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

struct JobEntry {
    record: JobRecord,
    abort: Option<AbortHandle>,
    finished: Option<Instant>,
}

pub struct JobRegistry {
    jobs: DashMap<String, JobEntry>,
    timeout: Duration,
    retention: Duration,
}

/// Handed to the worker so it can report progress.
#[derive(Clone)]
pub struct JobContext {
    id: String,
    registry: Arc<JobRegistry>,
}

impl JobContext {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn progress(&self, message: &str) {
        if let Some(mut entry) = self.registry.jobs.get_mut(&self.id) {
            if entry.record.status == JobStatus::Running {
                entry.record.message = message.to_string();
            }
        }
    }
}

impl JobRegistry {
    pub fn new(timeout: Duration, retention: Duration) -> Self {
        Self {
            jobs: DashMap::new(),
            timeout,
            retention,
        }
    }

    /// Record a new job and schedule `work` for it. Never waits on the work.
    pub fn submit<F, Fut>(self: &Arc<Self>, input: JobInput, work: F) -> String
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<JobResult, JobError>> + Send + 'static,
    {
        let id = uuid::Uuid::new_v4().to_string();
        let record = JobRecord {
            id: id.clone(),
            status: JobStatus::Queued,
            message: "queued".to_string(),
            input,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        self.jobs.insert(
            id.clone(),
            JobEntry {
                record,
                abort: None,
                finished: None,
            },
        );
        info!(job = %id, "Job queued");

        let registry = self.clone();
        let job_id = id.clone();
        tokio::spawn(async move {
            registry.run(job_id, work).await;
        });
        id
    }

    async fn run<F, Fut>(self: Arc<Self>, id: String, work: F)
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<JobResult, JobError>> + Send + 'static,
    {
        let ctx = JobContext {
            id: id.clone(),
            registry: self.clone(),
        };
        let worker = {
            let Some(mut entry) = self.jobs.get_mut(&id) else {
                return;
            };
            if entry.record.status.is_terminal() {
                debug!(job = %id, "Job cancelled before it started");
                return;
            }
            entry.record.status = JobStatus::Running;
            entry.record.started_at = Some(Utc::now());
            entry.record.message = "running".to_string();
            let worker = tokio::spawn(work(ctx));
            entry.abort = Some(worker.abort_handle());
            worker
        };
        debug!(job = %id, "Job running");

        let abort = worker.abort_handle();
        let outcome = match tokio::time::timeout(self.timeout, worker).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) if e.is_panic() => Err(JobError::new(JobErrorKind::Panicked, "worker panicked")),
            Ok(Err(_)) => Err(JobError::new(JobErrorKind::Cancelled, "cancelled")),
            Err(_) => {
                abort.abort();
                Err(JobError::new(
                    JobErrorKind::Timeout,
                    format!("timed out after {}s", self.timeout.as_secs()),
                ))
            }
        };
        self.finish(&id, outcome);
    }

    fn finish(&self, id: &str, outcome: Result<JobResult, JobError>) {
        let Some(mut entry) = self.jobs.get_mut(id) else {
            return;
        };
        if entry.record.status.is_terminal() {
            return;
        }
        match outcome {
            Ok(result) => {
                info!(job = %id, file = ?result.updated_file, "Job done");
                entry.record.status = JobStatus::Done;
                entry.record.message = "done".to_string();
                entry.record.result = Some(result);
            }
            Err(err) => {
                warn!(job = %id, kind = ?err.kind, "Job failed: {}", err.message);
                entry.record.status = JobStatus::Errored;
                entry.record.message = "failed".to_string();
                entry.record.error = Some(err);
            }
        }
        entry.record.completed_at = Some(Utc::now());
        entry.finished = Some(Instant::now());
        entry.abort = None;
    }

    pub fn get(&self, id: &str) -> Option<JobRecord> {
        self.jobs.get(id).map(|e| e.record.clone())
    }

    /// Abort a job that has not finished yet. Terminal jobs are returned as is.
    pub fn cancel(&self, id: &str) -> AppResult<JobRecord> {
        let mut entry = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| AppError::not_found(format!("job `{}` not found", id)))?;
        if !entry.record.status.is_terminal() {
            if let Some(abort) = entry.abort.take() {
                abort.abort();
            }
            entry.record.status = JobStatus::Cancelled;
            entry.record.message = "cancelled".to_string();
            entry.record.error = Some(JobError::new(JobErrorKind::Cancelled, "cancelled by request"));
            entry.record.completed_at = Some(Utc::now());
            entry.finished = Some(Instant::now());
            info!(job = %id, "Job cancelled");
        }
        Ok(entry.record.clone())
    }

    pub fn active_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|e| !e.record.status.is_terminal())
            .count()
    }

    /// Drop terminal jobs older than the retention window.
    pub fn reap(&self) -> usize {
        let before = self.jobs.len();
        let retention = self.retention;
        self.jobs
            .retain(|_, e| e.finished.map_or(true, |at| at.elapsed() < retention));
        let reaped = before.saturating_sub(self.jobs.len());
        if reaped > 0 {
            debug!(reaped, "Reaped finished jobs");
        }
        reaped
    }

    pub fn spawn_reaper(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                registry.reap();
            }
        })
    }
}

/// Bounded client-side polling: `max_attempts` reads, `interval` apart.
#[derive(Clone, Copy, Debug)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            interval: settings.poll_interval,
            max_attempts: settings.poll_max_attempts.max(1),
        }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_attempts: 120,
        }
    }
}

#[derive(Debug)]
pub enum PollOutcome {
    Finished(JobRecord),
    /// Attempt budget used up; the job keeps running server-side.
    GaveUp(JobRecord),
}

pub async fn poll_until_terminal(registry: &JobRegistry, id: &str, policy: PollPolicy) -> AppResult<PollOutcome> {
    let mut attempt = 1;
    loop {
        let record = registry
            .get(id)
            .ok_or_else(|| AppError::not_found(format!("job `{}` not found", id)))?;
        if record.status.is_terminal() {
            return Ok(PollOutcome::Finished(record));
        }
        if attempt >= policy.max_attempts {
            return Ok(PollOutcome::GaveUp(record));
        }
        attempt += 1;
        tokio::time::sleep(policy.interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn registry(timeout: Duration, retention: Duration) -> Arc<JobRegistry> {
        Arc::new(JobRegistry::new(timeout, retention))
    }

    fn input(message: &str) -> JobInput {
        JobInput {
            message: message.to_string(),
            selected_file: Some("App.tsx".to_string()),
            ..JobInput::default()
        }
    }

    fn fast() -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(10),
            max_attempts: 500,
        }
    }

    #[tokio::test]
    async fn test_submit_returns_immediately() {
        let jobs = registry(Duration::from_secs(60), Duration::from_secs(60));
        let started = Instant::now();
        let id = jobs.submit(input("slow"), |_| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(JobResult::default())
        });
        assert!(started.elapsed() < Duration::from_millis(100));

        let record = jobs.get(&id).unwrap();
        assert!(matches!(record.status, JobStatus::Queued | JobStatus::Running));
        assert_eq!(record.input.message, "slow");
        assert_eq!(jobs.active_count(), 1);
        jobs.cancel(&id).unwrap();
    }

    #[tokio::test]
    async fn test_done_result_is_stable() {
        let jobs = registry(Duration::from_secs(60), Duration::from_secs(60));
        let id = jobs.submit(input("add a button"), |ctx| async move {
            ctx.progress("generating changes");
            Ok(JobResult {
                display: "Added a button".to_string(),
                updated_file: Some("App.tsx".to_string()),
                updated_content: Some("<button>Click</button>".to_string()),
            })
        });

        let PollOutcome::Finished(first) = poll_until_terminal(&jobs, &id, fast()).await.unwrap() else {
            panic!("job did not finish");
        };
        assert_eq!(first.status, JobStatus::Done);
        assert_eq!(first.message, "done");
        let result = first.result.clone().unwrap();
        assert_eq!(result.updated_file.as_deref(), Some("App.tsx"));
        assert!(result.updated_content.unwrap().contains("<button>"));
        assert!(first.started_at.is_some() && first.completed_at.is_some());

        let again = jobs.get(&id).unwrap();
        assert_eq!(again.status, JobStatus::Done);
        assert_eq!(again.completed_at, first.completed_at);
        assert_eq!(jobs.active_count(), 0);
    }

    #[tokio::test]
    async fn test_worker_error_is_captured() {
        let jobs = registry(Duration::from_secs(60), Duration::from_secs(60));
        let id = jobs.submit(input("x"), |_| async {
            Err(JobError::new(JobErrorKind::MalformedOutput, "no code block in reply"))
        });
        let PollOutcome::Finished(record) = poll_until_terminal(&jobs, &id, fast()).await.unwrap() else {
            panic!("job did not finish");
        };
        assert_eq!(record.status, JobStatus::Errored);
        let err = record.error.unwrap();
        assert_eq!(err.kind, JobErrorKind::MalformedOutput);
        assert_eq!(err.message, "no code block in reply");
    }

    #[tokio::test]
    async fn test_panic_becomes_errored() {
        let jobs = registry(Duration::from_secs(60), Duration::from_secs(60));
        let id = jobs.submit(input("x"), |_| async {
            if true {
                panic!("boom");
            }
            Ok(JobResult::default())
        });
        let PollOutcome::Finished(record) = poll_until_terminal(&jobs, &id, fast()).await.unwrap() else {
            panic!("job did not finish");
        };
        assert_eq!(record.status, JobStatus::Errored);
        assert_eq!(record.error.unwrap().kind, JobErrorKind::Panicked);
    }

    #[tokio::test]
    async fn test_timeout_becomes_errored() {
        let jobs = registry(Duration::from_millis(100), Duration::from_secs(60));
        let id = jobs.submit(input("x"), |_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(JobResult::default())
        });
        let PollOutcome::Finished(record) = poll_until_terminal(&jobs, &id, fast()).await.unwrap() else {
            panic!("job did not finish");
        };
        assert_eq!(record.status, JobStatus::Errored);
        assert_eq!(record.error.unwrap().kind, JobErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_cancel_stops_work_and_is_final() {
        let jobs = registry(Duration::from_secs(60), Duration::from_secs(60));
        let touched = Arc::new(AtomicBool::new(false));
        let flag = touched.clone();
        let id = jobs.submit(input("x"), move |_| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(JobResult::default())
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let record = jobs.cancel(&id).unwrap();
        assert_eq!(record.status, JobStatus::Cancelled);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!touched.load(Ordering::SeqCst));
        assert_eq!(jobs.get(&id).unwrap().status, JobStatus::Cancelled);
        // cancelling again is harmless
        assert_eq!(jobs.cancel(&id).unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_unknown_and_reaped_ids_are_not_found() {
        let jobs = registry(Duration::from_secs(60), Duration::ZERO);
        let err = poll_until_terminal(&jobs, "nope", fast()).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
        assert!(jobs.cancel("nope").is_err());

        let id = jobs.submit(input("x"), |_| async { Ok(JobResult::default()) });
        poll_until_terminal(&jobs, &id, fast()).await.unwrap();
        assert_eq!(jobs.reap(), 1);
        assert!(jobs.get(&id).is_none());
    }

    #[tokio::test]
    async fn test_reap_keeps_running_and_recent_jobs() {
        let jobs = registry(Duration::from_secs(60), Duration::from_secs(60));
        let done = jobs.submit(input("x"), |_| async { Ok(JobResult::default()) });
        let running = jobs.submit(input("y"), |_| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(JobResult::default())
        });
        poll_until_terminal(&jobs, &done, fast()).await.unwrap();
        assert_eq!(jobs.reap(), 0);
        assert!(jobs.get(&done).is_some());
        assert!(jobs.get(&running).is_some());
        jobs.cancel(&running).unwrap();
    }

    #[tokio::test]
    async fn test_poll_gives_up_but_late_poll_sees_result() {
        let jobs = registry(Duration::from_secs(60), Duration::from_secs(60));
        let id = jobs.submit(input("x"), |_| async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(JobResult {
                display: "late".to_string(),
                ..JobResult::default()
            })
        });

        let policy = PollPolicy {
            interval: Duration::from_millis(10),
            max_attempts: 3,
        };
        match poll_until_terminal(&jobs, &id, policy).await.unwrap() {
            PollOutcome::GaveUp(record) => assert!(!record.status.is_terminal()),
            PollOutcome::Finished(_) => panic!("should still be running"),
        }

        let PollOutcome::Finished(record) = poll_until_terminal(&jobs, &id, fast()).await.unwrap() else {
            panic!("job did not finish");
        };
        assert_eq!(record.result.unwrap().display, "late");
    }

    #[tokio::test]
    async fn test_progress_is_visible_while_running() {
        let jobs = registry(Duration::from_secs(60), Duration::from_secs(60));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let id = jobs.submit(input("x"), |ctx| async move {
            ctx.progress("analyzing project");
            let _ = rx.await;
            Ok(JobResult::default())
        });

        let mut seen = String::new();
        for _ in 0..100 {
            seen = jobs.get(&id).unwrap().message;
            if seen == "analyzing project" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(seen, "analyzing project");
        tx.send(()).unwrap();
        poll_until_terminal(&jobs, &id, fast()).await.unwrap();
        assert_eq!(jobs.get(&id).unwrap().message, "done");
    }
}
