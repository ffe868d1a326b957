//! # Process Lifecycle Manager
//!
//! Owns every dev server process, one slot per project:
//!
//! ```text
//! Uninitialized -> Installing -> Ready -> Starting -> Running -> Stopping -> Stopped
//!                      |                     |           |
//!                      +------> Errored <----+-----------+
//! ```
//!
//! Each slot carries an async `ops` lock that serializes `initialize`, `start`,
//! `stop` and `delete` for that project only, plus a small sync mutex holding
//! the current [`ProjectRuntime`] so status reads never wait behind an install.
//! Nothing is shared across projects except the port reservations.
//!
//! `delete` retires its slot before releasing `ops`. Anyone who queued on a
//! retired slot starts over with the slot that replaced it, so no process is
//! ever spawned from a slot the map no longer holds.
//!
//! A spawned process is watched by a supervisor task that owns the `Child`.
//! Every spawn bumps the slot's generation; late notifications from an older
//! process are ignored.

use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, watch, Notify, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::config::{CommandSpec, Settings};
use crate::error::{AppError, AppResult};
use crate::install::{dependencies_installed, Installer};
use crate::readiness::{Health, OutputPatternProbe, ReadinessProbe};
use crate::relay::{LogRelay, LogStream};
use crate::workspace::{validate_name, ProjectSeed, WorkspaceStore};

const TAIL_LINES: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeState {
    Uninitialized,
    Installing,
    Ready,
    Starting,
    Running,
    Stopping,
    Stopped,
    Errored,
}

impl RuntimeState {
    pub fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

/// Point-in-time view of one project's runtime.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStatus {
    pub project: String,
    pub state: RuntimeState,
    pub preview_url: Option<String>,
    pub port: Option<u16>,
    pub dependencies_installed: bool,
    pub health: Health,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Clone, Copy, Debug)]
struct Exit {
    code: Option<i32>,
}

struct ProjectRuntime {
    state: RuntimeState,
    port: Option<u16>,
    preview_url: Option<String>,
    deps_installed: bool,
    health: Health,
    pid: Option<u32>,
    started_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    generation: u64,
    exit: Option<watch::Receiver<Option<Exit>>>,
    kill: Option<Arc<Notify>>,
}

impl ProjectRuntime {
    fn new(state: RuntimeState, deps_installed: bool) -> Self {
        Self {
            state,
            port: None,
            preview_url: None,
            deps_installed,
            health: Health::Unknown,
            pid: None,
            started_at: None,
            last_error: None,
            generation: 0,
            exit: None,
            kill: None,
        }
    }

    fn snapshot(&self, project: &str) -> ProjectStatus {
        ProjectStatus {
            project: project.to_string(),
            state: self.state,
            preview_url: if self.state.is_live() {
                self.preview_url.clone()
            } else {
                None
            },
            port: self.port,
            dependencies_installed: self.deps_installed,
            health: self.health,
            pid: self.pid,
            started_at: self.started_at,
            last_error: self.last_error.clone(),
        }
    }

    fn clear_process(&mut self) {
        self.pid = None;
        self.exit = None;
        self.kill = None;
        self.health = Health::Unknown;
        self.started_at = None;
    }
}

struct ProjectSlot {
    ops: Arc<tokio::sync::Mutex<()>>,
    runtime: Mutex<ProjectRuntime>,
    retired: AtomicBool,
}

impl ProjectSlot {
    fn lock(&self) -> MutexGuard<'_, ProjectRuntime> {
        self.runtime.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }
}

/// Shared pieces a process's background tasks report back through.
#[derive(Clone)]
struct Supervision {
    project: String,
    slot: Arc<ProjectSlot>,
    generation: u64,
    changes: broadcast::Sender<ProjectStatus>,
    relay: Arc<LogRelay>,
    probe: Arc<dyn ReadinessProbe>,
    health: Arc<watch::Sender<Health>>,
    tail: Arc<Mutex<VecDeque<String>>>,
}

impl Supervision {
    fn on_line(&self, stream: LogStream, line: &str) {
        self.relay.publish(&self.project, stream, line);
        {
            let mut tail = self.tail.lock().unwrap_or_else(|e| e.into_inner());
            tail.push_back(line.to_string());
            if tail.len() > TAIL_LINES {
                tail.pop_front();
            }
        }

        let Some(signal) = self.probe.observe(line) else {
            return;
        };
        self.health.send_replace(signal);
        let snapshot = {
            let mut rt = self.slot.lock();
            if rt.generation != self.generation || rt.health == signal {
                return;
            }
            rt.health = signal;
            rt.snapshot(&self.project)
        };
        debug!(project = %self.project, health = ?signal, "Health changed");
        let _ = self.changes.send(snapshot);
    }

    fn on_exit(&self, exit: Exit) {
        let code = exit
            .code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let tail = {
            let tail = self.tail.lock().unwrap_or_else(|e| e.into_inner());
            tail.iter().cloned().collect::<Vec<_>>().join("\n")
        };

        let snapshot = {
            let mut rt = self.slot.lock();
            if rt.generation != self.generation {
                return;
            }
            rt.pid = None;
            match rt.state {
                RuntimeState::Starting => {
                    error!(project = %self.project, code = %code, "Dev server exited before becoming ready");
                    rt.state = RuntimeState::Errored;
                    rt.last_error = Some(format!("dev server exited with code {} before becoming ready: {}", code, tail));
                }
                RuntimeState::Running => {
                    warn!(project = %self.project, code = %code, "Dev server crashed");
                    rt.state = RuntimeState::Errored;
                    rt.last_error = Some(
                        AppError::ProcessCrashed(format!("dev server exited with code {}: {}", code, tail)).to_string(),
                    );
                }
                _ => {}
            }
            rt.snapshot(&self.project)
        };
        self.relay.publish(
            &self.project,
            LogStream::System,
            &format!("dev server exited with code {}", code),
        );
        let _ = self.changes.send(snapshot);
    }
}

fn pump<R>(reader: R, stream: LogStream, sup: Supervision) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            sup.on_line(stream, &line);
        }
    })
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
        debug!(pid, "killpg {:?} failed: {}", signal, e);
    }
}

#[cfg(unix)]
fn terminate_group(pid: u32) {
    signal_group(pid, nix::sys::signal::Signal::SIGTERM);
}

#[cfg(unix)]
pub(crate) fn kill_group(pid: u32) {
    signal_group(pid, nix::sys::signal::Signal::SIGKILL);
}

#[cfg(not(unix))]
fn terminate_group(_pid: u32) {}

#[cfg(not(unix))]
pub(crate) fn kill_group(_pid: u32) {}

/// Preview ports handed out from a fixed range. A port stays with its project
/// until the project is deleted.
struct PortAllocator {
    range: (u16, u16),
    reserved: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    fn new(range: (u16, u16)) -> Self {
        Self {
            range,
            reserved: Mutex::new(HashSet::new()),
        }
    }

    fn allocate(&self) -> AppResult<u16> {
        let mut reserved = self.reserved.lock().unwrap_or_else(|e| e.into_inner());
        for port in self.range.0..=self.range.1 {
            if reserved.contains(&port) {
                continue;
            }
            if std::net::TcpListener::bind(("127.0.0.1", port)).is_ok() {
                reserved.insert(port);
                return Ok(port);
            }
        }
        Err(AppError::internal(format!(
            "no free preview port in {}-{}",
            self.range.0, self.range.1
        )))
    }

    fn release(&self, port: u16) {
        self.reserved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&port);
    }
}

pub struct ProcessManager {
    store: Arc<WorkspaceStore>,
    relay: Arc<LogRelay>,
    installer: Installer,
    probe: Arc<dyn ReadinessProbe>,
    start_command: CommandSpec,
    stop_timeout: Duration,
    preview_host: String,
    ports: PortAllocator,
    slots: DashMap<String, Arc<ProjectSlot>>,
    changes: broadcast::Sender<ProjectStatus>,
    closing: AtomicBool,
}

impl ProcessManager {
    pub fn new(settings: &Settings, store: Arc<WorkspaceStore>, relay: Arc<LogRelay>) -> Self {
        let probe = OutputPatternProbe::new(&settings.ready_pattern, &settings.fail_pattern, settings.ready_grace);
        let (changes, _) = broadcast::channel(256);
        Self {
            installer: Installer::new(settings.install_command.clone(), settings.install_timeout, relay.clone()),
            store,
            relay,
            probe: Arc::new(probe),
            start_command: settings.start_command.clone(),
            stop_timeout: settings.stop_timeout,
            preview_host: settings.preview_host.clone(),
            ports: PortAllocator::new(settings.preview_ports),
            slots: DashMap::new(),
            changes,
            closing: AtomicBool::new(false),
        }
    }

    /// Swap the readiness heuristic.
    pub fn with_probe(mut self, probe: Arc<dyn ReadinessProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Status changes for every project, as they happen.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<ProjectStatus> {
        self.changes.subscribe()
    }

    fn slot(&self, project: &str) -> Arc<ProjectSlot> {
        if let Some(slot) = self.slots.get(project) {
            return slot.clone();
        }
        self.slots
            .entry(project.to_string())
            .or_insert_with(|| {
                let runtime = match self.store.project_dir(project) {
                    Ok(dir) if self.store.exists(project) => {
                        ProjectRuntime::new(RuntimeState::Stopped, dependencies_installed(&dir))
                    }
                    _ => ProjectRuntime::new(RuntimeState::Uninitialized, false),
                };
                Arc::new(ProjectSlot {
                    ops: Arc::new(tokio::sync::Mutex::new(())),
                    runtime: Mutex::new(runtime),
                    retired: AtomicBool::new(false),
                })
            })
            .clone()
    }

    /// The project's live slot with its ops lock held.
    async fn acquire(&self, project: &str) -> (Arc<ProjectSlot>, OwnedMutexGuard<()>) {
        loop {
            let slot = self.slot(project);
            let ops = slot.ops.clone().lock_owned().await;
            if !slot.is_retired() {
                return (slot, ops);
            }
        }
    }

    /// Like [`Self::acquire`], but never creates a slot.
    async fn acquire_existing(&self, project: &str) -> Option<(Arc<ProjectSlot>, OwnedMutexGuard<()>)> {
        loop {
            let slot = self.slots.get(project).map(|s| s.clone())?;
            let ops = slot.ops.clone().lock_owned().await;
            if !slot.is_retired() {
                return Some((slot, ops));
            }
        }
    }

    fn ensure_open(&self) -> AppResult<()> {
        if self.closing.load(Ordering::Acquire) {
            return Err(AppError::precondition("server is shutting down"));
        }
        Ok(())
    }

    fn ensure_on_disk(&self, project: &str) -> AppResult<()> {
        if self.store.exists(project) {
            Ok(())
        } else {
            Err(AppError::precondition(format!(
                "project `{}` is not initialized",
                project
            )))
        }
    }

    fn update<F>(&self, project: &str, slot: &ProjectSlot, f: F) -> ProjectStatus
    where
        F: FnOnce(&mut ProjectRuntime),
    {
        let snapshot = {
            let mut rt = slot.lock();
            f(&mut rt);
            rt.snapshot(project)
        };
        let _ = self.changes.send(snapshot.clone());
        snapshot
    }

    /// (Re)create the project on disk and install its dependencies.
    /// Any running process is stopped first; concurrent calls queue up.
    pub async fn initialize(&self, project: &str, seed: &ProjectSeed) -> AppResult<ProjectStatus> {
        validate_name(project)?;
        self.ensure_open()?;
        let (slot, _ops) = self.acquire(project).await;
        self.ensure_open()?;

        self.stop_locked(project, &slot).await;
        self.update(project, &slot, |rt| {
            rt.state = RuntimeState::Installing;
            rt.deps_installed = false;
            rt.last_error = None;
            rt.clear_process();
        });
        info!(project, "Initializing project");

        let dir = match self.store.create(project, seed).await {
            Ok(dir) => dir,
            Err(e) => {
                self.fail(project, &slot, &e);
                return Err(e);
            }
        };
        if let Err(e) = self.installer.install(project, &dir).await {
            self.fail(project, &slot, &e);
            return Err(e);
        }
        self.install_extras(project, &dir).await;

        Ok(self.update(project, &slot, |rt| {
            rt.state = RuntimeState::Ready;
            rt.deps_installed = true;
        }))
    }

    fn fail(&self, project: &str, slot: &ProjectSlot, err: &AppError) {
        warn!(project, kind = err.kind(), "{}", err);
        self.update(project, slot, |rt| {
            rt.state = RuntimeState::Errored;
            rt.last_error = Some(err.to_string());
        });
    }

    async fn install_extras(&self, project: &str, dir: &Path) {
        let uses_typescript = self.store.uses_typescript(project);
        if uses_typescript {
            if let Err(e) = self.store.ensure_tsconfig(project).await {
                warn!(project, "Could not write tsconfig.json: {}", e);
            }
        }
        if let Err(e) = self.installer.ensure_extra_packages(project, dir, uses_typescript).await {
            warn!(project, "Extra package install failed: {}", e);
            self.relay.publish(project, LogStream::System, &e.to_string());
        }
    }

    /// Start the dev server and wait until it looks ready.
    ///
    /// Returns the preview URL. A second call while the server is starting or
    /// running returns the same URL without spawning anything.
    pub async fn start(&self, project: &str) -> AppResult<String> {
        validate_name(project)?;
        self.ensure_open()?;
        self.ensure_on_disk(project)?;
        let (slot, ops) = self.acquire(project).await;
        // Either may have changed while queued behind a delete or shutdown.
        self.ensure_open()?;
        self.ensure_on_disk(project)?;

        let (state, deps_installed, url) = {
            let rt = slot.lock();
            (rt.state, rt.deps_installed, rt.preview_url.clone())
        };
        match state {
            RuntimeState::Starting | RuntimeState::Running => {
                return url.ok_or_else(|| AppError::internal("live project has no preview url"));
            }
            RuntimeState::Ready
            | RuntimeState::Stopped
            | RuntimeState::Errored
            | RuntimeState::Uninitialized => {}
            RuntimeState::Installing | RuntimeState::Stopping => {
                return Err(AppError::precondition(format!(
                    "project `{}` is busy ({:?})",
                    project, state
                )));
            }
        }

        let dir = self.store.project_dir(project)?;
        if !deps_installed || !dependencies_installed(&dir) {
            self.update(project, &slot, |rt| rt.state = RuntimeState::Installing);
            if let Err(e) = self.installer.install(project, &dir).await {
                self.fail(project, &slot, &e);
                return Err(e);
            }
            self.update(project, &slot, |rt| {
                rt.state = RuntimeState::Ready;
                rt.deps_installed = true;
            });
        }
        self.install_extras(project, &dir).await;

        let assigned = slot.lock().port;
        let port = match assigned {
            Some(port) => port,
            None => {
                let port = self.ports.allocate()?;
                let mut rt = slot.lock();
                rt.port = Some(port);
                rt.preview_url = Some(format!("http://{}:{}/", self.preview_host, port));
                port
            }
        };

        let (mut health_rx, mut exit_rx, generation) = self.spawn(project, &slot, &dir, port)?;
        // Readiness is awaited without the ops lock so `stop` can interrupt it.
        drop(ops);

        let grace = tokio::time::sleep(self.probe.grace());
        tokio::select! {
            _ = health_rx.wait_for(|h| *h != Health::Unknown) => {}
            _ = exit_rx.wait_for(|e| e.is_some()) => {}
            _ = grace => debug!(project, "Grace period elapsed without a readiness signal"),
        }

        let snapshot = {
            let mut rt = slot.lock();
            if rt.generation != generation {
                return Err(AppError::precondition("dev server was restarted while starting"));
            }
            match rt.state {
                RuntimeState::Starting => {
                    rt.state = RuntimeState::Running;
                    rt.started_at = Some(Utc::now());
                    rt.snapshot(project)
                }
                RuntimeState::Errored => {
                    return Err(AppError::ProcessSpawn(
                        rt.last_error.clone().unwrap_or_else(|| "dev server exited".to_string()),
                    ));
                }
                RuntimeState::Running => rt.snapshot(project),
                _ => {
                    return Err(AppError::precondition("dev server was stopped before it became ready"));
                }
            }
        };
        info!(project, port, url = ?snapshot.preview_url, "Dev server running");
        let _ = self.changes.send(snapshot.clone());
        snapshot
            .preview_url
            .ok_or_else(|| AppError::internal("running project has no preview url"))
    }

    /// Spawn the dev server in its own process group and attach the
    /// supervisor. Leaves the slot in `Starting`.
    fn spawn(
        &self,
        project: &str,
        slot: &Arc<ProjectSlot>,
        dir: &Path,
        port: u16,
    ) -> AppResult<(watch::Receiver<Health>, watch::Receiver<Option<Exit>>, u64)> {
        let command_line = self.start_command.display();
        let mut command = Command::new(&self.start_command.program);
        command
            .args(&self.start_command.args)
            .current_dir(dir)
            .env("PORT", port.to_string())
            .env("BROWSER", "none")
            .env("CI", "true")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let err = AppError::ProcessSpawn(format!("could not run `{}`: {}", command_line, e));
                self.fail(project, slot, &err);
                return Err(err);
            }
        };
        let pid = child.id();
        let (health_tx, health_rx) = watch::channel(Health::Unknown);
        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = Arc::new(Notify::new());

        let mut generation = 0;
        self.update(project, slot, |rt| {
            rt.generation += 1;
            generation = rt.generation;
            rt.state = RuntimeState::Starting;
            rt.pid = pid;
            rt.health = Health::Unknown;
            rt.last_error = None;
            rt.started_at = None;
            rt.exit = Some(exit_rx.clone());
            rt.kill = Some(kill.clone());
        });

        let sup = Supervision {
            project: project.to_string(),
            slot: slot.clone(),
            generation,
            changes: self.changes.clone(),
            relay: self.relay.clone(),
            probe: self.probe.clone(),
            health: Arc::new(health_tx),
            tail: Arc::new(Mutex::new(VecDeque::new())),
        };
        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(pump(stdout, LogStream::Stdout, sup.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(pump(stderr, LogStream::Stderr, sup.clone()));
        }

        tokio::spawn(async move {
            let finished = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill.notified() => None,
            };
            let status = match finished {
                Some(status) => status,
                None => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            for handle in pumps {
                let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
            }
            let exit = Exit {
                code: status.ok().and_then(|s| s.code()),
            };
            sup.on_exit(exit);
            exit_tx.send_replace(Some(exit));
        });

        info!(project, pid = ?pid, port, command = %command_line, "Dev server spawned");
        self.relay
            .publish(project, LogStream::System, &format!("$ {} (port {})", command_line, port));
        Ok((health_rx, exit_rx, generation))
    }

    /// Stop the dev server. A no-op unless it is starting or running.
    pub async fn stop(&self, project: &str) -> AppResult<ProjectStatus> {
        validate_name(project)?;
        let Some((slot, _ops)) = self.acquire_existing(project).await else {
            return self.status(project);
        };
        self.stop_locked(project, &slot).await;
        let snapshot = slot.lock().snapshot(project);
        Ok(snapshot)
    }

    async fn stop_locked(&self, project: &str, slot: &ProjectSlot) {
        let (pid, exit, kill) = {
            let mut rt = slot.lock();
            if !rt.state.is_live() {
                return;
            }
            rt.state = RuntimeState::Stopping;
            let _ = self.changes.send(rt.snapshot(project));
            (rt.pid, rt.exit.clone(), rt.kill.clone())
        };
        info!(project, pid = ?pid, "Stopping dev server");

        if let Some(mut exit) = exit {
            if let Some(pid) = pid {
                terminate_group(pid);
            }
            let timed_out = tokio::time::timeout(self.stop_timeout, exit.wait_for(|e| e.is_some()))
                .await
                .is_err();
            if timed_out {
                warn!(project, "Dev server ignored SIGTERM, killing");
                if let Some(pid) = pid {
                    kill_group(pid);
                }
                if let Some(kill) = kill {
                    kill.notify_one();
                }
                let _ = tokio::time::timeout(Duration::from_secs(5), exit.wait_for(|e| e.is_some())).await;
            }
        }

        self.update(project, slot, |rt| {
            rt.state = RuntimeState::Stopped;
            rt.clear_process();
        });
        self.relay.publish(project, LogStream::System, "dev server stopped");
    }

    pub fn status(&self, project: &str) -> AppResult<ProjectStatus> {
        validate_name(project)?;
        if let Some(slot) = self.slots.get(project).map(|s| s.clone()) {
            let snapshot = slot.lock().snapshot(project);
            return Ok(snapshot);
        }
        if self.store.exists(project) {
            return Ok(self.slot(project).lock().snapshot(project));
        }
        Ok(ProjectRuntime::new(RuntimeState::Uninitialized, false).snapshot(project))
    }

    /// Every known project: those with a slot plus those found on disk.
    pub fn list(&self) -> Vec<ProjectStatus> {
        let mut names: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        for name in self.store.list_projects() {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names.sort();
        names
            .into_iter()
            .filter_map(|name| self.status(&name).ok())
            .filter(|s| s.state != RuntimeState::Uninitialized || self.store.exists(&s.project))
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|e| e.value().lock().state.is_live())
            .count()
    }

    /// Stop the project, free its port and forget it. With `remove_files` the
    /// project directory goes too.
    pub async fn delete(&self, project: &str, remove_files: bool) -> AppResult<()> {
        validate_name(project)?;
        let not_found = || AppError::not_found(format!("project `{}` not found", project));
        if !self.slots.contains_key(project) && !self.store.exists(project) {
            return Err(not_found());
        }

        let (slot, _ops) = self.acquire(project).await;
        let known = slot.lock().state != RuntimeState::Uninitialized;
        let found = known || self.store.exists(project);

        self.stop_locked(project, &slot).await;
        let port = slot.lock().port.take();
        if let Some(port) = port {
            self.ports.release(port);
        }
        let removed = if found && remove_files {
            self.store.destroy(project).await
        } else {
            Ok(())
        };

        // Retire under `ops` so queued callers move on to a fresh slot.
        slot.retired.store(true, Ordering::Release);
        self.slots.remove_if(project, |_, current| Arc::ptr_eq(current, &slot));
        if !found {
            return Err(not_found());
        }
        self.relay.remove(project);
        let _ = self
            .changes
            .send(ProjectRuntime::new(RuntimeState::Uninitialized, false).snapshot(project));
        removed?;
        info!(project, remove_files, "Project deleted");
        Ok(())
    }

    /// Terminate every owned process and refuse new work. Called once on
    /// server shutdown; in-flight installs are aborted rather than awaited.
    pub async fn shutdown_all(&self) {
        self.closing.store(true, Ordering::Release);
        self.installer.cancel_all();
        let slots: Vec<(String, Arc<ProjectSlot>)> = self
            .slots
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let stops = slots.iter().map(|(name, slot)| async move {
            let _ops = slot.ops.lock().await;
            if !slot.is_retired() {
                self.stop_locked(name, slot).await;
            }
        });
        futures::future::join_all(stops).await;
        info!("All dev servers stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string(), "sh".to_string()],
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        manager: ProcessManager,
        relay: Arc<LogRelay>,
    }

    fn harness(start_script: &str) -> Harness {
        harness_with("mkdir -p node_modules", start_script)
    }

    fn harness_with(install_script: &str, start_script: &str) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            workspace_dir: dir.path().to_path_buf(),
            preview_host: "127.0.0.1".to_string(),
            preview_ports: (43100, 43199),
            install_command: sh(install_script),
            start_command: sh(start_script),
            ready_grace: Duration::from_secs(3),
            stop_timeout: Duration::from_millis(500),
            ..Settings::default()
        };
        let store = Arc::new(WorkspaceStore::new(dir.path()).unwrap());
        let relay = Arc::new(LogRelay::new(64, 64));
        let manager = ProcessManager::new(&settings, store, relay.clone());
        Harness {
            _dir: dir,
            manager,
            relay,
        }
    }

    fn seed() -> ProjectSeed {
        ProjectSeed {
            entry_code: "export default function App() { return <h1>Hi</h1>; }".to_string(),
            entry_file: None,
            dependencies: BTreeMap::new(),
        }
    }

    async fn wait_for_state(manager: &ProcessManager, project: &str, state: RuntimeState) -> ProjectStatus {
        for _ in 0..100 {
            let status = manager.status(project).unwrap();
            if status.state == state {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("{} never reached {:?}", project, state);
    }

    const SERVER: &str = "echo Compiled successfully; exec sleep 30";

    #[tokio::test]
    async fn test_initialize_start_stop_lifecycle() {
        let h = harness(SERVER);

        let status = h.manager.initialize("demo", &seed()).await.unwrap();
        assert_eq!(status.state, RuntimeState::Ready);
        assert!(status.dependencies_installed);
        assert_eq!(h.manager.status("demo").unwrap().state, RuntimeState::Ready);

        let url = h.manager.start("demo").await.unwrap();
        assert!(url.starts_with("http://127.0.0.1:431"), "{}", url);
        let status = h.manager.status("demo").unwrap();
        assert_eq!(status.state, RuntimeState::Running);
        assert_eq!(status.preview_url.as_deref(), Some(url.as_str()));
        assert_eq!(status.health, Health::Compiled);
        assert!(status.pid.is_some());
        assert!(status.started_at.is_some());

        let status = h.manager.stop("demo").await.unwrap();
        assert_eq!(status.state, RuntimeState::Stopped);
        assert!(status.preview_url.is_none());
        assert!(status.pid.is_none());
    }

    #[tokio::test]
    async fn test_start_twice_reuses_process_and_url() {
        let h = harness(SERVER);
        h.manager.initialize("demo", &seed()).await.unwrap();

        let first = h.manager.start("demo").await.unwrap();
        let pid = h.manager.status("demo").unwrap().pid;
        let second = h.manager.start("demo").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(h.manager.status("demo").unwrap().pid, pid);
        assert_eq!(h.manager.running_count(), 1);

        h.manager.stop("demo").await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_starts_spawn_once() {
        let h = harness(SERVER);
        h.manager.initialize("demo", &seed()).await.unwrap();

        let (a, b) = tokio::join!(h.manager.start("demo"), h.manager.start("demo"));
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(h.manager.running_count(), 1);
        h.manager.stop("demo").await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let h = harness(SERVER);
        h.manager.initialize("demo", &seed()).await.unwrap();
        h.manager.start("demo").await.unwrap();

        assert_eq!(h.manager.stop("demo").await.unwrap().state, RuntimeState::Stopped);
        assert_eq!(h.manager.stop("demo").await.unwrap().state, RuntimeState::Stopped);
        // never started at all
        assert_eq!(h.manager.stop("ghost").await.unwrap().state, RuntimeState::Uninitialized);
    }

    #[tokio::test]
    async fn test_start_without_initialize_is_precondition() {
        let h = harness(SERVER);
        let err = h.manager.start("never").await.unwrap_err();
        assert_eq!(err.kind(), "precondition");
        let status = h.manager.status("never").unwrap();
        assert_eq!(status.state, RuntimeState::Uninitialized);
        assert!(status.pid.is_none());
        assert_eq!(h.manager.running_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_escalates_to_kill() {
        let h = harness("trap '' TERM; echo Compiled successfully; while true; do sleep 1; done");
        h.manager.initialize("stubborn", &seed()).await.unwrap();
        h.manager.start("stubborn").await.unwrap();

        let started = std::time::Instant::now();
        let status = h.manager.stop("stubborn").await.unwrap();
        assert_eq!(status.state, RuntimeState::Stopped);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_exit_before_ready_is_errored_with_tail() {
        let h = harness("echo 'Module not found: react' >&2; exit 2");
        h.manager.initialize("broken", &seed()).await.unwrap();

        let err = h.manager.start("broken").await.unwrap_err();
        assert_eq!(err.kind(), "process_spawn_failure");
        let status = h.manager.status("broken").unwrap();
        assert_eq!(status.state, RuntimeState::Errored);
        let last_error = status.last_error.unwrap();
        assert!(last_error.contains("code 2"), "{}", last_error);
        assert!(last_error.contains("Module not found"), "{}", last_error);
    }

    #[tokio::test]
    async fn test_crash_while_running_is_errored_and_not_restarted() {
        let h = harness("echo Compiled successfully; sleep 0.3; exit 7");
        h.manager.initialize("flaky", &seed()).await.unwrap();
        h.manager.start("flaky").await.unwrap();

        let status = wait_for_state(&h.manager, "flaky", RuntimeState::Errored).await;
        assert!(status.last_error.unwrap().contains("code 7"));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(h.manager.status("flaky").unwrap().state, RuntimeState::Errored);

        // an explicit start is allowed again
        h.manager.start("flaky").await.unwrap();
        h.manager.stop("flaky").await.unwrap();
    }

    #[tokio::test]
    async fn test_grace_period_without_banner_still_runs() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            workspace_dir: dir.path().to_path_buf(),
            preview_ports: (43200, 43299),
            install_command: sh("mkdir -p node_modules"),
            start_command: sh("exec sleep 30"),
            ready_grace: Duration::from_millis(200),
            stop_timeout: Duration::from_millis(500),
            ..Settings::default()
        };
        let store = Arc::new(WorkspaceStore::new(dir.path()).unwrap());
        let manager = ProcessManager::new(&settings, store, Arc::new(LogRelay::new(16, 16)));
        manager.initialize("quiet", &seed()).await.unwrap();

        manager.start("quiet").await.unwrap();
        let status = manager.status("quiet").unwrap();
        assert_eq!(status.state, RuntimeState::Running);
        assert_eq!(status.health, Health::Unknown);
        manager.stop("quiet").await.unwrap();
    }

    #[tokio::test]
    async fn test_output_reaches_relay_subscribers() {
        let h = harness(SERVER);
        let mut sub = h.relay.subscribe("demo");
        h.manager.initialize("demo", &seed()).await.unwrap();
        h.manager.start("demo").await.unwrap();

        let mut saw_banner = false;
        while let Some(line) = sub.try_recv() {
            if line.text == "Compiled successfully" {
                assert_eq!(line.stream, LogStream::Stdout);
                saw_banner = true;
            }
        }
        assert!(saw_banner);
        h.manager.stop("demo").await.unwrap();
    }

    #[tokio::test]
    async fn test_projects_do_not_share_ports() {
        let h = harness(SERVER);
        h.manager.initialize("one", &seed()).await.unwrap();
        h.manager.initialize("two", &seed()).await.unwrap();
        let a = h.manager.start("one").await.unwrap();
        let b = h.manager.start("two").await.unwrap();
        assert_ne!(a, b);
        assert_eq!(h.manager.running_count(), 2);

        h.manager.shutdown_all().await;
        assert_eq!(h.manager.status("one").unwrap().state, RuntimeState::Stopped);
        assert_eq!(h.manager.status("two").unwrap().state, RuntimeState::Stopped);
        assert_eq!(h.manager.running_count(), 0);
    }

    #[tokio::test]
    async fn test_reinitialize_stops_running_process() {
        let h = harness(SERVER);
        h.manager.initialize("demo", &seed()).await.unwrap();
        h.manager.start("demo").await.unwrap();

        let status = h.manager.initialize("demo", &seed()).await.unwrap();
        assert_eq!(status.state, RuntimeState::Ready);
        assert!(status.pid.is_none());
        assert_eq!(h.manager.running_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_and_list() {
        let h = harness(SERVER);
        h.manager.initialize("keep", &seed()).await.unwrap();
        h.manager.initialize("drop", &seed()).await.unwrap();
        h.manager.start("drop").await.unwrap();

        let names: Vec<String> = h.manager.list().into_iter().map(|s| s.project).collect();
        assert_eq!(names, vec!["drop", "keep"]);

        h.manager.delete("drop", true).await.unwrap();
        assert_eq!(h.manager.running_count(), 0);
        let names: Vec<String> = h.manager.list().into_iter().map(|s| s.project).collect();
        assert_eq!(names, vec!["keep"]);

        let err = h.manager.delete("drop", true).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_changes_are_broadcast() {
        let h = harness(SERVER);
        let mut changes = h.manager.subscribe_changes();
        h.manager.initialize("demo", &seed()).await.unwrap();

        let mut states = Vec::new();
        while let Ok(status) = changes.try_recv() {
            states.push(status.state);
        }
        assert_eq!(states.first(), Some(&RuntimeState::Installing));
        assert_eq!(states.last(), Some(&RuntimeState::Ready));
    }

    #[cfg(target_os = "linux")]
    fn process_alive(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.trim_start().chars().next())
                .is_some_and(|state| state != 'Z'),
            Err(_) => false,
        }
    }

    #[tokio::test]
    async fn test_stop_interrupts_start() {
        let h = harness("echo booting; exec sleep 30");
        h.manager.initialize("slow", &seed()).await.unwrap();

        let began = std::time::Instant::now();
        let (started, stopped) = tokio::join!(h.manager.start("slow"), async {
            wait_for_state(&h.manager, "slow", RuntimeState::Starting).await;
            h.manager.stop("slow").await
        });
        assert_eq!(started.unwrap_err().kind(), "precondition");
        assert_eq!(stopped.unwrap().state, RuntimeState::Stopped);
        // well inside the 3s readiness grace
        assert!(began.elapsed() < Duration::from_millis(2500));
        assert_eq!(h.manager.status("slow").unwrap().state, RuntimeState::Stopped);
        assert_eq!(h.manager.running_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_initialize_is_serialized() {
        let h = harness_with(
            "if [ -e ../installing ]; then touch ../overlap; fi; touch ../installing; sleep 0.3; rm ../installing; mkdir -p node_modules",
            SERVER,
        );

        let (seed_a, seed_b) = (seed(), seed());
        let (a, b) = tokio::join!(h.manager.initialize("demo", &seed_a), h.manager.initialize("demo", &seed_b));
        assert_eq!(a.unwrap().state, RuntimeState::Ready);
        assert_eq!(b.unwrap().state, RuntimeState::Ready);
        assert!(!h._dir.path().join("overlap").exists());
        assert_eq!(h.manager.status("demo").unwrap().state, RuntimeState::Ready);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_start_queued_behind_delete_is_tracked() {
        let h = harness("echo $$ >> ../pids; echo Compiled successfully; exec sleep 30");
        h.manager.initialize("demo", &seed()).await.unwrap();
        h.manager.start("demo").await.unwrap();

        let (deleted, restarted) = tokio::join!(h.manager.delete("demo", false), h.manager.start("demo"));
        deleted.unwrap();
        restarted.unwrap();
        assert_eq!(h.manager.status("demo").unwrap().state, RuntimeState::Running);
        assert_eq!(h.manager.running_count(), 1);

        h.manager.shutdown_all().await;
        let pids: Vec<i32> = std::fs::read_to_string(h._dir.path().join("pids"))
            .unwrap()
            .lines()
            .map(|l| l.trim().parse().unwrap())
            .collect();
        assert_eq!(pids.len(), 2);
        for pid in pids {
            assert!(!process_alive(pid), "pid {} outlived shutdown", pid);
        }
    }

    #[tokio::test]
    async fn test_start_queued_behind_delete_with_files_fails() {
        let h = harness(SERVER);
        h.manager.initialize("demo", &seed()).await.unwrap();
        h.manager.start("demo").await.unwrap();

        let (deleted, restarted) = tokio::join!(h.manager.delete("demo", true), h.manager.start("demo"));
        deleted.unwrap();
        assert_eq!(restarted.unwrap_err().kind(), "precondition");
        assert_eq!(h.manager.running_count(), 0);
        assert_eq!(h.manager.status("demo").unwrap().state, RuntimeState::Uninitialized);
        assert_eq!(h.manager.delete("demo", true).await.unwrap_err().kind(), "not_found");
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_work() {
        let h = harness(SERVER);
        h.manager.initialize("demo", &seed()).await.unwrap();
        h.manager.shutdown_all().await;

        assert_eq!(h.manager.start("demo").await.unwrap_err().kind(), "precondition");
        assert_eq!(h.manager.initialize("demo", &seed()).await.unwrap_err().kind(), "precondition");
        assert_eq!(h.manager.running_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_running_install() {
        let h = harness_with("sleep 30", SERVER);
        let began = std::time::Instant::now();
        let seed = seed();
        let (initialized, ()) = tokio::join!(h.manager.initialize("demo", &seed), async {
            wait_for_state(&h.manager, "demo", RuntimeState::Installing).await;
            tokio::time::sleep(Duration::from_millis(100)).await;
            h.manager.shutdown_all().await;
        });
        assert_eq!(initialized.unwrap_err().kind(), "install_failure");
        assert!(began.elapsed() < Duration::from_secs(5));
        assert_eq!(h.manager.status("demo").unwrap().state, RuntimeState::Errored);
    }

    struct MarkerProbe;

    impl ReadinessProbe for MarkerProbe {
        fn observe(&self, line: &str) -> Option<Health> {
            (line == "listening").then_some(Health::Compiled)
        }

        fn grace(&self) -> Duration {
            Duration::from_secs(5)
        }
    }

    #[tokio::test]
    async fn test_custom_probe_decides_readiness() {
        let h = harness("echo booting; sleep 0.2; echo listening; exec sleep 30");
        let manager = h.manager.with_probe(Arc::new(MarkerProbe));
        manager.initialize("demo", &seed()).await.unwrap();

        manager.start("demo").await.unwrap();
        let status = manager.status("demo").unwrap();
        assert_eq!(status.state, RuntimeState::Running);
        assert_eq!(status.health, Health::Compiled);
        manager.shutdown_all().await;
    }

    #[test]
    fn test_port_allocator_skips_reserved_and_bound() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = listener.local_addr().unwrap().port();
        let allocator = PortAllocator::new((taken, taken.saturating_add(1)));
        let port = allocator.allocate().unwrap();
        assert_ne!(port, taken);
        assert!(allocator.allocate().is_err());
        allocator.release(port);
        assert_eq!(allocator.allocate().unwrap(), port);
    }
}
