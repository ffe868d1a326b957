//! Turns on-disk changes inside project `src/` and `public/` folders into
//! `file_changed` events, so open editors refresh after out-of-band edits.
//!
//! Only those two folders are watched, per project. `node_modules` never gets
//! an inotify watch.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebouncedEvent, DebouncedEventKind, Debouncer};
use tracing::{debug, error, info, warn};

use crate::events::{EventBus, WorkspaceEvent};
use crate::workspace::validate_name;

const DEBOUNCE_MS: u64 = 300;
const WATCHED_DIRS: &[&str] = &["src", "public"];

/// Split a changed path into `(project, relative path)` when it is something
/// an editor cares about.
pub fn classify_path(root: &Path, path: &Path) -> Option<(String, String)> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = rel.components().filter_map(|c| c.as_os_str().to_str());
    let project = parts.next()?;
    validate_name(project).ok()?;
    let rest: Vec<&str> = parts.collect();
    if rest.len() < 2 || !WATCHED_DIRS.contains(&rest[0]) || rest.contains(&"node_modules") {
        return None;
    }
    Some((project.to_string(), rest.join("/")))
}

pub struct WorkspaceWatcher {
    root: PathBuf,
    debouncer: Mutex<Debouncer<RecommendedWatcher>>,
    watched: Mutex<HashSet<PathBuf>>,
}

impl WorkspaceWatcher {
    /// Start the debouncer and the task publishing its changes. Nothing is
    /// watched until [`Self::add_project`] is called.
    pub fn start(root: PathBuf, events: Arc<EventBus>) -> notify::Result<Self> {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<PathBuf>(256);
        let debouncer = new_debouncer(
            Duration::from_millis(DEBOUNCE_MS),
            move |res: Result<Vec<DebouncedEvent>, notify::Error>| match res {
                Ok(batch) => {
                    for event in batch {
                        if let DebouncedEventKind::Any = event.kind {
                            if tx.blocking_send(event.path).is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(e) => error!("Workspace watcher error: {:?}", e),
            },
        )?;

        let publish_root = root.clone();
        tokio::spawn(async move {
            while let Some(path) = rx.recv().await {
                if let Some((project, path)) = classify_path(&publish_root, &path) {
                    debug!(project = %project, path = %path, "File changed on disk");
                    events.publish(WorkspaceEvent::FileChanged { project, path });
                }
            }
            debug!("Workspace watcher stopped");
        });

        info!("Watching project sources under {}", root.display());
        Ok(Self {
            root,
            debouncer: Mutex::new(debouncer),
            watched: Mutex::new(HashSet::new()),
        })
    }

    /// (Re)watch a project's `src/` and `public/`. Re-initializing a project
    /// recreates those directories, so existing watches are replaced.
    pub fn add_project(&self, project: &str) {
        if validate_name(project).is_err() {
            return;
        }
        let mut debouncer = self.debouncer.lock().unwrap_or_else(|e| e.into_inner());
        let mut watched = self.watched.lock().unwrap_or_else(|e| e.into_inner());
        for dir in WATCHED_DIRS {
            let path = self.root.join(project).join(dir);
            if watched.remove(&path) {
                let _ = debouncer.watcher().unwatch(&path);
            }
            if !path.is_dir() {
                continue;
            }
            match debouncer.watcher().watch(&path, RecursiveMode::Recursive) {
                Ok(()) => {
                    watched.insert(path);
                }
                Err(e) => warn!(project, "Failed to watch {}: {}", path.display(), e),
            }
        }
    }

    pub fn remove_project(&self, project: &str) {
        let mut debouncer = self.debouncer.lock().unwrap_or_else(|e| e.into_inner());
        let mut watched = self.watched.lock().unwrap_or_else(|e| e.into_inner());
        for dir in WATCHED_DIRS {
            let path = self.root.join(project).join(dir);
            if watched.remove(&path) {
                let _ = debouncer.watcher().unwatch(&path);
            }
        }
    }

    pub fn watched_count(&self) -> usize {
        self.watched.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
