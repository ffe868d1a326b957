//! Dependency install step.
//!
//! Runs the configured package manager inside a project directory, streaming
//! its output into the log relay. A project counts as installed once its
//! `node_modules/` directory exists.

use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::CommandSpec;
use crate::error::{AppError, AppResult};
use crate::relay::{LogRelay, LogStream};
use crate::runtime::kill_group;

const TAIL_LINES: usize = 12;

/// Packages every project needs on top of its manifest.
const ALWAYS: &[&str] = &["react-router-dom"];
/// Needed only once TypeScript sources show up.
const TYPESCRIPT: &[&str] = &["typescript", "@types/react", "@types/react-dom"];

pub fn dependencies_installed(project_dir: &Path) -> bool {
    project_dir.join("node_modules").is_dir()
}

/// Packages from the extra set that are not present under `node_modules`.
pub fn missing_packages(project_dir: &Path, uses_typescript: bool) -> Vec<String> {
    let modules = project_dir.join("node_modules");
    let mut wanted: Vec<&str> = Vec::new();
    if uses_typescript {
        wanted.extend_from_slice(TYPESCRIPT);
    }
    wanted.extend_from_slice(ALWAYS);
    wanted
        .into_iter()
        .filter(|pkg| !modules.join(pkg).join("package.json").is_file())
        .map(str::to_string)
        .collect()
}

pub struct Installer {
    command: CommandSpec,
    timeout: Duration,
    relay: Arc<LogRelay>,
    cancel: watch::Sender<bool>,
}

type Tail = Arc<Mutex<VecDeque<String>>>;

fn pump<R>(reader: R, project: String, relay: Arc<LogRelay>, tail: Tail) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            relay.publish(&project, LogStream::Install, &line);
            let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
            tail.push_back(line);
            if tail.len() > TAIL_LINES {
                tail.pop_front();
            }
        }
    })
}

impl Installer {
    pub fn new(command: CommandSpec, timeout: Duration, relay: Arc<LogRelay>) -> Self {
        Self {
            command,
            timeout,
            relay,
            cancel: watch::channel(false).0,
        }
    }

    /// Full install from the project's manifest.
    pub async fn install(&self, project: &str, dir: &Path) -> AppResult<()> {
        self.run(project, dir, &self.command).await
    }

    /// Install whatever part of the extra package set is missing.
    /// Returns the packages that were installed.
    pub async fn ensure_extra_packages(
        &self,
        project: &str,
        dir: &Path,
        uses_typescript: bool,
    ) -> AppResult<Vec<String>> {
        let missing = missing_packages(dir, uses_typescript);
        if missing.is_empty() {
            return Ok(missing);
        }
        info!(project, packages = ?missing, "Installing extra packages");
        let command = self.command.with_args(missing.iter().cloned());
        self.run(project, dir, &command).await?;
        Ok(missing)
    }

    /// Abort in-flight installs and refuse new ones. Used on server shutdown.
    pub fn cancel_all(&self) {
        self.cancel.send_replace(true);
    }

    async fn run(&self, project: &str, dir: &Path, command: &CommandSpec) -> AppResult<()> {
        let command_line = command.display();
        let mut cancelled = self.cancel.subscribe();
        if *cancelled.borrow() {
            return Err(AppError::InstallFailure(format!("`{}` cancelled: server is shutting down", command_line)));
        }
        info!(project, command = %command_line, "Running install");
        self.relay
            .publish(project, LogStream::System, &format!("$ {}", command_line));

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        let mut child = cmd
            .spawn()
            .map_err(|e| AppError::InstallFailure(format!("could not run `{}`: {}", command_line, e)))?;
        let pid = child.id();

        let tail: Tail = Arc::new(Mutex::new(VecDeque::new()));
        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(pump(stdout, project.to_string(), self.relay.clone(), tail.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(pump(stderr, project.to_string(), self.relay.clone(), tail.clone()));
        }

        let waited = tokio::select! {
            waited = tokio::time::timeout(self.timeout, child.wait()) => waited.map_err(|_| {
                format!("`{}` timed out after {}s", command_line, self.timeout.as_secs())
            }),
            _ = cancelled.wait_for(|c| *c) => Err(format!("`{}` cancelled: server is shutting down", command_line)),
        };
        let status = match waited {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return Err(AppError::InstallFailure(format!("`{}` could not be awaited: {}", command_line, e)));
            }
            Err(reason) => {
                // npm leaves workers behind; take the whole group down.
                if let Some(pid) = pid {
                    kill_group(pid);
                }
                let _ = child.kill().await;
                warn!(project, "Install aborted: {}", reason);
                return Err(AppError::InstallFailure(reason));
            }
        };

        // Grandchildren can keep the pipes open; don't wait on them forever.
        for handle in pumps {
            let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        }

        if status.success() {
            info!(project, "Install finished");
            return Ok(());
        }

        let code = status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let tail = tail.lock().unwrap_or_else(|e| e.into_inner());
        let tail: Vec<&str> = tail.iter().map(String::as_str).collect();
        warn!(project, code = %code, "Install failed");
        Err(AppError::InstallFailure(format!(
            "`{}` exited with code {}: {}",
            command_line,
            code,
            tail.join("\n")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string(), "sh".to_string()],
        }
    }

    fn installer(command: CommandSpec, timeout: Duration) -> (Installer, Arc<LogRelay>) {
        let relay = Arc::new(LogRelay::new(64, 64));
        (Installer::new(command, timeout, relay.clone()), relay)
    }

    #[tokio::test]
    async fn test_install_success_creates_marker_and_streams_output() {
        let dir = tempfile::tempdir().unwrap();
        let (installer, relay) = installer(sh("echo added 42 packages; mkdir -p node_modules"), Duration::from_secs(10));

        assert!(!dependencies_installed(dir.path()));
        installer.install("demo", dir.path()).await.unwrap();
        assert!(dependencies_installed(dir.path()));

        let texts: Vec<String> = relay.recent("demo", 10).into_iter().map(|l| l.text).collect();
        assert!(texts.iter().any(|t| t == "added 42 packages"));
    }

    #[tokio::test]
    async fn test_install_failure_reports_code_and_tail() {
        let dir = tempfile::tempdir().unwrap();
        let (installer, _) = installer(sh("echo 'ERESOLVE unable to resolve' >&2; exit 3"), Duration::from_secs(10));

        let err = installer.install("demo", dir.path()).await.unwrap_err();
        assert_eq!(err.kind(), "install_failure");
        let message = err.to_string();
        assert!(message.contains("code 3"), "{}", message);
        assert!(message.contains("ERESOLVE"), "{}", message);
    }

    #[tokio::test]
    async fn test_install_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let command = CommandSpec {
            program: "definitely-not-a-package-manager".to_string(),
            args: vec![],
        };
        let (installer, _) = installer(command, Duration::from_secs(10));
        let err = installer.install("demo", dir.path()).await.unwrap_err();
        assert_eq!(err.kind(), "install_failure");
    }

    #[tokio::test]
    async fn test_install_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let (installer, _) = installer(sh("sleep 5"), Duration::from_millis(200));
        let err = installer.install("demo", dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_install_timeout_kills_whole_group() {
        let dir = tempfile::tempdir().unwrap();
        let (installer, _) = installer(sh("sleep 30 & echo $! > bg.pid; wait"), Duration::from_millis(300));
        installer.install("demo", dir.path()).await.unwrap_err();

        let pid = std::fs::read_to_string(dir.path().join("bg.pid")).unwrap();
        let stat = format!("/proc/{}/stat", pid.trim());
        let mut gone = false;
        for _ in 0..40 {
            gone = match std::fs::read_to_string(&stat) {
                Ok(s) => s.rsplit_once(')').is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
                Err(_) => true,
            };
            if gone {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(gone, "background install worker survived the timeout");
    }

    #[tokio::test]
    async fn test_cancel_all_aborts_and_refuses() {
        let dir = tempfile::tempdir().unwrap();
        let (installer, _) = installer(sh("sleep 30"), Duration::from_secs(60));

        let began = std::time::Instant::now();
        let (result, ()) = tokio::join!(installer.install("demo", dir.path()), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            installer.cancel_all();
        });
        let err = result.unwrap_err();
        assert_eq!(err.kind(), "install_failure");
        assert!(err.to_string().contains("shutting down"), "{}", err);
        assert!(began.elapsed() < Duration::from_secs(5));

        let err = installer.install("demo", dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("shutting down"));
    }

    #[tokio::test]
    async fn test_ensure_extra_packages_installs_only_missing() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"for p in "$@"; do mkdir -p "node_modules/$p" && echo '{}' > "node_modules/$p/package.json"; done"#;
        let (installer, _) = installer(sh(script), Duration::from_secs(10));

        let first = installer.ensure_extra_packages("demo", dir.path(), true).await.unwrap();
        assert_eq!(first, vec!["typescript", "@types/react", "@types/react-dom", "react-router-dom"]);
        assert!(dir.path().join("node_modules/@types/react/package.json").is_file());

        let second = installer.ensure_extra_packages("demo", dir.path(), true).await.unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn test_missing_packages_without_typescript() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(missing_packages(dir.path(), false), vec!["react-router-dom"]);
    }
}
