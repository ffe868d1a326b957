//! Server settings, read once from the environment at startup.
//!
//! Every knob has a default so the server runs with no configuration at all.
//! Keys use the `LOOM_` prefix except `PORT` and `OPENROUTER_API_KEY`.

use std::path::PathBuf;
use std::time::Duration;

/// A program plus its arguments, parsed from a whitespace separated string
/// such as `"npm install"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }

    /// Same program with extra arguments appended (e.g. `npm install react-router-dom`).
    pub fn with_args<I, S>(&self, extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut args = self.args.clone();
        args.extend(extra.into_iter().map(Into::into));
        Self {
            program: self.program.clone(),
            args,
        }
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub bind: String,
    pub workspace_dir: PathBuf,
    pub upload_dir: PathBuf,
    pub static_dir: PathBuf,
    pub preview_host: String,
    pub preview_ports: (u16, u16),
    pub install_command: CommandSpec,
    pub start_command: CommandSpec,
    pub ready_pattern: String,
    pub fail_pattern: String,
    pub ready_grace: Duration,
    pub stop_timeout: Duration,
    pub install_timeout: Duration,
    pub job_timeout: Duration,
    pub job_retention: Duration,
    pub job_reap_interval: Duration,
    pub poll_interval: Duration,
    pub poll_max_attempts: u32,
    pub log_buffer: usize,
    pub log_backlog: usize,
    pub openrouter_api_key: Option<String>,
    pub model: String,
    pub openrouter_url: String,
    pub cors_origins: Vec<String>,
}

fn npm() -> &'static str {
    if cfg!(windows) {
        "npm.cmd"
    } else {
        "npm"
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: 3001,
            bind: "0.0.0.0".to_string(),
            workspace_dir: PathBuf::from("workspaces"),
            upload_dir: PathBuf::from("uploads"),
            static_dir: PathBuf::from("static"),
            preview_host: "localhost".to_string(),
            preview_ports: (3100, 3199),
            install_command: CommandSpec {
                program: npm().to_string(),
                args: vec!["install".to_string()],
            },
            start_command: CommandSpec {
                program: npm().to_string(),
                args: vec!["start".to_string()],
            },
            ready_pattern: "compiled successfully".to_string(),
            fail_pattern: "failed to compile".to_string(),
            ready_grace: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(5),
            install_timeout: Duration::from_secs(600),
            job_timeout: Duration::from_secs(180),
            job_retention: Duration::from_secs(30 * 60),
            job_reap_interval: Duration::from_secs(60),
            poll_interval: Duration::from_millis(1000),
            poll_max_attempts: 120,
            log_buffer: 256,
            log_backlog: 200,
            openrouter_api_key: None,
            model: "qwen/qwen3-coder".to_string(),
            openrouter_url: "https://openrouter.ai/api/v1/chat/completions".to_string(),
            cors_origins: vec!["*".to_string()],
        }
    }
}

fn var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    var(key).and_then(|v| v.trim().parse().ok())
}

fn secs(key: &str) -> Option<Duration> {
    parsed::<u64>(key).map(Duration::from_secs)
}

impl Settings {
    pub fn from_env() -> Self {
        let d = Self::default();
        let port_start = parsed("LOOM_PREVIEW_PORT_START").unwrap_or(d.preview_ports.0);
        let port_end = parsed("LOOM_PREVIEW_PORT_END").unwrap_or(d.preview_ports.1);

        Self {
            port: parsed("PORT").unwrap_or(d.port),
            bind: var("LOOM_BIND").unwrap_or(d.bind),
            workspace_dir: var("LOOM_WORKSPACE_DIR").map(PathBuf::from).unwrap_or(d.workspace_dir),
            upload_dir: var("LOOM_UPLOAD_DIR").map(PathBuf::from).unwrap_or(d.upload_dir),
            static_dir: var("LOOM_STATIC_DIR").map(PathBuf::from).unwrap_or(d.static_dir),
            preview_host: var("LOOM_PREVIEW_HOST").unwrap_or(d.preview_host),
            preview_ports: (port_start.min(port_end), port_start.max(port_end)),
            install_command: var("LOOM_INSTALL_COMMAND")
                .and_then(|c| CommandSpec::parse(&c))
                .unwrap_or(d.install_command),
            start_command: var("LOOM_START_COMMAND")
                .and_then(|c| CommandSpec::parse(&c))
                .unwrap_or(d.start_command),
            ready_pattern: var("LOOM_READY_PATTERN").unwrap_or(d.ready_pattern),
            fail_pattern: var("LOOM_FAIL_PATTERN").unwrap_or(d.fail_pattern),
            ready_grace: secs("LOOM_READY_GRACE_SECS").unwrap_or(d.ready_grace),
            stop_timeout: secs("LOOM_STOP_TIMEOUT_SECS").unwrap_or(d.stop_timeout),
            install_timeout: secs("LOOM_INSTALL_TIMEOUT_SECS").unwrap_or(d.install_timeout),
            job_timeout: secs("LOOM_JOB_TIMEOUT_SECS").unwrap_or(d.job_timeout),
            job_retention: secs("LOOM_JOB_RETENTION_SECS").unwrap_or(d.job_retention),
            job_reap_interval: secs("LOOM_JOB_REAP_INTERVAL_SECS").unwrap_or(d.job_reap_interval),
            poll_interval: parsed::<u64>("LOOM_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.poll_interval),
            poll_max_attempts: parsed("LOOM_POLL_MAX_ATTEMPTS").unwrap_or(d.poll_max_attempts),
            log_buffer: parsed::<usize>("LOOM_LOG_BUFFER").unwrap_or(d.log_buffer).max(1),
            log_backlog: parsed("LOOM_LOG_BACKLOG").unwrap_or(d.log_backlog),
            openrouter_api_key: var("OPENROUTER_API_KEY"),
            model: var("LOOM_MODEL").unwrap_or(d.model),
            openrouter_url: var("LOOM_OPENROUTER_URL").unwrap_or(d.openrouter_url),
            cors_origins: var("LOOM_CORS_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or(d.cors_origins),
        }
    }
}
