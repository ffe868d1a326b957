//! Readiness probe for dev server processes.
//!
//! The lifecycle manager only asks two things of a probe: what a line of output
//! says about the server's health, and how long to wait before assuming the
//! server is up. The default probe string-matches the compiler banner.

use std::time::Duration;

use serde::Serialize;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    #[default]
    Unknown,
    Compiled,
    Failing,
}

pub trait ReadinessProbe: Send + Sync {
    /// Health signal carried by one line of output, if any.
    fn observe(&self, line: &str) -> Option<Health>;

    /// Upper bound on how long `start` waits for a signal before reporting the
    /// process as running anyway.
    fn grace(&self) -> Duration;
}

/// Matches configurable substrings, case-insensitively.
pub struct OutputPatternProbe {
    ready: String,
    failed: String,
    grace: Duration,
}

impl OutputPatternProbe {
    pub fn new(ready: &str, failed: &str, grace: Duration) -> Self {
        Self {
            ready: ready.to_lowercase(),
            failed: failed.to_lowercase(),
            grace,
        }
    }
}

impl ReadinessProbe for OutputPatternProbe {
    fn observe(&self, line: &str) -> Option<Health> {
        let lower = line.to_lowercase();
        if !self.failed.is_empty() && lower.contains(&self.failed) {
            Some(Health::Failing)
        } else if !self.ready.is_empty() && lower.contains(&self.ready) {
            Some(Health::Compiled)
        } else {
            None
        }
    }

    fn grace(&self) -> Duration {
        self.grace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_probe() {
        let probe = OutputPatternProbe::new("Compiled successfully", "Failed to compile", Duration::from_secs(10));
        assert_eq!(probe.observe("Compiled successfully!"), Some(Health::Compiled));
        assert_eq!(probe.observe("webpack compiled successfully"), Some(Health::Compiled));
        assert_eq!(probe.observe("Failed to compile."), Some(Health::Failing));
        assert_eq!(probe.observe("Starting the development server..."), None);
        assert_eq!(probe.grace(), Duration::from_secs(10));
    }

    #[test]
    fn test_empty_patterns_never_match() {
        let probe = OutputPatternProbe::new("", "", Duration::from_millis(100));
        assert_eq!(probe.observe("anything"), None);
    }
}
