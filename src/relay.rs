//! # Log Relay
//!
//! Fan-out of runtime process output to any number of live viewers.
//!
//! Each project owns one `tokio::sync::broadcast` channel that outlives
//! individual processes, so a viewer can subscribe before the dev server
//! starts and keep its channel across restarts. The channel gives us the
//! delivery rules for free:
//!
//! - publishing never blocks (the ring overwrites the oldest entry),
//! - every receiver keeps its own cursor, so one lagging viewer only loses its
//!   own oldest lines and never stalls the others,
//! - a dropped receiver simply stops counting as a subscriber.
//!
//! A small backlog ring is kept separately for the initial render of a log
//! panel; live subscribers only ever see lines published after they joined.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::{self, Stream};
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
    /// Output of the dependency install step.
    Install,
    /// Lifecycle notices emitted by the manager itself.
    System,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// One line of process output, as delivered to viewers.
#[derive(Clone, Debug, Serialize)]
pub struct LogLine {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub time: DateTime<Utc>,
    pub stream: LogStream,
    pub level: LogLevel,
    pub text: String,
}

struct ProjectChannel {
    tx: broadcast::Sender<LogLine>,
    backlog: Mutex<VecDeque<LogLine>>,
}

pub struct LogRelay {
    channels: DashMap<String, Arc<ProjectChannel>>,
    buffer: usize,
    backlog: usize,
}

/// Strip terminal escape sequences (colors, cursor movement, OSC titles) and
/// stray control characters. Carriage-return progress redraws keep only the
/// final frame.
pub fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\x1b' => match chars.peek() {
                Some('[') => {
                    chars.next();
                    while let Some(ch) = chars.next() {
                        if ('\x40'..='\x7e').contains(&ch) {
                            break;
                        }
                    }
                }
                Some(']') => {
                    chars.next();
                    while let Some(ch) = chars.next() {
                        if ch == '\x07' {
                            break;
                        }
                        if ch == '\x1b' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                Some(_) => {
                    chars.next();
                }
                None => {}
            },
            '\r' => {
                // Keep the last redraw of the line unless it is empty.
                if chars.peek().is_some() {
                    out.clear();
                }
            }
            '\t' => out.push(c),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    out
}

pub fn classify_level(stream: LogStream, text: &str) -> LogLevel {
    let lower = text.to_ascii_lowercase();
    if lower.contains("error") || lower.contains("failed") {
        LogLevel::Error
    } else if lower.contains("warn") || stream == LogStream::Stderr {
        LogLevel::Warn
    } else {
        LogLevel::Info
    }
}

impl LogRelay {
    /// `buffer` bounds how far a single subscriber may fall behind before its
    /// oldest lines are dropped; `backlog` is the replay ring size.
    pub fn new(buffer: usize, backlog: usize) -> Self {
        Self {
            channels: DashMap::new(),
            buffer: buffer.max(1),
            backlog,
        }
    }

    fn channel(&self, project: &str) -> Arc<ProjectChannel> {
        if let Some(ch) = self.channels.get(project) {
            return ch.clone();
        }
        self.channels
            .entry(project.to_string())
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel(self.buffer);
                Arc::new(ProjectChannel {
                    tx,
                    backlog: Mutex::new(VecDeque::new()),
                })
            })
            .clone()
    }

    /// Live stream of lines for `project`. Works before any process exists.
    pub fn subscribe(&self, project: &str) -> LogSubscription {
        LogSubscription {
            rx: self.channel(project).tx.subscribe(),
            dropped: 0,
        }
    }

    /// Deliver one chunk of output to every current subscriber.
    ///
    /// Multi-line chunks are split; blank lines after stripping are skipped.
    pub fn publish(&self, project: &str, stream: LogStream, chunk: &str) {
        let ch = self.channel(project);
        for raw in chunk.lines() {
            let text = strip_ansi(raw);
            if text.trim().is_empty() {
                continue;
            }
            let line = LogLine {
                kind: "log",
                time: Utc::now(),
                stream,
                level: classify_level(stream, &text),
                text,
            };

            if self.backlog > 0 {
                let mut backlog = ch.backlog.lock().unwrap_or_else(|e| e.into_inner());
                backlog.push_back(line.clone());
                while backlog.len() > self.backlog {
                    backlog.pop_front();
                }
            }

            // Err only means nobody is listening right now.
            let _ = ch.tx.send(line);
        }
    }

    /// Most recent lines, oldest first.
    pub fn recent(&self, project: &str, limit: usize) -> Vec<LogLine> {
        let Some(ch) = self.channels.get(project).map(|c| c.clone()) else {
            return Vec::new();
        };
        let backlog = ch.backlog.lock().unwrap_or_else(|e| e.into_inner());
        let skip = backlog.len().saturating_sub(limit);
        backlog.iter().skip(skip).cloned().collect()
    }

    pub fn subscriber_count(&self, project: &str) -> usize {
        self.channels
            .get(project)
            .map(|c| c.tx.receiver_count())
            .unwrap_or(0)
    }

    /// Forget a project entirely. Open subscriptions see end-of-stream.
    pub fn remove(&self, project: &str) {
        self.channels.remove(project);
    }
}

/// A single viewer's cursor into a project's log channel.
pub struct LogSubscription {
    rx: broadcast::Receiver<LogLine>,
    dropped: u64,
}

impl LogSubscription {
    /// Next line, skipping over anything lost to overflow.
    /// `None` once the project's channel is gone.
    pub async fn recv(&mut self) -> Option<LogLine> {
        loop {
            match self.rx.recv().await {
                Ok(line) => return Some(line),
                Err(RecvError::Lagged(n)) => {
                    self.dropped += n;
                    tracing::debug!("Log subscriber lagged, dropped {} lines", n);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<LogLine> {
        loop {
            match self.rx.try_recv() {
                Ok(line) => return Some(line),
                Err(TryRecvError::Lagged(n)) => self.dropped += n,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Lines this subscriber lost because it fell too far behind.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn into_stream(self) -> impl Stream<Item = LogLine> + Send + 'static {
        stream::unfold(self, |mut sub| async move {
            let line = sub.recv().await?;
            Some((line, sub))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_ansi_colors_and_cursor() {
        assert_eq!(strip_ansi("\x1b[32mCompiled successfully!\x1b[39m"), "Compiled successfully!");
        assert_eq!(strip_ansi("\x1b[2J\x1b[3J\x1b[HStarting"), "Starting");
        assert_eq!(strip_ansi("\x1b]0;title\x07done"), "done");
        assert_eq!(strip_ansi("\x1bcclear"), "clear");
    }

    #[test]
    fn test_strip_ansi_carriage_return_keeps_last_frame() {
        assert_eq!(strip_ansi("10%\r50%\r100%"), "100%");
        assert_eq!(strip_ansi("done\r"), "done");
        assert_eq!(strip_ansi("a\tb\x08c"), "a\tbc");
    }

    #[test]
    fn test_classify_level() {
        assert_eq!(classify_level(LogStream::Stdout, "Failed to compile."), LogLevel::Error);
        assert_eq!(classify_level(LogStream::Stdout, "Compiled with warnings."), LogLevel::Warn);
        assert_eq!(classify_level(LogStream::Stderr, "npm notice"), LogLevel::Warn);
        assert_eq!(classify_level(LogStream::Stdout, "webpack compiled"), LogLevel::Info);
    }

    #[tokio::test]
    async fn test_subscribe_before_any_output() {
        let relay = LogRelay::new(16, 10);
        let mut sub = relay.subscribe("demo");
        assert_eq!(relay.subscriber_count("demo"), 1);
        assert!(sub.try_recv().is_none());

        relay.publish("demo", LogStream::Stdout, "\x1b[36mStarting the development server...\x1b[39m\n");
        let line = sub.recv().await.unwrap();
        assert_eq!(line.text, "Starting the development server...");
        assert_eq!(line.stream, LogStream::Stdout);
        assert_eq!(line.kind, "log");
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_only_subsequent_lines_in_order() {
        let relay = LogRelay::new(16, 10);
        relay.publish("demo", LogStream::Stdout, "early 1\nearly 2");

        let mut late = relay.subscribe("demo");
        relay.publish("demo", LogStream::Stdout, "late 1");
        relay.publish("demo", LogStream::Stderr, "late 2");

        assert_eq!(late.recv().await.unwrap().text, "late 1");
        let second = late.recv().await.unwrap();
        assert_eq!(second.text, "late 2");
        assert_eq!(second.stream, LogStream::Stderr);
        assert!(late.try_recv().is_none());

        // backlog still has everything for the initial render
        let recent: Vec<String> = relay.recent("demo", 10).into_iter().map(|l| l.text).collect();
        assert_eq!(recent, vec!["early 1", "early 2", "late 1", "late 2"]);
    }

    #[test]
    fn test_slow_subscriber_does_not_stall_fast_one() {
        let relay = LogRelay::new(16, 0);
        let mut fast = relay.subscribe("demo");
        let mut slow = relay.subscribe("demo");

        let mut fast_seen = Vec::new();
        for i in 0..100 {
            relay.publish("demo", LogStream::Stdout, &format!("line {}", i));
            fast_seen.push(fast.try_recv().unwrap().text);
        }
        assert_eq!(fast_seen.len(), 100);
        assert_eq!(fast.dropped(), 0);

        let mut slow_seen = Vec::new();
        while let Some(line) = slow.try_recv() {
            slow_seen.push(line.text);
        }
        assert!(slow_seen.len() <= 16);
        assert_eq!(slow_seen.last().map(String::as_str), Some("line 99"));
        assert_eq!(slow.dropped() as usize + slow_seen.len(), 100);
    }

    #[test]
    fn test_dropped_subscriber_is_forgotten() {
        let relay = LogRelay::new(16, 0);
        let sub = relay.subscribe("demo");
        let other = relay.subscribe("demo");
        assert_eq!(relay.subscriber_count("demo"), 2);
        drop(sub);
        relay.publish("demo", LogStream::Stdout, "still delivered");
        assert_eq!(relay.subscriber_count("demo"), 1);
        drop(other);
        relay.publish("demo", LogStream::Stdout, "nobody listening");
        assert_eq!(relay.subscriber_count("demo"), 0);
    }

    #[test]
    fn test_backlog_is_bounded() {
        let relay = LogRelay::new(16, 3);
        for i in 0..10 {
            relay.publish("demo", LogStream::Stdout, &format!("{}", i));
        }
        let recent: Vec<String> = relay.recent("demo", 100).into_iter().map(|l| l.text).collect();
        assert_eq!(recent, vec!["7", "8", "9"]);
        assert_eq!(relay.recent("demo", 1).len(), 1);
        assert!(relay.recent("other", 10).is_empty());
    }
}
