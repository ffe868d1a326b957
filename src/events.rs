//! Workspace-wide event stream (`GET /api/events`).
//!
//! Every event gets a monotonic sequence number so SSE clients can tell where
//! they are when they reconnect.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::runtime::ProjectStatus;

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkspaceEvent {
    Heartbeat {
        timestamp: i64,
    },
    /// A chat job wrote a file.
    #[serde(rename_all = "camelCase")]
    FileEdited {
        project: String,
        path: String,
        job_id: Option<String>,
    },
    /// A file changed on disk (editor save, external tool).
    FileChanged {
        project: String,
        path: String,
    },
    Runtime {
        status: ProjectStatus,
    },
}

impl WorkspaceEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Heartbeat { .. } => "heartbeat",
            Self::FileEdited { .. } => "file_edited",
            Self::FileChanged { .. } => "file_changed",
            Self::Runtime { .. } => "runtime",
        }
    }
}

pub struct EventBus {
    seq: AtomicU64,
    tx: broadcast::Sender<(u64, WorkspaceEvent)>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            seq: AtomicU64::new(0),
            tx,
        }
    }

    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    pub fn publish(&self, event: WorkspaceEvent) -> u64 {
        let seq = self.next_seq();
        let _ = self.tx.send((seq, event)); // no subscribers is fine
        seq
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(u64, WorkspaceEvent)> {
        self.tx.subscribe()
    }
}
