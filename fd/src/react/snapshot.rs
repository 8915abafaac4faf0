//! Per-round diagnostic snapshots

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;

/// What a snapshot entry records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    Thought,
    FormatRepair,
}

/// One diagnostic record per round (plus one per repair attempt)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundSnapshot {
    pub agent_id: String,
    pub round: u32,
    pub kind: SnapshotKind,
    /// First 200 chars of the thought (or the repair reason)
    pub thought_excerpt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

pub fn excerpt(text: &str) -> String {
    if text.chars().count() > 200 {
        text.chars().take(200).collect()
    } else {
        text.to_string()
    }
}

/// Sink for round snapshots
pub trait SnapshotSink: Send + Sync {
    fn record(&self, snapshot: &RoundSnapshot);
}

/// Appends snapshots as JSON lines to a file
pub struct JsonlSnapshotLogger {
    path: PathBuf,
}

impl JsonlSnapshotLogger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SnapshotSink for JsonlSnapshotLogger {
    fn record(&self, snapshot: &RoundSnapshot) {
        let write = || -> std::io::Result<()> {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&self.path)?;
            let line = serde_json::to_string(snapshot).unwrap_or_default() + "\n";
            file.write_all(line.as_bytes())
        };
        if let Err(e) = write() {
            warn!(path = %self.path.display(), error = %e, "failed to record round snapshot");
        }
    }
}

/// In-memory sink for assertions
#[derive(Default)]
pub struct MemorySnapshots {
    entries: Mutex<Vec<RoundSnapshot>>,
}

impl MemorySnapshots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<RoundSnapshot> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl SnapshotSink for MemorySnapshots {
    fn record(&self, snapshot: &RoundSnapshot) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).push(snapshot.clone());
    }
}
