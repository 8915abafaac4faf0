//! Checkpoint records and the append-only checkpoint store
//!
//! A checkpoint is an immutable snapshot of orchestrator state for one
//! session: the user task, the current phase, per-task progress, per-agent
//! state, a free-form context snapshot, and the phase history. Checkpoints
//! are appended to a per-session JSONL file and never rewritten; the most
//! recent entry is the resume point after a crash or phase retreat.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::{StoreError, write_atomic};

/// Progress record for one task, mirroring the live TaskNode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProgress {
    pub task_id: String,
    pub description: String,
    /// Status string as recorded by the orchestrator (`pending`, `ready`,
    /// `in_progress`, `completed`, `failed`, `blocked`)
    pub status: String,
    /// Task identities this task depends on
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Iterations spent on this task so far
    #[serde(default)]
    pub iterations: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// State record for one agent at checkpoint time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub agent_id: String,
    pub role: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
}

/// An immutable snapshot of session + epic state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    /// The original user task string
    pub user_task: String,
    /// Phase the orchestrator was in when this snapshot was taken
    pub phase: String,
    #[serde(default)]
    pub task_progress: Vec<TaskProgress>,
    #[serde(default)]
    pub agent_states: Vec<AgentState>,
    /// Free-form context (design artifacts, deliverables, error history)
    #[serde(default)]
    pub context: Value,
    /// Monotonic list of phases traversed so far
    #[serde(default)]
    pub phase_history: Vec<String>,
    /// Why this checkpoint was written (`phase_transition`, `reentry`,
    /// `task_failure`, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Checkpoint {
    pub fn new(session_id: impl Into<String>, user_task: impl Into<String>, phase: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            session_id: session_id.into(),
            timestamp: Utc::now(),
            user_task: user_task.into(),
            phase: phase.into(),
            task_progress: Vec::new(),
            agent_states: Vec::new(),
            context: Value::Null,
            phase_history: Vec::new(),
            reason: None,
        }
    }

    /// Task identities recorded as completed
    pub fn completed_task_ids(&self) -> BTreeSet<String> {
        self.task_ids_with_status("completed")
    }

    /// Task identities recorded as failed
    pub fn failed_task_ids(&self) -> BTreeSet<String> {
        self.task_ids_with_status("failed")
    }

    /// Task identities in neither terminal state
    pub fn pending_task_ids(&self) -> BTreeSet<String> {
        self.task_progress
            .iter()
            .filter(|t| t.status != "completed" && t.status != "failed")
            .map(|t| t.task_id.clone())
            .collect()
    }

    fn task_ids_with_status(&self, status: &str) -> BTreeSet<String> {
        self.task_progress
            .iter()
            .filter(|t| t.status == status)
            .map(|t| t.task_id.clone())
            .collect()
    }
}

/// Append-only checkpoint persistence, one JSONL file per session
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    /// Create a store rooted at `root` (typically `<state>/checkpoints`)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn session_file(&self, session_id: &str) -> PathBuf {
        self.root.join(format!("{}.jsonl", session_id))
    }

    /// Append a checkpoint for its session and return it
    pub fn append(&self, checkpoint: Checkpoint) -> Result<Checkpoint, StoreError> {
        debug!(session_id = %checkpoint.session_id, phase = %checkpoint.phase, "CheckpointStore::append");
        std::fs::create_dir_all(&self.root)?;

        let path = self.session_file(&checkpoint.session_id);
        let line = serde_json::to_string(&checkpoint)? + "\n";

        use std::io::Write;
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(line.as_bytes())?;
        file.flush()?;

        Ok(checkpoint)
    }

    /// All checkpoints for a session, oldest first
    pub fn load_all(&self, session_id: &str) -> Result<Vec<Checkpoint>, StoreError> {
        let path = self.session_file(session_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&path)?;
        let checkpoints = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<Checkpoint>(line) {
                Ok(cp) => Some(cp),
                Err(e) => {
                    warn!(%session_id, error = %e, "skipping unparseable checkpoint line");
                    None
                }
            })
            .collect();
        Ok(checkpoints)
    }

    /// The most recent checkpoint for a session, if any
    pub fn find_latest(&self, session_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self.load_all(session_id)?.into_iter().next_back())
    }

    /// Trim all but the most recent `keep` checkpoints.
    ///
    /// The surviving entries are rewritten verbatim; individual checkpoints
    /// are never edited. Returns how many entries were removed.
    pub fn cleanup_old(&self, session_id: &str, keep: usize) -> Result<usize, StoreError> {
        let all = self.load_all(session_id)?;
        if all.len() <= keep {
            return Ok(0);
        }

        let removed = all.len() - keep;
        let survivors = &all[removed..];
        let mut content = String::new();
        for cp in survivors {
            content.push_str(&serde_json::to_string(cp)?);
            content.push('\n');
        }
        write_atomic(&self.session_file(session_id), content.as_bytes())?;

        debug!(%session_id, removed, kept = keep, "CheckpointStore::cleanup_old");
        Ok(removed)
    }

    /// Session identities that have at least one checkpoint on disk
    pub fn session_ids(&self) -> Result<Vec<String>, StoreError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("jsonl")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    #[allow(dead_code)]
    pub fn root(&self) -> &Path {
        &self.root
    }
}
