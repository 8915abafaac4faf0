//! Session and Message record types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Role of a message author within a session log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Orchestrator,
}

/// Optional kind tag refining how a message should be rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Command,
    PlanUpdate,
    TaskUpdate,
}

/// One entry in a session's ordered message log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identity
    pub id: String,
    /// Author role
    pub role: MessageRole,
    /// Message body; never empty after trimming
    pub content: String,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Workflow this message belongs to, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    /// Task this message belongs to, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Attachment references (paths or identifiers)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<String>>,
    /// Kind tag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<MessageKind>,
}

impl Message {
    /// Create a message. Returns `None` when the content is empty after
    /// trimming (the log never stores blank entries).
    pub fn new(role: MessageRole, content: impl Into<String>) -> Option<Self> {
        let content = content.into();
        if content.trim().is_empty() {
            return None;
        }
        Some(Self {
            id: Uuid::now_v7().to_string(),
            role,
            content,
            timestamp: Utc::now(),
            workflow_id: None,
            task_id: None,
            attachments: None,
            kind: None,
        })
    }

    /// Attach a workflow identifier
    pub fn with_workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    /// Attach a task identifier
    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Set the kind tag
    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        self.kind = Some(kind);
        self
    }
}

/// A per-project conversation and context container
///
/// Exclusively owned by the Session Manager; other components read
/// snapshots. Persisted as one JSON record bucketed by project directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Opaque session identity
    pub id: String,
    /// Display name
    pub name: String,
    /// Bound project directory (absolute, normalized)
    pub project_dir: PathBuf,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
    /// Last read or mutation time (drives auto-resume selection)
    pub last_accessed_at: DateTime<Utc>,
    /// Ordered message log
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Identifiers of workflows active in this session
    #[serde(default)]
    pub active_workflows: Vec<String>,
    /// Free-form context bag, including `compressedHistory`
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
}

impl Session {
    /// Create a session bound to a project directory.
    ///
    /// The directory is normalized to an absolute, component-clean path so
    /// that bucketing is stable across differently spelled paths.
    pub fn new(name: impl Into<String>, project_dir: impl AsRef<Path>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7().to_string(),
            name: name.into(),
            project_dir: normalize_project_dir(project_dir.as_ref()),
            created_at: now,
            updated_at: now,
            last_accessed_at: now,
            messages: Vec::new(),
            active_workflows: Vec::new(),
            context: BTreeMap::new(),
        }
    }

    /// Append a message and bump the mutation timestamps
    pub fn push_message(&mut self, message: Message) {
        self.messages.push(message);
        let now = Utc::now();
        self.updated_at = now;
        self.last_accessed_at = now;
    }

    /// Record an access without mutating content
    pub fn touch(&mut self) {
        self.last_accessed_at = Utc::now();
    }

    /// Set a context value
    pub fn set_context(&mut self, key: impl Into<String>, value: Value) {
        self.context.insert(key.into(), value);
        self.updated_at = Utc::now();
    }
}

/// Normalize a project path: make absolute (against cwd) and strip
/// `.`/`..` components lexically.
pub fn normalize_project_dir(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")).join(path)
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_rejects_blank_content() {
        assert!(Message::new(MessageRole::User, "   ").is_none());
        assert!(Message::new(MessageRole::User, "").is_none());
        assert!(Message::new(MessageRole::User, "hello").is_some());
    }

    #[test]
    fn test_message_builders() {
        let msg = Message::new(MessageRole::Orchestrator, "plan ready")
            .unwrap()
            .with_workflow("wf-1")
            .with_task("task-1")
            .with_kind(MessageKind::PlanUpdate);

        assert_eq!(msg.workflow_id.as_deref(), Some("wf-1"));
        assert_eq!(msg.task_id.as_deref(), Some("task-1"));
        assert_eq!(msg.kind, Some(MessageKind::PlanUpdate));
    }

    #[test]
    fn test_session_push_message_updates_timestamps() {
        let mut session = Session::new("test", "/tmp/project");
        let before = session.updated_at;

        std::thread::sleep(std::time::Duration::from_millis(2));
        session.push_message(Message::new(MessageRole::User, "hi").unwrap());

        assert_eq!(session.messages.len(), 1);
        assert!(session.updated_at > before);
    }

    #[test]
    fn test_normalize_project_dir_strips_dots() {
        let normalized = normalize_project_dir(Path::new("/a/b/../c/./d"));
        assert_eq!(normalized, PathBuf::from("/a/c/d"));
    }

    #[test]
    fn test_normalize_relative_becomes_absolute() {
        let normalized = normalize_project_dir(Path::new("some/dir"));
        assert!(normalized.is_absolute());
    }

    #[test]
    fn test_session_roundtrip_serde() {
        let mut session = Session::new("demo", "/tmp/p");
        session.push_message(Message::new(MessageRole::Assistant, "done").unwrap());
        session.set_context("key", serde_json::json!({"nested": 1}));

        let json = serde_json::to_string(&session).unwrap();
        let back: Session = serde_json::from_str(&json).unwrap();

        assert_eq!(back.id, session.id);
        assert_eq!(back.messages.len(), 1);
        assert_eq!(back.context["key"]["nested"], 1);
    }
}
