//! SessionManager - per-project sessions with auto-resume and
//! message-count compression
//!
//! Owns every in-memory [`Session`], cross-indexed by project directory,
//! on top of the sessionstore persistence layer. Operations are serial
//! per process; concurrent callers synchronize externally (the daemon
//! holds the manager behind one lock).

use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use sessionstore::{Message, Session, SessionStore, StoreError, normalize_project_dir};

/// Messages kept verbatim; older ones compress into a summary
pub const DEFAULT_COMPRESS_THRESHOLD: usize = 50;

/// Context key holding the compressed-history summary
pub const COMPRESSED_HISTORY_KEY: &str = "compressedHistory";

pub struct SessionManager {
    store: SessionStore,
    sessions: HashMap<String, Session>,
    by_project: HashMap<PathBuf, Vec<String>>,
    compress_threshold: usize,
}

impl SessionManager {
    /// Load every session from disk (legacy flat and bucketed layouts)
    pub fn load(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = SessionStore::new(root);
        let mut manager = Self {
            store,
            sessions: HashMap::new(),
            by_project: HashMap::new(),
            compress_threshold: DEFAULT_COMPRESS_THRESHOLD,
        };
        for session in manager.store.load_all()? {
            manager.index(&session);
            manager.sessions.insert(session.id.clone(), session);
        }
        info!(count = manager.sessions.len(), "session manager loaded");
        Ok(manager)
    }

    pub fn with_compress_threshold(mut self, threshold: usize) -> Self {
        self.compress_threshold = threshold.max(1);
        self
    }

    fn index(&mut self, session: &Session) {
        let ids = self.by_project.entry(session.project_dir.clone()).or_default();
        if !ids.contains(&session.id) {
            ids.push(session.id.clone());
        }
    }

    // === Lifecycle ===

    pub fn create_session(&mut self, name: &str, project_dir: &Path) -> Result<Session, StoreError> {
        let session = Session::new(name, project_dir);
        debug!(session_id = %session.id, project = %session.project_dir.display(), "create_session");
        self.store.save(&session)?;
        self.index(&session);
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    pub fn get_session(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    pub fn sessions_for_project(&self, project_dir: &Path) -> Vec<&Session> {
        let normalized = normalize_project_dir(project_dir);
        self.by_project
            .get(&normalized)
            .map(|ids| ids.iter().filter_map(|id| self.sessions.get(id)).collect())
            .unwrap_or_default()
    }

    /// The most-recently-accessed session, for auto-resume
    pub fn auto_resume(&mut self) -> Option<Session> {
        let id = self
            .sessions
            .values()
            .max_by_key(|s| s.last_accessed_at)
            .map(|s| s.id.clone())?;
        let session = self.sessions.get_mut(&id)?;
        session.touch();
        let snapshot = session.clone();
        let _ = self.store.save(&snapshot);
        Some(snapshot)
    }

    pub fn delete_session(&mut self, session_id: &str) -> Result<(), StoreError> {
        let session = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        if let Some(ids) = self.by_project.get_mut(&session.project_dir) {
            ids.retain(|id| id != session_id);
            if ids.is_empty() {
                self.by_project.remove(&session.project_dir);
            }
        }
        self.store.delete(&session)
    }

    // === Messages & context ===

    /// Append a message, persist, and compress when the log is long
    pub fn add_message(&mut self, session_id: &str, message: Message) -> Result<(), StoreError> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        session.push_message(message);

        if session.messages.len() > self.compress_threshold {
            Self::compress(session, self.compress_threshold);
        }
        let snapshot = session.clone();
        self.store.save(&snapshot)
    }

    pub fn set_context(&mut self, session_id: &str, key: &str, value: serde_json::Value) -> Result<(), StoreError> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        session.set_context(key, value);
        let snapshot = session.clone();
        self.store.save(&snapshot)
    }

    pub fn add_workflow(&mut self, session_id: &str, workflow_id: &str) -> Result<(), StoreError> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        if !session.active_workflows.iter().any(|w| w == workflow_id) {
            session.active_workflows.push(workflow_id.to_string());
        }
        let snapshot = session.clone();
        self.store.save(&snapshot)
    }

    /// Force compression regardless of threshold (manual compaction)
    pub fn compress_context(&mut self, session_id: &str) -> Result<(), StoreError> {
        let threshold = self.compress_threshold;
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        Self::compress(session, threshold);
        let snapshot = session.clone();
        self.store.save(&snapshot)
    }

    /// Trim the oldest messages beyond `keep` into one summary under
    /// `context.compressedHistory`: up to 100 chars per user message plus
    /// the set of task identifiers seen.
    fn compress(session: &mut Session, keep: usize) {
        if session.messages.len() <= keep {
            return;
        }
        let cut = session.messages.len() - keep;
        let trimmed: Vec<Message> = session.messages.drain(..cut).collect();

        let mut lines: Vec<String> = Vec::new();
        // Task identifiers accumulate across compression passes.
        let mut task_ids: Vec<String> = session
            .context
            .get(COMPRESSED_HISTORY_KEY)
            .and_then(|v| v.get("taskIds"))
            .and_then(|v| v.as_array())
            .map(|ids| ids.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();
        for message in &trimmed {
            if message.role == sessionstore::MessageRole::User {
                let excerpt: String = message.content.chars().take(100).collect();
                lines.push(excerpt);
            }
            if let Some(task_id) = &message.task_id
                && !task_ids.contains(task_id)
            {
                task_ids.push(task_id.clone());
            }
        }

        // Extend an existing summary rather than replacing it.
        let previous = session
            .context
            .get(COMPRESSED_HISTORY_KEY)
            .and_then(|v| v.get("summary"))
            .and_then(|v| v.as_str())
            .map(String::from);
        let mut summary = previous.unwrap_or_default();
        if !summary.is_empty() && !lines.is_empty() {
            summary.push('\n');
        }
        summary.push_str(&lines.join("\n"));

        debug!(session_id = %session.id, trimmed = trimmed.len(), "compressed session history");
        session.set_context(
            COMPRESSED_HISTORY_KEY,
            json!({
                "summary": summary,
                "taskIds": task_ids,
                "trimmedMessages": trimmed.len(),
            }),
        );
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sessionstore::MessageRole;
    use tempfile::tempdir;

    fn user_message(text: &str) -> Message {
        Message::new(MessageRole::User, text).unwrap()
    }

    #[test]
    fn test_create_and_reload() {
        let temp = tempdir().unwrap();
        let session_id = {
            let mut mgr = SessionManager::load(temp.path()).unwrap();
            let session = mgr.create_session("demo", Path::new("/tmp/proj")).unwrap();
            mgr.add_message(&session.id, user_message("hello")).unwrap();
            session.id
        };

        let mgr = SessionManager::load(temp.path()).unwrap();
        assert_eq!(mgr.session_count(), 1);
        let session = mgr.get_session(&session_id).unwrap();
        assert_eq!(session.messages.len(), 1);
    }

    #[test]
    fn test_project_index() {
        let temp = tempdir().unwrap();
        let mut mgr = SessionManager::load(temp.path()).unwrap();
        mgr.create_session("a", Path::new("/tmp/proj-a")).unwrap();
        mgr.create_session("b", Path::new("/tmp/proj-a")).unwrap();
        mgr.create_session("c", Path::new("/tmp/proj-b")).unwrap();

        assert_eq!(mgr.sessions_for_project(Path::new("/tmp/proj-a")).len(), 2);
        assert_eq!(mgr.sessions_for_project(Path::new("/tmp/proj-a/../proj-b")).len(), 1);
    }

    #[test]
    fn test_auto_resume_picks_most_recent() {
        let temp = tempdir().unwrap();
        let mut mgr = SessionManager::load(temp.path()).unwrap();
        let _old = mgr.create_session("old", Path::new("/tmp/a")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let new = mgr.create_session("new", Path::new("/tmp/b")).unwrap();

        let resumed = mgr.auto_resume().unwrap();
        assert_eq!(resumed.id, new.id);
    }

    #[test]
    fn test_compression_trims_and_summarizes() {
        let temp = tempdir().unwrap();
        let mut mgr = SessionManager::load(temp.path()).unwrap().with_compress_threshold(5);
        let session = mgr.create_session("demo", Path::new("/tmp/p")).unwrap();

        for i in 0..8 {
            let mut msg = user_message(&format!("message number {}", i));
            if i == 1 {
                msg = msg.with_task("task-42");
            }
            mgr.add_message(&session.id, msg).unwrap();
        }

        let session = mgr.get_session(&session.id).unwrap();
        assert_eq!(session.messages.len(), 5);

        let compressed = &session.context[COMPRESSED_HISTORY_KEY];
        let summary = compressed["summary"].as_str().unwrap();
        assert!(summary.contains("message number 0"));
        assert!(!summary.contains("message number 7"), "recent messages stay whole");
        assert_eq!(compressed["taskIds"][0], "task-42");
    }

    #[test]
    fn test_compression_caps_user_excerpt_at_100_chars() {
        let temp = tempdir().unwrap();
        let mut mgr = SessionManager::load(temp.path()).unwrap().with_compress_threshold(1);
        let session = mgr.create_session("demo", Path::new("/tmp/p")).unwrap();

        mgr.add_message(&session.id, user_message(&"x".repeat(500))).unwrap();
        mgr.add_message(&session.id, user_message("tail")).unwrap();

        let session = mgr.get_session(&session.id).unwrap();
        let summary = session.context[COMPRESSED_HISTORY_KEY]["summary"].as_str().unwrap();
        assert_eq!(summary.len(), 100);
    }

    #[test]
    fn test_delete_session() {
        let temp = tempdir().unwrap();
        let mut mgr = SessionManager::load(temp.path()).unwrap();
        let session = mgr.create_session("demo", Path::new("/tmp/p")).unwrap();

        mgr.delete_session(&session.id).unwrap();
        assert!(mgr.get_session(&session.id).is_none());
        assert!(mgr.sessions_for_project(Path::new("/tmp/p")).is_empty());
        assert!(matches!(mgr.delete_session(&session.id), Err(StoreError::NotFound(_))));

        let reloaded = SessionManager::load(temp.path()).unwrap();
        assert_eq!(reloaded.session_count(), 0);
    }

    #[test]
    fn test_add_workflow_is_idempotent() {
        let temp = tempdir().unwrap();
        let mut mgr = SessionManager::load(temp.path()).unwrap();
        let session = mgr.create_session("demo", Path::new("/tmp/p")).unwrap();

        mgr.add_workflow(&session.id, "wf-1").unwrap();
        mgr.add_workflow(&session.id, "wf-1").unwrap();
        assert_eq!(mgr.get_session(&session.id).unwrap().active_workflows, vec!["wf-1"]);
    }
}
