//! SessionStore - per-project bucketed session persistence
//!
//! Layout on disk:
//!
//! ```text
//! <root>/sessions/<bucket>/<sessionId>.json   current layout
//! <root>/sessions/<sessionId>.json            legacy flat layout (read-only)
//! ```
//!
//! The bucket name is derived from the session's normalized project
//! directory. Legacy flat files are still loaded; when a session with a
//! flat file is saved again, the record moves into its bucket and the flat
//! file is removed. When both copies exist, the bucketed copy wins.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::session::Session;

/// Errors from the persistence layer
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("session not found: {0}")]
    NotFound(String),
}

/// Write `bytes` to `path` atomically (write temp file, then rename).
///
/// The parent directory is created if missing. On any failure the target
/// file is left untouched.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Derive the bucket directory name for a project path.
///
/// Non-alphanumeric characters collapse to `-`; leading separators drop so
/// `/home/u/proj` and `/home/u//proj` land in the same bucket.
pub fn project_bucket(project_dir: &Path) -> String {
    let raw = project_dir.to_string_lossy();
    let mut bucket = String::with_capacity(raw.len());
    let mut last_dash = true;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            bucket.push(c);
            last_dash = false;
        } else if !last_dash {
            bucket.push('-');
            last_dash = true;
        }
    }
    let trimmed = bucket.trim_end_matches('-');
    if trimmed.is_empty() { "default".to_string() } else { trimmed.to_string() }
}

/// File-backed session records, bucketed by project directory
pub struct SessionStore {
    sessions_dir: PathBuf,
}

impl SessionStore {
    /// Create a store with its `sessions/` directory under `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            sessions_dir: root.join("sessions"),
        }
    }

    fn session_path(&self, session: &Session) -> PathBuf {
        self.sessions_dir
            .join(project_bucket(&session.project_dir))
            .join(format!("{}.json", session.id))
    }

    fn legacy_path(&self, session_id: &str) -> PathBuf {
        self.sessions_dir.join(format!("{}.json", session_id))
    }

    /// Persist a session record atomically.
    ///
    /// Lifts a legacy flat file into the bucketed layout as a side effect.
    pub fn save(&self, session: &Session) -> Result<(), StoreError> {
        let path = self.session_path(session);
        debug!(session_id = %session.id, path = %path.display(), "SessionStore::save");

        let bytes = serde_json::to_vec_pretty(session)?;
        write_atomic(&path, &bytes)?;

        // Migration: a flat copy from the legacy layout is superseded now.
        let legacy = self.legacy_path(&session.id);
        if legacy.is_file() {
            debug!(session_id = %session.id, "SessionStore::save: removing legacy flat file");
            if let Err(e) = std::fs::remove_file(&legacy) {
                warn!(session_id = %session.id, error = %e, "failed to remove legacy session file");
            }
        }
        Ok(())
    }

    /// Load every session record on disk.
    ///
    /// Reads both the bucketed and legacy flat layouts; when the same
    /// identity exists in both, the bucketed copy is preferred. Unparseable
    /// files are skipped with a warning.
    pub fn load_all(&self) -> Result<Vec<Session>, StoreError> {
        if !self.sessions_dir.exists() {
            return Ok(Vec::new());
        }

        let mut by_id: HashMap<String, Session> = HashMap::new();
        let mut legacy: Vec<Session> = Vec::new();

        for entry in std::fs::read_dir(&self.sessions_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                for file in std::fs::read_dir(&path)? {
                    let file = file?.path();
                    if let Some(session) = self.read_session_file(&file) {
                        by_id.insert(session.id.clone(), session);
                    }
                }
            } else if path.extension().and_then(|e| e.to_str()) == Some("json")
                && let Some(session) = self.read_session_file(&path)
            {
                legacy.push(session);
            }
        }

        // Bucketed copies win on identity conflict.
        for session in legacy {
            by_id.entry(session.id.clone()).or_insert(session);
        }

        let mut sessions: Vec<Session> = by_id.into_values().collect();
        sessions.sort_by(|a, b| a.last_accessed_at.cmp(&b.last_accessed_at));
        info!(count = sessions.len(), "loaded sessions from disk");
        Ok(sessions)
    }

    fn read_session_file(&self, path: &Path) -> Option<Session> {
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            return None;
        }
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(session) => Some(session),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unparseable session file");
                    None
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read session file");
                None
            }
        }
    }

    /// Remove a session's file and clean up its bucket directory if that
    /// leaves it empty.
    pub fn delete(&self, session: &Session) -> Result<(), StoreError> {
        let path = self.session_path(session);
        debug!(session_id = %session.id, path = %path.display(), "SessionStore::delete");

        if path.is_file() {
            std::fs::remove_file(&path)?;
        } else {
            let legacy = self.legacy_path(&session.id);
            if legacy.is_file() {
                std::fs::remove_file(&legacy)?;
            } else {
                return Err(StoreError::NotFound(session.id.clone()));
            }
        }

        if let Some(bucket_dir) = path.parent()
            && bucket_dir != self.sessions_dir
            && bucket_dir.exists()
            && std::fs::read_dir(bucket_dir)?.next().is_none()
        {
            debug!(dir = %bucket_dir.display(), "SessionStore::delete: removing empty bucket dir");
            std::fs::remove_dir(bucket_dir)?;
        }
        Ok(())
    }

    #[allow(dead_code)]
    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Message, MessageRole};
    use tempfile::tempdir;

    #[test]
    fn test_project_bucket_sanitizes() {
        assert_eq!(project_bucket(Path::new("/home/user/my proj")), "home-user-my-proj");
        assert_eq!(project_bucket(Path::new("/")), "default");
        assert_eq!(project_bucket(Path::new("/a//b/")), "a-b");
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let temp = tempdir().unwrap();
        let store = SessionStore::new(temp.path());

        let mut session = Session::new("demo", "/tmp/proj");
        session.push_message(Message::new(MessageRole::User, "hello").unwrap());
        store.save(&session).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, session.id);
        assert_eq!(loaded[0].messages.len(), 1);
    }

    #[test]
    fn test_bucketed_layout_on_disk() {
        let temp = tempdir().unwrap();
        let store = SessionStore::new(temp.path());

        let session = Session::new("demo", "/tmp/proj");
        store.save(&session).unwrap();

        let expected = temp
            .path()
            .join("sessions")
            .join("tmp-proj")
            .join(format!("{}.json", session.id));
        assert!(expected.is_file());
    }

    #[test]
    fn test_legacy_flat_file_is_loaded() {
        let temp = tempdir().unwrap();
        let store = SessionStore::new(temp.path());

        let session = Session::new("legacy", "/tmp/proj");
        let flat = temp.path().join("sessions").join(format!("{}.json", session.id));
        std::fs::create_dir_all(flat.parent().unwrap()).unwrap();
        std::fs::write(&flat, serde_json::to_vec(&session).unwrap()).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "legacy");
    }

    #[test]
    fn test_duplicate_prefers_bucketed_copy() {
        let temp = tempdir().unwrap();
        let store = SessionStore::new(temp.path());

        let mut session = Session::new("bucketed-name", "/tmp/proj");
        store.save(&session).unwrap();

        // Plant a stale legacy copy with a different name but the same id.
        session.name = "legacy-name".to_string();
        let flat = temp.path().join("sessions").join(format!("{}.json", session.id));
        std::fs::write(&flat, serde_json::to_vec(&session).unwrap()).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "bucketed-name");
    }

    #[test]
    fn test_save_lifts_legacy_file() {
        let temp = tempdir().unwrap();
        let store = SessionStore::new(temp.path());

        let session = Session::new("demo", "/tmp/proj");
        let flat = temp.path().join("sessions").join(format!("{}.json", session.id));
        std::fs::create_dir_all(flat.parent().unwrap()).unwrap();
        std::fs::write(&flat, serde_json::to_vec(&session).unwrap()).unwrap();

        store.save(&session).unwrap();
        assert!(!flat.exists(), "legacy file should be removed on first write");
        assert_eq!(store.load_all().unwrap().len(), 1);
    }

    #[test]
    fn test_delete_removes_file_and_empty_bucket() {
        let temp = tempdir().unwrap();
        let store = SessionStore::new(temp.path());

        let session = Session::new("demo", "/tmp/proj");
        store.save(&session).unwrap();
        store.delete(&session).unwrap();

        assert!(store.load_all().unwrap().is_empty());
        assert!(!temp.path().join("sessions").join("tmp-proj").exists());
    }

    #[test]
    fn test_delete_missing_session_errors() {
        let temp = tempdir().unwrap();
        let store = SessionStore::new(temp.path());
        let session = Session::new("ghost", "/tmp/proj");

        assert!(matches!(store.delete(&session), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_load_all_sorted_by_last_access() {
        let temp = tempdir().unwrap();
        let store = SessionStore::new(temp.path());

        let old = Session::new("old", "/tmp/a");
        std::thread::sleep(std::time::Duration::from_millis(2));
        let new = Session::new("new", "/tmp/b");

        store.save(&new).unwrap();
        store.save(&old).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.last().unwrap().name, "new");
    }
}
