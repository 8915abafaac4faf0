//! Per-session JSONL persistence sink for the event bus

use std::io::Write;
use std::path::PathBuf;
use tracing::debug;

use super::types::Event;

/// Appends each event as one JSON line to `<dir>/<sessionId>.jsonl`.
///
/// Events without a session identity go to `daemon.jsonl`.
pub struct EventLogger {
    dir: PathBuf,
}

impl EventLogger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        debug!(dir = %dir.display(), "EventLogger::new");
        Self { dir }
    }

    fn file_for(&self, session_id: &str) -> PathBuf {
        let name = if session_id.is_empty() { "daemon" } else { session_id };
        self.dir.join(format!("{}.jsonl", name))
    }

    /// Append one event line
    pub fn append(&self, event: &Event) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let line = serde_json::to_string(event).unwrap_or_default() + "\n";
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_for(&event.session_id))?;
        file.write_all(line.as_bytes())?;
        file.flush()
    }

    /// Read back all persisted events for a session (oldest first)
    pub fn read_session(&self, session_id: &str) -> std::io::Result<Vec<Event>> {
        let path = self.file_for(session_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}
