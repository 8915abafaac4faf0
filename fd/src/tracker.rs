//! Task-tracker ("bd") client interface
//!
//! The tracker itself is an external collaborator; the daemon only
//! consumes this small imperative API to mirror epics, tasks, comments,
//! and status changes. [`MemoryTracker`] backs tests and offline
//! operation with the same contract.

use async_trait::async_trait;
use eyre::Result;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Tracker-side status of a mirrored task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerTaskStatus {
    Open,
    Closed,
    Blocked,
}

/// The imperative surface the core consumes
#[async_trait]
pub trait Tracker: Send + Sync {
    /// Record an epic; returns the tracker's epic identity
    async fn create_epic(&self, title: &str, description: &str) -> Result<String>;

    /// Record a child task under an epic; returns the tracker's task identity
    async fn create_task(&self, epic_id: &str, title: &str, description: &str) -> Result<String>;

    async fn add_comment(&self, task_id: &str, comment: &str) -> Result<()>;

    /// Comment at the epic level (design artifacts, phase notes)
    async fn comment_epic(&self, epic_id: &str, comment: &str) -> Result<()>;

    /// Close a task with its result text
    async fn close_task(&self, task_id: &str, result: &str) -> Result<()>;

    /// Mark a task blocked with a failure reason
    async fn block_task(&self, task_id: &str, reason: &str) -> Result<()>;

    async fn close_epic(&self, epic_id: &str) -> Result<()>;

    async fn task_status(&self, task_id: &str) -> Result<Option<TrackerTaskStatus>>;
}

#[derive(Debug, Clone)]
struct TrackedTask {
    #[allow(dead_code)]
    epic_id: String,
    title: String,
    status: TrackerTaskStatus,
    comments: Vec<String>,
}

#[derive(Default)]
struct MemoryTrackerInner {
    epics: HashMap<String, (String, bool)>,
    epic_comments: HashMap<String, Vec<String>>,
    tasks: HashMap<String, TrackedTask>,
}

/// In-memory tracker implementation
#[derive(Default)]
pub struct MemoryTracker {
    inner: Mutex<MemoryTrackerInner>,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Comments recorded for a task, in order
    pub fn comments(&self, task_id: &str) -> Vec<String> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.tasks.get(task_id).map(|t| t.comments.clone()).unwrap_or_default()
    }

    pub fn task_title(&self, task_id: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.tasks.get(task_id).map(|t| t.title.clone())
    }

    pub fn epic_closed(&self, epic_id: &str) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.epics.get(epic_id).map(|(_, closed)| *closed).unwrap_or(false)
    }

    pub fn epic_comments(&self, epic_id: &str) -> Vec<String> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.epic_comments.get(epic_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl Tracker for MemoryTracker {
    async fn create_epic(&self, title: &str, _description: &str) -> Result<String> {
        let id = format!("bd-epic-{}", Uuid::now_v7());
        debug!(%id, %title, "MemoryTracker::create_epic");
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.epics.insert(id.clone(), (title.to_string(), false));
        Ok(id)
    }

    async fn create_task(&self, epic_id: &str, title: &str, _description: &str) -> Result<String> {
        let id = format!("bd-task-{}", Uuid::now_v7());
        debug!(%id, %epic_id, %title, "MemoryTracker::create_task");
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.tasks.insert(
            id.clone(),
            TrackedTask {
                epic_id: epic_id.to_string(),
                title: title.to_string(),
                status: TrackerTaskStatus::Open,
                comments: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn add_comment(&self, task_id: &str, comment: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| eyre::eyre!("tracker task not found: {}", task_id))?;
        task.comments.push(comment.to_string());
        Ok(())
    }

    async fn comment_epic(&self, epic_id: &str, comment: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !inner.epics.contains_key(epic_id) {
            return Err(eyre::eyre!("tracker epic not found: {}", epic_id));
        }
        inner.epic_comments.entry(epic_id.to_string()).or_default().push(comment.to_string());
        Ok(())
    }

    async fn close_task(&self, task_id: &str, result: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| eyre::eyre!("tracker task not found: {}", task_id))?;
        task.status = TrackerTaskStatus::Closed;
        task.comments.push(format!("closed: {}", result));
        Ok(())
    }

    async fn block_task(&self, task_id: &str, reason: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| eyre::eyre!("tracker task not found: {}", task_id))?;
        task.status = TrackerTaskStatus::Blocked;
        task.comments.push(format!("blocked: {}", reason));
        Ok(())
    }

    async fn close_epic(&self, epic_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let epic = inner
            .epics
            .get_mut(epic_id)
            .ok_or_else(|| eyre::eyre!("tracker epic not found: {}", epic_id))?;
        epic.1 = true;
        Ok(())
    }

    async fn task_status(&self, task_id: &str) -> Result<Option<TrackerTaskStatus>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.tasks.get(task_id).map(|t| t.status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_epic_task_lifecycle() {
        let tracker = MemoryTracker::new();
        let epic = tracker.create_epic("build it", "the whole thing").await.unwrap();
        let task = tracker.create_task(&epic, "part one", "first half").await.unwrap();

        assert_eq!(tracker.task_status(&task).await.unwrap(), Some(TrackerTaskStatus::Open));

        tracker.add_comment(&task, "making progress").await.unwrap();
        tracker.close_task(&task, "done").await.unwrap();
        assert_eq!(tracker.task_status(&task).await.unwrap(), Some(TrackerTaskStatus::Closed));
        assert_eq!(tracker.comments(&task), vec!["making progress", "closed: done"]);

        tracker.close_epic(&epic).await.unwrap();
        assert!(tracker.epic_closed(&epic));
    }

    #[tokio::test]
    async fn test_block_task_records_reason() {
        let tracker = MemoryTracker::new();
        let epic = tracker.create_epic("e", "").await.unwrap();
        let task = tracker.create_task(&epic, "t", "").await.unwrap();

        tracker.block_task(&task, "no resources").await.unwrap();
        assert_eq!(tracker.task_status(&task).await.unwrap(), Some(TrackerTaskStatus::Blocked));
        assert!(tracker.comments(&task)[0].contains("no resources"));
    }

    #[tokio::test]
    async fn test_unknown_task_errors() {
        let tracker = MemoryTracker::new();
        assert!(tracker.add_comment("bd-task-missing", "hi").await.is_err());
        assert_eq!(tracker.task_status("bd-task-missing").await.unwrap(), None);
    }
}
