//! Task graph - the dynamic set of task nodes inside a phase

use serde::{Deserialize, Serialize};

/// Lifecycle status of a task node.
///
/// `ready` requires every dependency completed; `in_progress` implies a
/// live allocation; `completed` and `failed` are absorbing within the
/// current phase (replanning may rebuild the graph).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    InProgress,
    Completed,
    Failed,
    Blocked,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Blocked => "blocked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "ready" => Some(TaskStatus::Ready),
            "in_progress" => Some(TaskStatus::InProgress),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "blocked" => Some(TaskStatus::Blocked),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Last execution result recorded on a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    #[serde(default)]
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One node in the task graph
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskNode {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    /// Identity in the external tracker
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracker_id: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_result: Option<TaskResult>,
    #[serde(default)]
    pub iterations: u32,
}

impl TaskNode {
    pub fn new(id: impl Into<String>, description: impl Into<String>, dependencies: Vec<String>) -> Self {
        let status = if dependencies.is_empty() {
            TaskStatus::Ready
        } else {
            TaskStatus::Blocked
        };
        Self {
            id: id.into(),
            description: description.into(),
            status,
            assignee: None,
            tracker_id: None,
            dependencies,
            last_result: None,
            iterations: 0,
        }
    }
}

/// The orchestrator's task graph (insertion-ordered)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskGraph {
    tasks: Vec<TaskNode>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole graph (the PLAN phase semantics)
    pub fn replace(&mut self, tasks: Vec<TaskNode>) {
        self.tasks = tasks;
        self.refresh_readiness();
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn tasks(&self) -> &[TaskNode] {
        &self.tasks
    }

    pub fn get(&self, id: &str) -> Option<&TaskNode> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut TaskNode> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    /// Promote blocked/pending tasks whose dependencies all completed
    pub fn refresh_readiness(&mut self) {
        let completed: Vec<String> = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id.clone())
            .collect();
        for task in &mut self.tasks {
            if matches!(task.status, TaskStatus::Pending | TaskStatus::Blocked)
                && task.dependencies.iter().all(|dep| completed.contains(dep))
            {
                task.status = TaskStatus::Ready;
            }
        }
    }

    pub fn ready_ids(&self) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Ready)
            .map(|t| t.id.clone())
            .collect()
    }

    pub fn blocked_ids(&self) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Blocked)
            .map(|t| t.id.clone())
            .collect()
    }

    pub fn failed_ids(&self) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .map(|t| t.id.clone())
            .collect()
    }

    pub fn completed_count(&self) -> usize {
        self.tasks.iter().filter(|t| t.status == TaskStatus::Completed).count()
    }

    /// completed / total; 0.0 on an empty graph
    pub fn completion_rate(&self) -> f64 {
        if self.tasks.is_empty() {
            0.0
        } else {
            self.completed_count() as f64 / self.tasks.len() as f64
        }
    }

    pub fn all_terminal(&self) -> bool {
        self.tasks.iter().all(|t| t.status.is_terminal())
    }

    /// Check the readiness invariant: every `ready` task's dependencies
    /// resolve to `completed` tasks. Returns offending task ids.
    pub fn readiness_violations(&self) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Ready)
            .filter(|t| {
                t.dependencies
                    .iter()
                    .any(|dep| self.get(dep).map(|d| d.status != TaskStatus::Completed).unwrap_or(true))
            })
            .map(|t| t.id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_with_dep_chain() -> TaskGraph {
        let mut graph = TaskGraph::new();
        graph.replace(vec![
            TaskNode::new("task-1", "create file X", vec![]),
            TaskNode::new("task-2", "create file Y", vec!["task-1".to_string()]),
        ]);
        graph
    }

    #[test]
    fn test_initial_readiness() {
        let graph = graph_with_dep_chain();
        assert_eq!(graph.get("task-1").unwrap().status, TaskStatus::Ready);
        assert_eq!(graph.get("task-2").unwrap().status, TaskStatus::Blocked);
        assert_eq!(graph.ready_ids(), vec!["task-1"]);
    }

    #[test]
    fn test_completion_unblocks_dependents() {
        let mut graph = graph_with_dep_chain();
        graph.get_mut("task-1").unwrap().status = TaskStatus::Completed;
        graph.refresh_readiness();

        assert_eq!(graph.get("task-2").unwrap().status, TaskStatus::Ready);
        assert!(graph.readiness_violations().is_empty());
    }

    #[test]
    fn test_readiness_invariant_detects_violation() {
        let mut graph = graph_with_dep_chain();
        // Force task-2 ready while its dependency is incomplete.
        graph.get_mut("task-2").unwrap().status = TaskStatus::Ready;
        assert_eq!(graph.readiness_violations(), vec!["task-2"]);
    }

    #[test]
    fn test_completion_rate() {
        let mut graph = graph_with_dep_chain();
        assert_eq!(graph.completion_rate(), 0.0);
        graph.get_mut("task-1").unwrap().status = TaskStatus::Completed;
        assert_eq!(graph.completion_rate(), 0.5);
        graph.get_mut("task-2").unwrap().status = TaskStatus::Completed;
        assert_eq!(graph.completion_rate(), 1.0);
        assert!(graph.all_terminal());
    }

    #[test]
    fn test_empty_graph() {
        let graph = TaskGraph::new();
        assert_eq!(graph.completion_rate(), 0.0);
        assert!(graph.all_terminal(), "vacuously terminal");
        assert!(graph.is_empty());
    }

    #[test]
    fn test_missing_dependency_never_ready() {
        let mut graph = TaskGraph::new();
        graph.replace(vec![TaskNode::new("task-1", "x", vec!["ghost".to_string()])]);
        graph.refresh_readiness();
        assert_eq!(graph.get("task-1").unwrap().status, TaskStatus::Blocked);
    }
}
