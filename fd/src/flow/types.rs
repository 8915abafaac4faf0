//! Loop, node, and per-epic flow types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;

/// Phase a loop belongs to within its epic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopPhase {
    Plan,
    Design,
    Execution,
}

impl LoopPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopPhase::Plan => "plan",
            LoopPhase::Design => "design",
            LoopPhase::Execution => "execution",
        }
    }
}

/// Lifecycle status of a loop: queue -> running -> history, exactly once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopStatus {
    Queue,
    Running,
    History,
}

/// Terminal result of a loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl LoopResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            detail: None,
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            detail: Some(detail.into()),
        }
    }
}

/// Author/kind of a loop node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    User,
    Orch,
    Exec,
    Tool,
    Review,
}

/// Node status; `done` and `failed` are final
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Waiting,
    Running,
    Done,
    Failed,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStatus::Done | NodeStatus::Failed)
    }
}

/// One entry in a loop's append-only node list
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopNode {
    /// Identity `N-<loop>-<seq>`
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub status: NodeStatus,
    pub title: String,
    #[serde(default)]
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

/// Draft for a node before the manager assigns its identity
#[derive(Debug, Clone)]
pub struct NodeDraft {
    pub node_type: NodeType,
    pub status: NodeStatus,
    pub title: String,
    pub text: String,
    pub agent_id: Option<String>,
    pub metadata: Option<Value>,
}

impl NodeDraft {
    pub fn new(node_type: NodeType, title: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            node_type,
            status: NodeStatus::Running,
            title: title.into(),
            text: text.into(),
            agent_id: None,
            metadata: None,
        }
    }

    pub fn with_status(mut self, status: NodeStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// One phase-bounded ReAct execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Loop {
    /// Identity `L-<epic>-<phase>-<seq>`
    pub id: String,
    pub epic_id: String,
    pub phase: LoopPhase,
    pub status: LoopStatus,
    /// Append-only node list
    #[serde(default)]
    pub nodes: Vec<LoopNode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_loop_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<LoopResult>,
    /// Per-loop node sequence counter
    #[serde(default)]
    pub node_seq: u64,
}

impl Loop {
    /// Rough token estimate for context accounting (chars / 4)
    pub fn token_estimate(&self) -> u64 {
        let chars: usize = self.nodes.iter().map(|n| n.title.len() + n.text.len()).sum();
        (chars / 4) as u64
    }
}

/// Per-epic context-window accounting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextWindow {
    pub max_tokens: u64,
    pub used_tokens: u64,
    pub compression_threshold: u64,
}

impl ContextWindow {
    pub fn new(max_tokens: u64, compression_threshold: u64) -> Self {
        Self {
            max_tokens,
            used_tokens: 0,
            compression_threshold,
        }
    }
}

/// Record of one compression pass
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressedContext {
    pub original_tokens: u64,
    pub compressed_tokens: u64,
    pub summary: String,
    pub preserved_cycles: usize,
    pub timestamp: DateTime<Utc>,
}

/// The per-epic container of queued, running, and historical loops
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpicTaskFlow {
    pub epic_id: String,
    pub session_id: String,
    /// Current phase or terminal status string
    pub status: String,
    /// Historical loop ids per phase (completion order)
    #[serde(default)]
    pub plan_history: Vec<String>,
    #[serde(default)]
    pub design_history: Vec<String>,
    #[serde(default)]
    pub execution_history: Vec<String>,
    /// Pending loop ids in queue order
    #[serde(default)]
    pub queue: VecDeque<String>,
    /// At most one running loop
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running: Option<String>,
    pub context_window: ContextWindow,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compressed_context: Option<CompressedContext>,
    /// Per-epic loop sequence counter
    #[serde(default)]
    pub loop_seq: u64,
}

impl EpicTaskFlow {
    pub fn new(epic_id: impl Into<String>, session_id: impl Into<String>, window: ContextWindow) -> Self {
        Self {
            epic_id: epic_id.into(),
            session_id: session_id.into(),
            status: "understanding".to_string(),
            plan_history: Vec::new(),
            design_history: Vec::new(),
            execution_history: Vec::new(),
            queue: VecDeque::new(),
            running: None,
            context_window: window,
            compressed_context: None,
            loop_seq: 0,
        }
    }

    pub fn history_for(&self, phase: LoopPhase) -> &Vec<String> {
        match phase {
            LoopPhase::Plan => &self.plan_history,
            LoopPhase::Design => &self.design_history,
            LoopPhase::Execution => &self.execution_history,
        }
    }

    pub fn history_for_mut(&mut self, phase: LoopPhase) -> &mut Vec<String> {
        match phase {
            LoopPhase::Plan => &mut self.plan_history,
            LoopPhase::Design => &mut self.design_history,
            LoopPhase::Execution => &mut self.execution_history,
        }
    }

    /// All historical loop ids across the three lists
    pub fn all_history(&self) -> Vec<String> {
        let mut all = Vec::new();
        all.extend(self.plan_history.iter().cloned());
        all.extend(self.design_history.iter().cloned());
        all.extend(self.execution_history.iter().cloned());
        all
    }
}

/// A registered wait for user input
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingInput {
    pub epic_id: String,
    pub loop_id: String,
    pub node_id: String,
    pub question: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    pub created_at: DateTime<Utc>,
}
