//! Kernel wire protocol - line-delimited JSON over stdio
//!
//! Submissions go down as `{id, op}`; events come back as `{id, msg}`.
//! One JSON object per line in both directions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

// === Submissions (daemon -> kernel) ===

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: String,
    pub op: Op,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Op {
    UserTurn {
        items: Vec<InputItem>,
        #[serde(skip_serializing_if = "Option::is_none")]
        options: Option<Box<TurnOptions>>,
    },
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

impl InputItem {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            text: text.into(),
        }
    }
}

/// The enumerated option set a `user_turn` may carry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_items: Option<Vec<HistoryItem>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub developer_instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment_context: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_context: Option<TurnContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window: Option<ContextWindowOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compact: Option<CompactOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fork_user_message_index: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_ledger: Option<ContextLedgerOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responses: Option<ResponsesOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolSpec>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_execution: Option<ToolExecutionOptions>,
}

impl TurnOptions {
    /// Options with the implementer defaults filled in
    pub fn for_session(session_id: &str) -> Self {
        Self {
            session_id: Some(session_id.trim().to_string()),
            mode: Some("main".to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryItem {
    pub role: String,
    pub content: Vec<InputItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextWindowOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_compact_threshold_ratio: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manual: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preserve_user_messages: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary_hint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextLedgerOptions {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_dir: Option<String>,
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub mode: String,
    pub can_read_all: bool,
    #[serde(default)]
    pub readable_agents: Vec<String>,
    pub focus_enabled: bool,
    pub focus_max_chars: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsesOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_tool_calls: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecutionOptions {
    pub daemon_url: String,
    pub agent_id: String,
}

// === Events (kernel -> daemon) ===

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelEvent {
    #[serde(default)]
    pub id: String,
    pub msg: EventMsg,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventMsg {
    SessionConfigured {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    TaskStarted {},
    ToolCall {
        #[serde(default)]
        call_id: String,
        #[serde(default)]
        tool_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
    },
    ToolResult {
        #[serde(default)]
        call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },
    ToolError {
        #[serde(default)]
        call_id: String,
        #[serde(default)]
        error: String,
    },
    ModelRound {
        #[serde(default)]
        round: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finish_reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_status: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input_tokens: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_tokens: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context_window_estimate: Option<u64>,
    },
    TaskComplete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_agent_message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata_json: Option<String>,
    },
    Error {
        #[serde(default)]
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_status: Option<u16>,
    },
    ShutdownComplete,
    PendingInputQueued {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl EventMsg {
    /// Short tag for logging and passthrough events
    pub fn kind(&self) -> &'static str {
        match self {
            EventMsg::SessionConfigured { .. } => "session_configured",
            EventMsg::TaskStarted {} => "task_started",
            EventMsg::ToolCall { .. } => "tool_call",
            EventMsg::ToolResult { .. } => "tool_result",
            EventMsg::ToolError { .. } => "tool_error",
            EventMsg::ModelRound { .. } => "model_round",
            EventMsg::TaskComplete { .. } => "task_complete",
            EventMsg::Error { .. } => "error",
            EventMsg::ShutdownComplete => "shutdown_complete",
            EventMsg::PendingInputQueued { .. } => "pending_input_queued",
        }
    }

    /// Whether this event is forwarded upward as a `kernel_event`
    pub fn is_passthrough(&self) -> bool {
        matches!(
            self,
            EventMsg::ToolCall { .. } | EventMsg::ToolResult { .. } | EventMsg::ToolError { .. } | EventMsg::ModelRound { .. }
        )
    }
}
