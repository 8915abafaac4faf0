//! Event payload types and group catalog

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single event on the bus.
///
/// Events travel by value: the bus owns nothing it fans out. The same
/// shape is serialized as one JSON line for the WebSocket stream and for
/// the per-session JSONL sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Dotted or snake_case event type, e.g. `loop.node.updated`
    #[serde(rename = "type")]
    pub event_type: String,
    /// Session the event belongs to (empty for daemon-scoped events)
    #[serde(default)]
    pub session_id: String,
    /// Emission time (ISO-8601 on the wire)
    pub timestamp: DateTime<Utc>,
    /// Event-specific payload
    #[serde(default)]
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, session_id: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            session_id: session_id.into(),
            timestamp: Utc::now(),
            payload,
            workflow_id: None,
            task_id: None,
            agent_id: None,
        }
    }

    pub fn with_workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// The group this event type belongs to, if any
    pub fn group(&self) -> Option<EventGroup> {
        EventGroup::ALL.iter().copied().find(|g| g.contains(&self.event_type))
    }
}

/// Named sets of event types for group subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventGroup {
    Task,
    Resource,
    HumanInLoop,
    Loop,
    Epic,
    Context,
    Kernel,
}

impl EventGroup {
    pub const ALL: [EventGroup; 7] = [
        EventGroup::Task,
        EventGroup::Resource,
        EventGroup::HumanInLoop,
        EventGroup::Loop,
        EventGroup::Epic,
        EventGroup::Context,
        EventGroup::Kernel,
    ];

    /// Event types in this group
    pub fn members(&self) -> &'static [&'static str] {
        match self {
            EventGroup::Task => &["task_started", "task_completed", "task_failed", "workflow_progress"],
            EventGroup::Resource => &["resource.allocated", "resource.released", "resource_shortage"],
            EventGroup::HumanInLoop => &["epic.user_input_required", "epic.user_input_received"],
            EventGroup::Loop => &[
                "loop.created",
                "loop.queued",
                "loop.started",
                "loop.node.updated",
                "loop.node.completed",
                "loop.completed",
            ],
            EventGroup::Epic => &[
                "epic.created",
                "epic.completed",
                "epic.phase_transition",
                "epic.user_input_required",
            ],
            EventGroup::Context => &["context.compressed"],
            EventGroup::Kernel => &["phase_transition", "kernel_event", "turn_retry"],
        }
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.members().contains(&event_type)
    }

    /// Parse a group name as it appears in subscription requests
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "TASK" => Some(EventGroup::Task),
            "RESOURCE" => Some(EventGroup::Resource),
            "HUMAN_IN_LOOP" => Some(EventGroup::HumanInLoop),
            "LOOP" => Some(EventGroup::Loop),
            "EPIC" => Some(EventGroup::Epic),
            "CONTEXT" => Some(EventGroup::Context),
            "KERNEL" => Some(EventGroup::Kernel),
            _ => None,
        }
    }
}
