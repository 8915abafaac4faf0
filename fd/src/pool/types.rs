//! Resource, allocation, and requirement types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Broad category of a worker resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Orchestrator,
    Executor,
    Reviewer,
    Tool,
    Api,
    Database,
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourceType::Orchestrator => "orchestrator",
            ResourceType::Executor => "executor",
            ResourceType::Reviewer => "reviewer",
            ResourceType::Tool => "tool",
            ResourceType::Api => "api",
            ResourceType::Database => "database",
        };
        write!(f, "{}", s)
    }
}

/// A named skill with an integer level 1-10
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    pub level: u8,
}

impl Capability {
    pub fn new(name: impl Into<String>, level: u8) -> Self {
        Self {
            name: name.into(),
            level: level.clamp(1, 10),
        }
    }
}

/// Lifecycle status of a resource.
///
/// Only `available` resources may be allocated; `deployed` and `busy`
/// resources are mutated exclusively by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    Available,
    Deployed,
    Busy,
    Blocked,
    Error,
    Released,
}

/// A worker entity in the pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    pub status: ResourceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_session: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_workflow: Option<String>,
    #[serde(default)]
    pub deployment_count: u64,
    #[serde(default)]
    pub failure_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Resource {
    pub fn new(name: impl Into<String>, resource_type: ResourceType, capabilities: Vec<Capability>) -> Self {
        Self {
            id: format!("res-{}", Uuid::now_v7()),
            name: name.into(),
            resource_type,
            capabilities,
            status: ResourceStatus::Available,
            current_task: None,
            current_session: None,
            current_workflow: None,
            deployment_count: 0,
            failure_count: 0,
            last_error: None,
        }
    }

    /// Level of a named capability, if the resource has it
    pub fn capability_level(&self, name: &str) -> Option<u8> {
        self.capabilities.iter().find(|c| c.name == name).map(|c| c.level)
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capability_level(name).is_some()
    }
}

/// Status of a live or historical allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStatus {
    Pending,
    Allocated,
    Executing,
    Completed,
    Blocked,
    Failed,
}

impl AllocationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AllocationStatus::Completed | AllocationStatus::Blocked | AllocationStatus::Failed
        )
    }
}

/// The binding of a task identity to one or more resources
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    pub task_id: String,
    pub resource_ids: Vec<String>,
    pub status: AllocationStatus,
    pub allocated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub released_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<String>,
}

/// One requirement in an allocation request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Requirement {
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_level: Option<u8>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub optional: bool,
}

impl Requirement {
    pub fn executor() -> Self {
        Self {
            resource_type: ResourceType::Executor,
            min_level: None,
            capabilities: Vec::new(),
            optional: false,
        }
    }

    pub fn with_capability(mut self, name: impl Into<String>) -> Self {
        self.capabilities.push(name.into());
        self
    }

    pub fn with_min_level(mut self, level: u8) -> Self {
        self.min_level = Some(level);
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// Reason a task's resources are released
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseReason {
    Completed,
    Released,
    Blocked(String),
    Error(String),
}

impl ReleaseReason {
    pub fn terminal_status(&self) -> AllocationStatus {
        match self {
            ReleaseReason::Completed => AllocationStatus::Completed,
            ReleaseReason::Released => AllocationStatus::Completed,
            ReleaseReason::Blocked(_) => AllocationStatus::Blocked,
            ReleaseReason::Error(_) => AllocationStatus::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_level_clamped() {
        assert_eq!(Capability::new("x", 0).level, 1);
        assert_eq!(Capability::new("x", 15).level, 10);
        assert_eq!(Capability::new("x", 7).level, 7);
    }

    #[test]
    fn test_resource_capability_lookup() {
        let res = Resource::new(
            "worker-1",
            ResourceType::Executor,
            vec![Capability::new("file_ops", 9)],
        );
        assert_eq!(res.capability_level("file_ops"), Some(9));
        assert!(!res.has_capability("web_search"));
    }

    #[test]
    fn test_allocation_status_terminal() {
        assert!(AllocationStatus::Completed.is_terminal());
        assert!(AllocationStatus::Failed.is_terminal());
        assert!(!AllocationStatus::Executing.is_terminal());
    }

    #[test]
    fn test_resource_serde_uses_type_key() {
        let res = Resource::new("w", ResourceType::Executor, vec![]);
        let json = serde_json::to_string(&res).unwrap();
        assert!(json.contains("\"type\":\"executor\""));
        assert!(json.contains("\"status\":\"available\""));
    }
}
