//! Capability inference for task dispatch
//!
//! Maps a task description to resource requirements through a table of
//! keyword rules. This is a lexical heuristic (substring match over the
//! lowercased description), not semantic parsing; the table is plain data
//! so operators can inspect and extend it from configuration.

use serde::{Deserialize, Serialize};

use super::types::{Requirement, ResourceType};

/// One inference rule: when `keyword` appears in a task description, the
/// task requires a resource of `resource_type` carrying `capability`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CapabilityRule {
    pub keyword: String,
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    pub capability: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_level: Option<u8>,
}

impl CapabilityRule {
    pub fn new(keyword: &str, resource_type: ResourceType, capability: &str) -> Self {
        Self {
            keyword: keyword.to_string(),
            resource_type,
            capability: capability.to_string(),
            min_level: None,
        }
    }
}

/// The built-in rule table
pub fn default_rules() -> Vec<CapabilityRule> {
    use ResourceType::*;
    vec![
        CapabilityRule::new("file", Executor, "file_ops"),
        CapabilityRule::new("write", Executor, "file_ops"),
        CapabilityRule::new("create", Executor, "file_ops"),
        CapabilityRule::new("read", Executor, "file_ops"),
        CapabilityRule::new("search", Executor, "web_search"),
        CapabilityRule::new("web", Executor, "web_search"),
        CapabilityRule::new("research", Executor, "web_search"),
        CapabilityRule::new("command", Executor, "shell_ops"),
        CapabilityRule::new("run", Executor, "shell_ops"),
        CapabilityRule::new("script", Executor, "shell_ops"),
        CapabilityRule::new("review", Reviewer, "code_review"),
        CapabilityRule::new("api", Api, "api_integration"),
        CapabilityRule::new("endpoint", Api, "api_integration"),
        CapabilityRule::new("database", Database, "database_ops"),
        CapabilityRule::new("sql", Database, "database_ops"),
    ]
}

/// Infer the requirements for a task description.
///
/// Each matching rule contributes one requirement; duplicates by
/// (type, capability) collapse. A description matching no rule still
/// needs someone to do the work, so it falls back to a bare executor.
pub fn infer_requirements(description: &str, rules: &[CapabilityRule]) -> Vec<Requirement> {
    let haystack = description.to_lowercase();
    let mut requirements: Vec<Requirement> = Vec::new();

    for rule in rules {
        if !haystack.contains(&rule.keyword.to_lowercase()) {
            continue;
        }
        let duplicate = requirements.iter().any(|r| {
            r.resource_type == rule.resource_type && r.capabilities.first().map(String::as_str) == Some(&rule.capability)
        });
        if duplicate {
            continue;
        }
        let mut req = Requirement {
            resource_type: rule.resource_type,
            min_level: rule.min_level,
            capabilities: vec![rule.capability.clone()],
            optional: false,
        };
        if rule.min_level.is_none() {
            req.min_level = None;
        }
        requirements.push(req);
    }

    if requirements.is_empty() {
        requirements.push(Requirement::executor());
    }
    requirements
}
