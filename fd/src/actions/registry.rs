//! ActionRegistry - named actions with parameter schemas and a uniform
//! result envelope
//!
//! Actions are the only way an agent's decision touches the world. Each
//! action declares a JSON parameter schema; execution returns an
//! [`ActionResult`] value rather than an error, so the driving loop can
//! decide whether to retry, stop, or escalate. Handlers must be
//! idempotent under retry with the same parameters.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Why an action asked the loop to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    Complete,
    Fail,
    Escalate,
}

/// Uniform result envelope for every action
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub should_stop: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
}

impl ActionResult {
    pub fn ok(observation: impl Into<String>) -> Self {
        Self {
            success: true,
            observation: Some(observation.into()),
            ..Default::default()
        }
    }

    pub fn ok_with_data(observation: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            observation: Some(observation.into()),
            data: Some(data),
            ..Default::default()
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Successful terminal result (the loop stops with `complete`)
    pub fn complete(observation: impl Into<String>) -> Self {
        Self {
            success: true,
            observation: Some(observation.into()),
            should_stop: true,
            stop_reason: Some(StopReason::Complete),
            ..Default::default()
        }
    }

    /// Failed terminal result (the loop stops with `fail`)
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            should_stop: true,
            stop_reason: Some(StopReason::Fail),
            ..Default::default()
        }
    }

    /// Abandon the current phase and escalate to the orchestrator
    pub fn escalate(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            should_stop: true,
            stop_reason: Some(StopReason::Escalate),
            ..Default::default()
        }
    }

    /// The observation or, failing that, the error text
    pub fn observation_or_error(&self) -> String {
        self.observation
            .clone()
            .or_else(|| self.error.clone())
            .unwrap_or_default()
    }
}

/// Ambient context handed to every action execution
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub session_id: String,
    pub workdir: PathBuf,
    pub task_id: Option<String>,
    pub agent_id: Option<String>,
}

impl ActionContext {
    pub fn new(session_id: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            session_id: session_id.into(),
            workdir: workdir.into(),
            task_id: None,
            agent_id: None,
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Resolve a possibly-relative path against the working directory
    pub fn resolve(&self, path: &str) -> PathBuf {
        let p = PathBuf::from(path);
        if p.is_absolute() { p } else { self.workdir.join(p) }
    }
}

/// A dispatchable named operation
#[async_trait]
pub trait Action: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON-schema-shaped parameter descriptor
    fn params_schema(&self) -> Value;
    async fn execute(&self, params: Value, ctx: &ActionContext) -> ActionResult;
}

/// Descriptor of a registered action, for listings and prompts
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionSpec {
    pub name: String,
    pub description: String,
    pub params_schema: Value,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("action name already registered: {0}")]
    DuplicateName(String),
}

/// An action built from an async closure, for consumers that wire
/// component state into handlers without a dedicated struct.
pub struct FnAction {
    name: String,
    description: String,
    schema: Value,
    #[allow(clippy::type_complexity)]
    handler: Box<dyn Fn(Value, ActionContext) -> BoxFuture<'static, ActionResult> + Send + Sync>,
}

impl FnAction {
    pub fn new<F>(name: impl Into<String>, description: impl Into<String>, schema: Value, handler: F) -> Self
    where
        F: Fn(Value, ActionContext) -> BoxFuture<'static, ActionResult> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            handler: Box::new(handler),
        }
    }
}

#[async_trait]
impl Action for FnAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn params_schema(&self) -> Value {
        self.schema.clone()
    }

    async fn execute(&self, params: Value, ctx: &ActionContext) -> ActionResult {
        (self.handler)(params, ctx.clone()).await
    }
}

/// Name -> handler map with unique names
#[derive(Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action. Names are unique; re-registering is an error.
    pub fn register(&mut self, action: Arc<dyn Action>) -> Result<(), RegistryError> {
        let name = action.name().to_string();
        debug!(%name, "ActionRegistry::register");
        if self.actions.contains_key(&name) {
            return Err(RegistryError::DuplicateName(name));
        }
        self.actions.insert(name, action);
        Ok(())
    }

    pub fn has(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(name).cloned()
    }

    /// Execute a named action. An unknown name is an `ActionResult`
    /// failure, not a panic or error return.
    pub async fn execute(&self, name: &str, params: Value, ctx: &ActionContext) -> ActionResult {
        debug!(action = %name, "ActionRegistry::execute");
        match self.actions.get(name) {
            Some(action) => action.execute(params, ctx).await,
            None => ActionResult::error(format!("UnknownAction: {}", name)),
        }
    }

    /// Specs of every registered action, sorted by name
    pub fn list(&self) -> Vec<ActionSpec> {
        let mut specs: Vec<ActionSpec> = self
            .actions
            .values()
            .map(|a| ActionSpec {
                name: a.name().to_string(),
                description: a.description().to_string(),
                params_schema: a.params_schema(),
            })
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.actions.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_action() -> Arc<dyn Action> {
        Arc::new(FnAction::new(
            "ECHO",
            "echo the message parameter",
            json!({"type": "object", "properties": {"message": {"type": "string"}}, "required": ["message"]}),
            |params, _ctx| {
                Box::pin(async move {
                    match params["message"].as_str() {
                        Some(m) => ActionResult::ok(m.to_string()),
                        None => ActionResult::error("message is required"),
                    }
                })
            },
        ))
    }

    #[tokio::test]
    async fn test_register_and_execute() {
        let mut registry = ActionRegistry::new();
        registry.register(echo_action()).unwrap();

        let ctx = ActionContext::new("sess-1", "/tmp");
        let result = registry.execute("ECHO", json!({"message": "hi"}), &ctx).await;
        assert!(result.success);
        assert_eq!(result.observation.as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn test_unknown_action_fails_with_unknown_action() {
        let registry = ActionRegistry::new();
        let ctx = ActionContext::new("sess-1", "/tmp");
        let result = registry.execute("NOPE", json!({}), &ctx).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("UnknownAction"));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut registry = ActionRegistry::new();
        registry.register(echo_action()).unwrap();
        assert!(matches!(
            registry.register(echo_action()),
            Err(RegistryError::DuplicateName(_))
        ));
    }

    #[test]
    fn test_list_sorted_with_schemas() {
        let mut registry = ActionRegistry::new();
        registry.register(echo_action()).unwrap();
        registry
            .register(Arc::new(FnAction::new(
                "ABORT",
                "always fails",
                json!({"type": "object"}),
                |_, _| Box::pin(async { ActionResult::fail("aborted") }),
            )))
            .unwrap();

        let specs = registry.list();
        assert_eq!(specs[0].name, "ABORT");
        assert_eq!(specs[1].name, "ECHO");
        assert!(specs[1].params_schema["required"][0] == json!("message"));
    }

    #[test]
    fn test_action_result_constructors() {
        let complete = ActionResult::complete("done");
        assert!(complete.success && complete.should_stop);
        assert_eq!(complete.stop_reason, Some(StopReason::Complete));

        let fail = ActionResult::fail("broken");
        assert!(!fail.success && fail.should_stop);
        assert_eq!(fail.stop_reason, Some(StopReason::Fail));

        let escalate = ActionResult::escalate("stuck");
        assert_eq!(escalate.stop_reason, Some(StopReason::Escalate));
        assert_eq!(escalate.observation_or_error(), "stuck");
    }

    #[test]
    fn test_context_resolve() {
        let ctx = ActionContext::new("s", "/work");
        assert_eq!(ctx.resolve("a.txt"), PathBuf::from("/work/a.txt"));
        assert_eq!(ctx.resolve("/abs/a.txt"), PathBuf::from("/abs/a.txt"));
    }
}
