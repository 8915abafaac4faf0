//! COMPLETE and FAIL actions - terminal verdicts for a loop

use async_trait::async_trait;
use serde_json::Value;

use crate::actions::{Action, ActionContext, ActionResult};

/// Declare the task done; stops the loop with a `complete` verdict.
pub struct CompleteAction;

#[async_trait]
impl Action for CompleteAction {
    fn name(&self) -> &str {
        "COMPLETE"
    }

    fn description(&self) -> &str {
        "Declare the task complete, with a summary of what was accomplished."
    }

    fn params_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "summary": { "type": "string", "description": "What was accomplished" }
            }
        })
    }

    async fn execute(&self, params: Value, _ctx: &ActionContext) -> ActionResult {
        let summary = params["summary"].as_str().unwrap_or("task complete").to_string();
        ActionResult::complete(summary)
    }
}

/// Declare the task failed; stops the loop with a `fail` verdict.
pub struct FailAction;

#[async_trait]
impl Action for FailAction {
    fn name(&self) -> &str {
        "FAIL"
    }

    fn description(&self) -> &str {
        "Declare the task failed, with the reason."
    }

    fn params_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "reason": { "type": "string", "description": "Why the task cannot be completed" }
            },
            "required": ["reason"]
        })
    }

    async fn execute(&self, params: Value, _ctx: &ActionContext) -> ActionResult {
        let reason = params["reason"].as_str().unwrap_or("unspecified failure").to_string();
        ActionResult::fail(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::StopReason;

    #[tokio::test]
    async fn test_complete_stops_with_summary() {
        let ctx = ActionContext::new("test", "/tmp");
        let result = CompleteAction
            .execute(serde_json::json!({"summary": "all files written"}), &ctx)
            .await;
        assert!(result.success && result.should_stop);
        assert_eq!(result.stop_reason, Some(StopReason::Complete));
        assert_eq!(result.observation.as_deref(), Some("all files written"));
    }

    #[tokio::test]
    async fn test_fail_stops_with_reason() {
        let ctx = ActionContext::new("test", "/tmp");
        let result = FailAction.execute(serde_json::json!({"reason": "no access"}), &ctx).await;
        assert!(!result.success && result.should_stop);
        assert_eq!(result.stop_reason, Some(StopReason::Fail));
        assert_eq!(result.error.as_deref(), Some("no access"));
    }
}
