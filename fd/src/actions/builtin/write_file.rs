//! WRITE_FILE action - write content to a file

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::actions::{Action, ActionContext, ActionResult};

/// Write content to a file, creating parent directories as needed.
/// Idempotent: rewriting the same content is a no-op observationally.
pub struct WriteFileAction;

#[async_trait]
impl Action for WriteFileAction {
    fn name(&self) -> &str {
        "WRITE_FILE"
    }

    fn description(&self) -> &str {
        "Write content to a file. Creates parent directories if needed."
    }

    fn params_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path relative to the working directory" },
                "content": { "type": "string", "description": "Content to write" }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ActionContext) -> ActionResult {
        let Some(path) = params["path"].as_str() else {
            return ActionResult::error("path is required");
        };
        let Some(content) = params["content"].as_str() else {
            return ActionResult::error("content is required");
        };

        let full_path = ctx.resolve(path);
        debug!(path = %full_path.display(), bytes = content.len(), "WriteFileAction::execute");

        if let Some(parent) = full_path.parent()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            return ActionResult::error(format!("Failed to create directories: {}", e));
        }
        if let Err(e) = tokio::fs::write(&full_path, content).await {
            return ActionResult::error(format!("Failed to write file: {}", e));
        }

        ActionResult::ok(format!("Wrote {} bytes to {}", content.len(), path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_write_file_basic() {
        let temp = tempdir().unwrap();
        let ctx = ActionContext::new("test", temp.path());

        let result = WriteFileAction
            .execute(serde_json::json!({"path": "out/test.txt", "content": "hello"}), &ctx)
            .await;

        assert!(result.success);
        let written = std::fs::read_to_string(temp.path().join("out/test.txt")).unwrap();
        assert_eq!(written, "hello");
    }

    #[tokio::test]
    async fn test_write_file_is_idempotent() {
        let temp = tempdir().unwrap();
        let ctx = ActionContext::new("test", temp.path());
        let params = serde_json::json!({"path": "x.txt", "content": "same"});

        let first = WriteFileAction.execute(params.clone(), &ctx).await;
        let second = WriteFileAction.execute(params, &ctx).await;
        assert_eq!(first.success, second.success);
        assert_eq!(first.observation, second.observation);
    }

    #[tokio::test]
    async fn test_write_file_missing_params() {
        let temp = tempdir().unwrap();
        let ctx = ActionContext::new("test", temp.path());

        let result = WriteFileAction.execute(serde_json::json!({"path": "x.txt"}), &ctx).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("content"));
    }
}
