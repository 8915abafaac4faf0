//! READ_FILE action - read a file's contents

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::actions::{Action, ActionContext, ActionResult};

/// Maximum bytes returned in one observation
const MAX_READ_BYTES: usize = 64 * 1024;

pub struct ReadFileAction;

#[async_trait]
impl Action for ReadFileAction {
    fn name(&self) -> &str {
        "READ_FILE"
    }

    fn description(&self) -> &str {
        "Read a file's contents. Large files are truncated."
    }

    fn params_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path relative to the working directory" }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ActionContext) -> ActionResult {
        let Some(path) = params["path"].as_str() else {
            return ActionResult::error("path is required");
        };

        let full_path = ctx.resolve(path);
        debug!(path = %full_path.display(), "ReadFileAction::execute");

        match tokio::fs::read_to_string(&full_path).await {
            Ok(content) => {
                let truncated = if content.len() > MAX_READ_BYTES {
                    format!("{}...\n[truncated at {} bytes]", &content[..MAX_READ_BYTES], MAX_READ_BYTES)
                } else {
                    content
                };
                ActionResult::ok(truncated)
            }
            Err(e) => ActionResult::error(format!("Failed to read {}: {}", path, e)),
        }
    }
}
