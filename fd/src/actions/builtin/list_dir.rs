//! LIST_DIR action - list a directory's entries

use async_trait::async_trait;
use serde_json::Value;

use crate::actions::{Action, ActionContext, ActionResult};

pub struct ListDirAction;

#[async_trait]
impl Action for ListDirAction {
    fn name(&self) -> &str {
        "LIST_DIR"
    }

    fn description(&self) -> &str {
        "List directory entries (directories carry a trailing slash)."
    }

    fn params_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory path; defaults to the working directory" }
            }
        })
    }

    async fn execute(&self, params: Value, ctx: &ActionContext) -> ActionResult {
        let path = params["path"].as_str().unwrap_or(".");
        let full_path = ctx.resolve(path);

        let mut reader = match tokio::fs::read_dir(&full_path).await {
            Ok(r) => r,
            Err(e) => return ActionResult::error(format!("Failed to list {}: {}", path, e)),
        };

        let mut entries = Vec::new();
        while let Ok(Some(entry)) = reader.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            entries.push(if is_dir { format!("{}/", name) } else { name });
        }
        entries.sort();

        ActionResult::ok_with_data(entries.join("\n"), serde_json::json!({"entries": entries}))
    }
}
