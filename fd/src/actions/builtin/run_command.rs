//! RUN_COMMAND action - execute a shell command with a timeout

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::actions::{Action, ActionContext, ActionResult};

/// Default command timeout when the caller does not pass one
const DEFAULT_TIMEOUT_MS: u64 = 120_000;

/// Cap on captured output per stream
const MAX_OUTPUT_BYTES: usize = 32 * 1024;

pub struct RunCommandAction;

#[async_trait]
impl Action for RunCommandAction {
    fn name(&self) -> &str {
        "RUN_COMMAND"
    }

    fn description(&self) -> &str {
        "Run a shell command in the working directory, capturing output and exit code."
    }

    fn params_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "Shell command to run" },
                "timeout_ms": { "type": "integer", "description": "Timeout in milliseconds" }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ActionContext) -> ActionResult {
        let Some(command) = params["command"].as_str() else {
            return ActionResult::error("command is required");
        };
        let timeout_ms = params["timeout_ms"].as_u64().unwrap_or(DEFAULT_TIMEOUT_MS);
        debug!(%command, timeout_ms, workdir = %ctx.workdir.display(), "RunCommandAction::execute");

        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&ctx.workdir)
            .output();

        let output = match tokio::time::timeout(Duration::from_millis(timeout_ms), child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return ActionResult::error(format!("Failed to spawn command: {}", e)),
            Err(_) => return ActionResult::error(format!("Command timed out after {}ms", timeout_ms)),
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = clip(&String::from_utf8_lossy(&output.stdout));
        let stderr = clip(&String::from_utf8_lossy(&output.stderr));

        let observation = format!("exit code: {}\nstdout:\n{}\nstderr:\n{}", exit_code, stdout, stderr);
        let data = serde_json::json!({"exitCode": exit_code, "stdout": stdout, "stderr": stderr});

        if output.status.success() {
            ActionResult::ok_with_data(observation, data)
        } else {
            ActionResult {
                success: false,
                observation: Some(observation),
                error: Some(format!("command exited with code {}", exit_code)),
                data: Some(data),
                ..Default::default()
            }
        }
    }
}

fn clip(s: &str) -> String {
    if s.len() > MAX_OUTPUT_BYTES {
        format!("{}...[truncated]", &s[..MAX_OUTPUT_BYTES])
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_run_command_captures_output() {
        let temp = tempdir().unwrap();
        let ctx = ActionContext::new("test", temp.path());

        let result = RunCommandAction
            .execute(serde_json::json!({"command": "echo hello"}), &ctx)
            .await;

        assert!(result.success);
        assert!(result.observation.unwrap().contains("hello"));
        assert_eq!(result.data.unwrap()["exitCode"], 0);
    }

    #[tokio::test]
    async fn test_run_command_nonzero_exit() {
        let temp = tempdir().unwrap();
        let ctx = ActionContext::new("test", temp.path());

        let result = RunCommandAction
            .execute(serde_json::json!({"command": "exit 3"}), &ctx)
            .await;

        assert!(!result.success);
        assert!(result.error.unwrap().contains("3"));
    }

    #[tokio::test]
    async fn test_run_command_timeout() {
        let temp = tempdir().unwrap();
        let ctx = ActionContext::new("test", temp.path());

        let result = RunCommandAction
            .execute(serde_json::json!({"command": "sleep 5", "timeout_ms": 50}), &ctx)
            .await;

        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_run_command_uses_workdir() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("marker.txt"), "x").unwrap();
        let ctx = ActionContext::new("test", temp.path());

        let result = RunCommandAction.execute(serde_json::json!({"command": "ls"}), &ctx).await;
        assert!(result.observation.unwrap().contains("marker.txt"));
    }
}
