//! Executes a tool call on behalf of the cognitive loop: permission gating
//! for destructive tools, bridge-routed dispatch for everything else, and a
//! sandboxed local-execution fallback once a destructive call is approved.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::tools::resolve_within_workspace;
use crate::transport::EventContext;

use super::offloader::{category_for_tool, identifier_for, DataOffloader};
use super::step::{Step, StepIdCounter, StepReducer};

const SHELL_TIMEOUT: Duration = Duration::from_secs(30);

/// Tools that always require an explicit approval before they run, whether
/// dispatched to the bridge or executed locally.
pub fn tools_requiring_approval() -> &'static [&'static str] {
    &["fs:write_file", "fs:delete"]
}

/// `(tool_name, arguments, reason) -> approved`. Returning false, or the
/// callback being absent, denies the call outright.
pub type PermissionCallback =
    Arc<dyn Fn(&str, &Value, &str) -> bool + Send + Sync + 'static>;

fn approval_reason(tool_name: &str, args: &Value) -> String {
    match tool_name {
        "fs:write_file" => {
            let path = args.get("path").and_then(Value::as_str).unwrap_or("?");
            let preview = args
                .get("content")
                .and_then(Value::as_str)
                .map(|c| c.chars().take(100).collect::<String>())
                .unwrap_or_default();
            format!("Write to file '{path}' (content: {preview})")
        }
        "fs:delete" => {
            let path = args.get("path").and_then(Value::as_str).unwrap_or("?");
            format!("Delete file or directory '{path}'")
        }
        other => format!("Destructive operation: {other}"),
    }
}

pub struct ToolExecutor {
    context: EventContext,
    offloader: DataOffloader,
    permission_callback: Option<PermissionCallback>,
    approved_this_run: Arc<Mutex<HashSet<String>>>,
    workspace_root: PathBuf,
    step_counter: StepIdCounter,
}

impl ToolExecutor {
    pub fn new(
        context: EventContext,
        offloader: DataOffloader,
        workspace_root: PathBuf,
        permission_callback: Option<PermissionCallback>,
    ) -> Self {
        Self {
            context,
            offloader,
            permission_callback,
            approved_this_run: Arc::new(Mutex::new(HashSet::new())),
            workspace_root,
            step_counter: StepIdCounter::new(),
        }
    }

    /// Restarts this executor's `step_NNN` numbering at `step_001`. Call at
    /// the start of a fresh cognitive run.
    pub fn reset_step_counter(&self) {
        self.step_counter.reset();
    }

    /// Executes `tool_name(arguments)`, always producing a `Step` even on
    /// failure (error text carried in both `Step.error` and the raw output).
    pub async fn execute(&self, tool_name: &str, arguments: Value) -> Step {
        let now_ms = chrono::Utc::now().timestamp_millis();

        let outcome = if tools_requiring_approval().contains(&tool_name) {
            self.execute_destructive(tool_name, &arguments).await
        } else {
            self.execute_remote_with_reprompt(tool_name, &arguments).await
        };

        match outcome {
            Ok(output) => self.reduce_success(tool_name, &arguments, output, now_ms).await,
            Err(message) => {
                StepReducer::reduce(tool_name, &arguments, None, false, Some(&message), now_ms, &self.step_counter)
            }
        }
    }

    async fn is_approved(&self, tool_name: &str, arguments: &Value) -> bool {
        {
            let approved = self.approved_this_run.lock().await;
            if approved.contains(tool_name) {
                return true;
            }
        }

        let Some(callback) = &self.permission_callback else {
            return false;
        };
        let reason = approval_reason(tool_name, arguments);
        tracing::debug!(tool = %tool_name, reason = %reason, "requesting approval for destructive tool");
        let approved = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(tool_name, arguments, &reason)))
            .unwrap_or(false);

        if approved {
            self.approved_this_run.lock().await.insert(tool_name.to_string());
        }
        approved
    }

    async fn execute_destructive(&self, tool_name: &str, arguments: &Value) -> Result<Value, String> {
        if !self.is_approved(tool_name, arguments).await {
            return Err("Action denied by user".to_string());
        }
        self.execute_locally(tool_name, arguments).await
    }

    async fn execute_remote_with_reprompt(&self, tool_name: &str, arguments: &Value) -> Result<Value, String> {
        match self.context.tool(tool_name, Some(arguments.clone()), 5000, None).await {
            Ok(output) => serde_json::from_str(&output).map_err(|e| e.to_string()),
            Err(err) => {
                let message = err.to_string();
                if message.contains("Permission denied") && self.permission_callback.is_some() {
                    if self.is_approved(tool_name, arguments).await {
                        return self.execute_locally(tool_name, arguments).await;
                    }
                }
                Err(message)
            }
        }
    }

    /// Dispatches by exact tool name to the one of three defined local
    /// execution bodies. Any other approved tool name is rejected: only
    /// these three have sandboxed local bodies.
    async fn execute_locally(&self, tool_name: &str, arguments: &Value) -> Result<Value, String> {
        match tool_name {
            "system:shell" => self.local_shell(arguments).await,
            "fs:write_file" => self.local_write(arguments).await,
            "fs:delete" => self.local_delete(arguments).await,
            _ => Err("Cannot approve this tool type dynamically".to_string()),
        }
    }

    async fn local_shell(&self, arguments: &Value) -> Result<Value, String> {
        let command = arguments
            .get("command")
            .and_then(Value::as_str)
            .ok_or("Missing 'command' argument")?;
        let mut argv: Vec<String> = vec![command.to_string()];
        if let Some(extra) = arguments.get("args").and_then(Value::as_array) {
            argv.extend(extra.iter().filter_map(|v| v.as_str()).map(str::to_string));
        }

        let (program, rest) = argv.split_first().ok_or("empty command")?;
        let output = tokio::time::timeout(SHELL_TIMEOUT, tokio::process::Command::new(program).args(rest).output())
            .await
            .map_err(|_| "shell command timed out after 30s".to_string())?
            .map_err(|e| e.to_string())?;

        Ok(serde_json::json!({
            "stdout": String::from_utf8_lossy(&output.stdout),
            "stderr": String::from_utf8_lossy(&output.stderr),
            "exit_code": output.status.code(),
            "approved_by_user": true,
        }))
    }

    fn normalize_within_workspace(&self, relative_path: &str) -> Result<PathBuf, String> {
        resolve_within_workspace(&self.workspace_root, relative_path).map_err(|e| e.to_string())
    }

    async fn local_write(&self, arguments: &Value) -> Result<Value, String> {
        let path_str = arguments.get("path").and_then(Value::as_str).ok_or("Missing 'path' argument")?;
        let content = arguments.get("content").and_then(Value::as_str).ok_or("Missing 'content' argument")?;
        let path = self.normalize_within_workspace(path_str)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| e.to_string())?;
        }
        tokio::fs::write(&path, content).await.map_err(|e| e.to_string())?;

        Ok(serde_json::json!({
            "path": path_str,
            "bytes_written": content.len(),
            "approved_by_user": true,
        }))
    }

    async fn local_delete(&self, arguments: &Value) -> Result<Value, String> {
        let path_str = arguments.get("path").and_then(Value::as_str).ok_or("Missing 'path' argument")?;
        let path = self.normalize_within_workspace(path_str)?;

        if !path.exists() {
            return Err(format!("Path not found: {path_str}"));
        }

        let deleted = if path.is_dir() {
            tokio::fs::remove_dir(&path).await.map_err(|e| e.to_string())?;
            "directory (empty)"
        } else {
            tokio::fs::remove_file(&path).await.map_err(|e| e.to_string())?;
            "file"
        };

        Ok(serde_json::json!({
            "path": path_str,
            "deleted": deleted,
            "approved_by_user": true,
        }))
    }

    async fn reduce_success(&self, tool_name: &str, arguments: &Value, output: Value, timestamp_ms: i64) -> Step {
        let category = category_for_tool(tool_name);
        let identifier = identifier_for(tool_name, arguments, timestamp_ms / 1000);

        let raw = output.to_string();
        let offload = self.offloader.offload(category, &identifier, &raw, false).await.ok();

        let mut step =
            StepReducer::reduce(tool_name, arguments, Some(&output), true, None, timestamp_ms, &self.step_counter);
        if let Some(offload) = offload {
            if offload.offloaded {
                step.outcome_ref = offload.file_path;
            }
        }
        step
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::lexically_normalize;

    #[test]
    fn traversal_outside_workspace_is_rejected() {
        let root = PathBuf::from("/workspace");
        let normalized_root = lexically_normalize(&root);
        let attempt = lexically_normalize(&root.join("../../etc/passwd"));
        assert!(!attempt.starts_with(&normalized_root));
    }

    #[test]
    fn approval_reasons_describe_the_pending_action() {
        let args = serde_json::json!({ "path": "/tmp/x.txt", "content": "hello" });
        assert_eq!(approval_reason("fs:write_file", &args), "Write to file '/tmp/x.txt' (content: hello)");

        let args = serde_json::json!({ "path": "/tmp/x.txt" });
        assert_eq!(approval_reason("fs:delete", &args), "Delete file or directory '/tmp/x.txt'");

        assert_eq!(approval_reason("other:tool", &serde_json::json!({})), "Destructive operation: other:tool");
    }
}
