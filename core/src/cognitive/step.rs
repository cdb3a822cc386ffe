//! Step reduction: turns a raw tool invocation into a compact, loggable record.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

const MAX_ARG_STRING_LEN: usize = 100;

/// Per-run monotonic `step_NNN` id generator. Each cognitive run owns one
/// (via its `ToolExecutor`) so two concurrent runs never interleave ids.
#[derive(Debug)]
pub struct StepIdCounter(AtomicU64);

impl StepIdCounter {
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    /// Restarts numbering at `step_001`. Call at the start of a fresh run.
    pub fn reset(&self) {
        self.0.store(1, Ordering::SeqCst);
    }

    fn next(&self) -> String {
        let n = self.0.fetch_add(1, Ordering::SeqCst);
        format!("step_{n:03}")
    }
}

impl Default for StepIdCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Reduced record of one tool execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub id: String,
    pub tool_name: String,
    pub minimal_args: Value,
    pub observation: String,
    pub success: bool,
    pub timestamp_ms: i64,
    pub outcome_ref: Option<String>,
    pub error: Option<String>,
    pub metadata: Value,
}

/// `{id, summary}`; formed from a Step or from a group summary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompactStep {
    pub id: String,
    pub summary: String,
}

impl CompactStep {
    pub fn render(&self) -> String {
        format!("• {}", self.summary)
    }
}

/// Output of the compactor: what a ReAct prompt actually sees.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompactedHistory {
    pub recent_steps: Vec<Step>,
    pub compact_steps: Vec<CompactStep>,
    pub dropped_count: usize,
    pub total_original: usize,
}

/// Truncates a string to `MAX_ARG_STRING_LEN` chars, keeping args readable in prompts.
fn truncate(s: &str) -> String {
    if s.chars().count() <= MAX_ARG_STRING_LEN {
        s.to_string()
    } else {
        s.chars().take(MAX_ARG_STRING_LEN).collect::<String>() + "..."
    }
}

/// Summarizes an arbitrary JSON value the way StepReducer summarizes args:
/// strings truncated, arrays/objects shown as cardinality.
fn summarize_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(truncate(s)),
        Value::Array(items) => Value::String(format!("[{} items]", items.len())),
        Value::Object(map) => Value::String(format!("{{{} keys}}", map.len())),
        other => other.clone(),
    }
}

fn minimal_args(args: &Value) -> Value {
    match args {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), summarize_value(v));
            }
            Value::Object(out)
        }
        other => summarize_value(other),
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn human_size(bytes: usize) -> String {
    if bytes < 1024 {
        format!("{bytes}B")
    } else {
        format!("{:.1}KB", bytes as f64 / 1024.0)
    }
}

fn arg_str<'a>(args: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| args.get(k)).and_then(Value::as_str)
}

/// Coarse tool category used by the compactor to group contiguous runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCategory {
    File,
    Shell,
    Search,
    Web,
    Other,
}

impl ToolCategory {
    pub fn noun(self) -> &'static str {
        match self {
            ToolCategory::File => "file operations",
            ToolCategory::Shell => "commands executed",
            ToolCategory::Search => "searches",
            ToolCategory::Web => "web fetches",
            ToolCategory::Other => "operations",
        }
    }

    /// Short tag used to group tools in a ReAct system prompt.
    pub fn tag(self) -> &'static str {
        match self {
            ToolCategory::File => "file",
            ToolCategory::Shell => "shell",
            ToolCategory::Search => "search",
            ToolCategory::Web => "web",
            ToolCategory::Other => "other",
        }
    }
}

pub fn categorize(tool_name: &str) -> ToolCategory {
    let family = tool_family(tool_name);
    match family {
        ReducerFamily::FileRead | ReducerFamily::FileWrite | ReducerFamily::FileEdit => ToolCategory::File,
        ReducerFamily::Shell => ToolCategory::Shell,
        ReducerFamily::Search => ToolCategory::Search,
        ReducerFamily::WebFetch => ToolCategory::Web,
        ReducerFamily::Default => ToolCategory::Other,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReducerFamily {
    FileRead,
    FileWrite,
    FileEdit,
    Shell,
    Search,
    WebFetch,
    Default,
}

fn tool_family(tool_name: &str) -> ReducerFamily {
    match tool_name {
        "fs:read_file" | "fs:read" | "read_file" => ReducerFamily::FileRead,
        "fs:write_file" | "fs:write" | "write_file" => ReducerFamily::FileWrite,
        "fs:edit_file" | "fs:edit" | "edit_file" => ReducerFamily::FileEdit,
        "shell:run" | "shell:exec" | "run_command" | "execute" | "system:shell" => ReducerFamily::Shell,
        "fs:search" | "fs:grep" | "search" | "grep" => ReducerFamily::Search,
        "web:fetch" | "web:get" | "http:get" | "fetch_url" => ReducerFamily::WebFetch,
        _ => {
            // Fallback: the portion after the last `:`.
            if let Some((_, suffix)) = tool_name.rsplit_once(':') {
                match suffix {
                    "read_file" | "read" => ReducerFamily::FileRead,
                    "write_file" | "write" => ReducerFamily::FileWrite,
                    "edit_file" | "edit" => ReducerFamily::FileEdit,
                    "run" | "exec" | "shell" => ReducerFamily::Shell,
                    "search" | "grep" => ReducerFamily::Search,
                    "fetch" | "get" => ReducerFamily::WebFetch,
                    _ => ReducerFamily::Default,
                }
            } else {
                ReducerFamily::Default
            }
        }
    }
}

/// Reduces one tool invocation into a `Step`. Dispatches on tool name to a
/// per-family reducer as described by `tool_family`.
pub struct StepReducer;

impl StepReducer {
    pub fn reduce(
        tool_name: &str,
        args: &Value,
        result: Option<&Value>,
        success: bool,
        error: Option<&str>,
        timestamp_ms: i64,
        counter: &StepIdCounter,
    ) -> Step {
        let family = tool_family(tool_name);
        let (observation, metadata) = match family {
            ReducerFamily::FileRead => Self::reduce_file_read(args, result, success, error),
            ReducerFamily::FileWrite => Self::reduce_file_write(args, success, error),
            ReducerFamily::FileEdit => Self::reduce_file_edit(args, success, error),
            ReducerFamily::Shell => Self::reduce_shell(args, result, success, error),
            ReducerFamily::Search => Self::reduce_search(args, result, success, error),
            ReducerFamily::WebFetch => Self::reduce_web_fetch(args, result, success, error),
            ReducerFamily::Default => Self::reduce_default(tool_name, result, success, error),
        };

        Step {
            id: counter.next(),
            tool_name: tool_name.to_string(),
            minimal_args: minimal_args(args),
            observation,
            success,
            timestamp_ms,
            outcome_ref: None,
            error: error.map(str::to_string),
            metadata,
        }
    }

    fn reduce_file_read(args: &Value, result: Option<&Value>, success: bool, error: Option<&str>) -> (String, Value) {
        let path = arg_str(args, &["path", "file_path"]).unwrap_or("?");
        let base = basename(path);
        if !success {
            return (
                format!("Failed to read {base}: {}", error.unwrap_or("unknown error")),
                serde_json::json!({}),
            );
        }
        let content = result.and_then(|r| r.get("content")).and_then(Value::as_str).unwrap_or("");
        let lines = content.lines().count();
        let size = content.len();
        (
            format!("Read {base} ({lines} lines, {})", human_size(size)),
            serde_json::json!({ "lines": lines, "size": size }),
        )
    }

    fn reduce_file_write(args: &Value, success: bool, error: Option<&str>) -> (String, Value) {
        let path = arg_str(args, &["path", "file_path"]).unwrap_or("?");
        let base = basename(path);
        if !success {
            return (
                format!("Failed to write {base}: {}", error.unwrap_or("unknown error")),
                serde_json::json!({}),
            );
        }
        let content = arg_str(args, &["content"]).unwrap_or("");
        let lines = content.lines().count();
        let size = content.len();
        (
            format!("Wrote {base} ({lines} lines, {})", human_size(size)),
            serde_json::json!({ "lines": lines, "size": size }),
        )
    }

    fn reduce_file_edit(args: &Value, success: bool, error: Option<&str>) -> (String, Value) {
        let path = arg_str(args, &["path", "file_path"]).unwrap_or("?");
        let base = basename(path);
        if !success {
            return (
                format!("Failed to edit {base}: {}", error.unwrap_or("unknown error")),
                serde_json::json!({}),
            );
        }
        let old = arg_str(args, &["old_content", "search"]).unwrap_or("");
        let new = arg_str(args, &["new_content", "replace"]).unwrap_or("");
        let delta = new.lines().count() as i64 - old.lines().count() as i64;
        let change = match delta.cmp(&0) {
            std::cmp::Ordering::Greater => format!("+{delta} lines"),
            std::cmp::Ordering::Less => format!("{delta} lines"),
            std::cmp::Ordering::Equal => "modified".to_string(),
        };
        (format!("Edited {base} ({change})"), serde_json::json!({ "delta": delta }))
    }

    fn reduce_shell(args: &Value, result: Option<&Value>, success: bool, error: Option<&str>) -> (String, Value) {
        let command = arg_str(args, &["command", "cmd"]).unwrap_or("?");
        let command = truncate_to(command, 80);
        if !success {
            let exit_code = args.get("exit_code").and_then(Value::as_i64).unwrap_or(1);
            return (
                format!("Command failed (exit {exit_code}): {command}"),
                serde_json::json!({ "exit_code": exit_code }),
            );
        }
        let output = result.and_then(|r| r.get("stdout")).and_then(Value::as_str).unwrap_or("");
        let line_count = output.lines().count();
        let observation = if line_count > 10 {
            format!("Ran `{command}` → {line_count} lines output")
        } else if output.is_empty() {
            format!("Ran `{command}` → (no output)")
        } else {
            let preview = truncate_to(output, 100);
            format!("Ran `{command}` → {preview}")
        };
        (observation, serde_json::json!({ "line_count": line_count }))
    }

    fn reduce_search(args: &Value, result: Option<&Value>, success: bool, error: Option<&str>) -> (String, Value) {
        let query = arg_str(args, &["query", "pattern"]).unwrap_or("?");
        if !success {
            return (
                format!("Search '{query}' failed: {}", error.unwrap_or("unknown error")),
                serde_json::json!({}),
            );
        }
        let matches = match result {
            Some(Value::Array(items)) => items.len(),
            Some(Value::String(s)) => s.lines().count(),
            Some(Value::Object(map)) => map
                .get("matches")
                .and_then(Value::as_array)
                .map(|a| a.len())
                .unwrap_or(0),
            _ => 0,
        };
        (
            format!("Search '{query}' → {matches} matches"),
            serde_json::json!({ "matches": matches }),
        )
    }

    fn reduce_web_fetch(args: &Value, result: Option<&Value>, success: bool, error: Option<&str>) -> (String, Value) {
        let url = arg_str(args, &["url"]).unwrap_or("?");
        let domain = extract_domain(url);
        if !success {
            return (
                format!("Failed to fetch {domain}: {}", error.unwrap_or("unknown error")),
                serde_json::json!({}),
            );
        }
        let size = result
            .and_then(|r| r.get("content"))
            .and_then(Value::as_str)
            .map(str::len)
            .unwrap_or(0);
        (
            format!("Fetched {domain} ({})", human_size(size)),
            serde_json::json!({ "size": size }),
        )
    }

    fn reduce_default(tool_name: &str, result: Option<&Value>, success: bool, error: Option<&str>) -> (String, Value) {
        if !success {
            return (
                format!("{tool_name} failed: {}", error.unwrap_or("unknown error")),
                serde_json::json!({}),
            );
        }
        let preview = result.map(|r| truncate_to(&r.to_string(), 200)).unwrap_or_default();
        let observation = if preview.is_empty() {
            format!("{tool_name} completed")
        } else {
            format!("{tool_name} → {preview}")
        };
        (observation, serde_json::json!({}))
    }
}

fn truncate_to(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect::<String>() + "..."
    }
}

fn extract_domain(url: &str) -> String {
    let re = regex::Regex::new(r"https?://([^/]+)").expect("static regex is valid");
    re.captures(url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| truncate_to(url, 50))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduces_successful_file_read() {
        let args = serde_json::json!({ "path": "src/big.txt" });
        let result = serde_json::json!({ "content": "line1\nline2\nline3" });
        let counter = StepIdCounter::new();
        let step = StepReducer::reduce("fs:read_file", &args, Some(&result), true, None, 0, &counter);
        assert!(step.observation.starts_with("Read big.txt (3 lines,"));
        assert!(step.success);
    }

    #[test]
    fn reduces_failed_shell_with_exit_code() {
        let args = serde_json::json!({ "command": "ls /nope", "exit_code": 2 });
        let counter = StepIdCounter::new();
        let step = StepReducer::reduce("system:shell", &args, None, false, Some("no such file"), 0, &counter);
        assert_eq!(step.observation, "Command failed (exit 2): ls /nope");
    }

    #[test]
    fn reduces_file_edit_with_signed_delta() {
        let args = serde_json::json!({ "path": "f.rs", "old_content": "a\nb\nc", "new_content": "a" });
        let counter = StepIdCounter::new();
        let step = StepReducer::reduce("fs:edit_file", &args, None, true, None, 0, &counter);
        assert_eq!(step.observation, "Edited f.rs (-2 lines)");
    }

    #[test]
    fn reduction_is_idempotent_for_identical_input() {
        let args = serde_json::json!({ "path": "a.txt" });
        let result = serde_json::json!({ "content": "x\ny" });
        let counter_a = StepIdCounter::new();
        let counter_b = StepIdCounter::new();
        let a = StepReducer::reduce("fs:read_file", &args, Some(&result), true, None, 0, &counter_a);
        let b = StepReducer::reduce("fs:read_file", &args, Some(&result), true, None, 0, &counter_b);
        assert_eq!(a.tool_name, b.tool_name);
        assert_eq!(a.minimal_args, b.minimal_args);
        assert_eq!(a.observation, b.observation);
        assert_eq!(a.success, b.success);
        assert_eq!(a.metadata, b.metadata);
    }

    #[test]
    fn categorizes_aliases_consistently() {
        assert_eq!(categorize("fs:read_file"), ToolCategory::File);
        assert_eq!(categorize("shell:run"), ToolCategory::Shell);
        assert_eq!(categorize("web:fetch"), ToolCategory::Web);
        assert_eq!(categorize("fs:grep"), ToolCategory::Search);
        assert_eq!(categorize("custom:thing"), ToolCategory::Other);
    }

    #[test]
    fn domain_extraction_falls_back_to_truncated_url() {
        assert_eq!(extract_domain("https://example.com/a/b"), "example.com");
        assert_eq!(extract_domain("not-a-url"), "not-a-url");
    }
}
