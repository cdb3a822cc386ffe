//! Content-addressed cache for tool outputs too large to re-inject into a prompt.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ToolResult;

#[derive(Debug, Clone)]
pub struct OffloadConfig {
    pub cache_dir: String,
    pub size_threshold: usize,
    pub line_threshold: usize,
    pub preview_lines: usize,
    pub max_age_hours: u64,
    pub enabled: bool,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            cache_dir: ".loom/cache".to_string(),
            size_threshold: 2048,
            line_threshold: 50,
            preview_lines: 10,
            max_age_hours: 24,
            enabled: true,
        }
    }
}

/// `{offloaded, content, file_path?, original_size, original_lines, content_hash}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OffloadResult {
    pub offloaded: bool,
    pub content: String,
    pub file_path: Option<String>,
    pub original_size: usize,
    pub original_lines: usize,
    pub content_hash: String,
}

impl OffloadResult {
    /// Renders a ready-made observation string for callers that want one
    /// instead of the raw fields.
    pub fn to_observation(&self, tool_name: &str) -> String {
        match &self.file_path {
            Some(path) => format!(
                "Output ({} lines, {}) saved to {}\n\nPreview:\n{}",
                self.original_lines,
                human_size(self.original_size),
                path,
                self.content
            ),
            None => format!("{tool_name}: {}", self.content),
        }
    }
}

fn human_size(bytes: usize) -> String {
    if bytes < 1024 {
        format!("{bytes}B")
    } else {
        format!("{:.1}KB", bytes as f64 / 1024.0)
    }
}

fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

fn safe_id(identifier: &str) -> String {
    let replaced = identifier.replace(['/', '\\'], "_");
    let filtered: String = replaced
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '.' || *c == '_' || *c == '-')
        .collect();
    filtered.chars().take(50).collect()
}

fn extension_for(category: &str, content: &str) -> &'static str {
    let trimmed = content.trim_start();
    if category == "search" || category == "json" || trimmed.starts_with('{') || trimmed.starts_with('[') {
        "json"
    } else if category == "shell_output" {
        "log"
    } else {
        "txt"
    }
}

fn preview(content: &str, preview_lines: usize) -> String {
    let lines: Vec<&str> = content.lines().collect();
    if lines.len() <= 2 * preview_lines {
        return content.to_string();
    }
    let head = &lines[..preview_lines];
    let tail = &lines[lines.len() - preview_lines..];
    let omitted = lines.len() - 2 * preview_lines;
    let mut out = head.join("\n");
    out.push_str(&format!("\n... ({omitted} lines omitted) ...\n"));
    out.push_str(&tail.join("\n"));
    out
}

/// Writes large tool output to `<workspace>/<cache_dir>/<category>/<safe_id>_<hash>.<ext>`,
/// idempotent by content hash.
pub struct DataOffloader {
    workspace_root: PathBuf,
    config: OffloadConfig,
}

impl DataOffloader {
    pub fn new(workspace_root: PathBuf, config: OffloadConfig) -> Self {
        Self { workspace_root, config }
    }

    fn category_dir(&self, category: &str) -> PathBuf {
        self.workspace_root.join(&self.config.cache_dir).join(category)
    }

    pub async fn offload(&self, category: &str, identifier: &str, content: &str, force: bool) -> ToolResult<OffloadResult> {
        let hash = content_hash(content);
        let original_lines = content.lines().count();
        let original_size = content.len();

        if !self.config.enabled {
            return Ok(OffloadResult {
                offloaded: false,
                content: content.to_string(),
                file_path: None,
                original_size,
                original_lines,
                content_hash: hash,
            });
        }

        let below_threshold =
            original_size < self.config.size_threshold && original_lines < self.config.line_threshold;
        if below_threshold && !force {
            return Ok(OffloadResult {
                offloaded: false,
                content: content.to_string(),
                file_path: None,
                original_size,
                original_lines,
                content_hash: hash,
            });
        }

        let dir = self.category_dir(category);
        if let Some(existing) = self.find_existing(&dir, &hash).await {
            let preview_text = preview(content, self.config.preview_lines);
            return Ok(OffloadResult {
                offloaded: true,
                content: preview_text,
                file_path: Some(relative_to(&self.workspace_root, &existing)),
                original_size,
                original_lines,
                content_hash: hash,
            });
        }

        tokio::fs::create_dir_all(&dir).await?;
        let ext = extension_for(category, content);
        let file_name = format!("{}_{hash}.{ext}", safe_id(identifier));
        let path = dir.join(&file_name);
        tokio::fs::write(&path, content).await?;

        let preview_text = preview(content, self.config.preview_lines);
        Ok(OffloadResult {
            offloaded: true,
            content: preview_text,
            file_path: Some(relative_to(&self.workspace_root, &path)),
            original_size,
            original_lines,
            content_hash: hash,
        })
    }

    /// Finds the first existing cache file whose name contains `hash`,
    /// returned in glob iteration order (ties broken by first match).
    async fn find_existing(&self, dir: &Path, hash: &str) -> Option<PathBuf> {
        let mut entries = tokio::fs::read_dir(dir).await.ok()?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.contains(hash) {
                return Some(entry.path());
            }
        }
        None
    }

    pub async fn retrieve(&self, file_path: &str) -> ToolResult<String> {
        let path = self.workspace_root.join(file_path);
        Ok(tokio::fs::read_to_string(path).await?)
    }

    /// Removes cache files older than `max_age_hours` (or the configured
    /// default). Walks the cache directory recursively; IO errors during
    /// cleanup are logged and ignored rather than propagated.
    pub async fn cleanup(&self, max_age_hours: Option<u64>) {
        let max_age = Duration::from_secs(max_age_hours.unwrap_or(self.config.max_age_hours) * 3600);
        let root = self.workspace_root.join(&self.config.cache_dir);
        Self::cleanup_dir(&root, max_age).await;
    }

    fn cleanup_dir<'a>(dir: &'a Path, max_age: Duration) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let Ok(mut entries) = tokio::fs::read_dir(dir).await else { return };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                let Ok(metadata) = entry.metadata().await else { continue };
                if metadata.is_dir() {
                    Self::cleanup_dir(&path, max_age).await;
                    continue;
                }
                if let Ok(modified) = metadata.modified() {
                    if SystemTime::now().duration_since(modified).unwrap_or_default() > max_age {
                        if let Err(err) = tokio::fs::remove_file(&path).await {
                            tracing::debug!(path = %path.display(), error = %err, "offloader cleanup failed to remove file");
                        }
                    }
                }
            }
        })
    }
}

fn relative_to(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

/// Derives the offloader category from a tool name.
pub fn category_for_tool(tool_name: &str) -> &'static str {
    let lower = tool_name.to_ascii_lowercase();
    if lower.contains("read") && (lower.contains("fs") || lower.contains("file")) {
        "file_read"
    } else if lower.contains("shell") || lower.contains("run") {
        "shell_output"
    } else if lower.contains("search") || lower.contains("grep") {
        "search"
    } else if lower.contains("web") || lower.contains("http") {
        "web"
    } else {
        "tool_output"
    }
}

/// Derives the offload identifier from common path-like args, falling back
/// to `<tool>_<unix_ts>`.
pub fn identifier_for(tool_name: &str, args: &serde_json::Value, unix_ts: i64) -> String {
    for key in ["path", "file_path", "file", "url"] {
        if let Some(value) = args.get(key).and_then(serde_json::Value::as_str) {
            return value.to_string();
        }
    }
    format!("{tool_name}_{unix_ts}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_for_same_content() {
        assert_eq!(content_hash("hello world"), content_hash("hello world"));
        assert_ne!(content_hash("hello world"), content_hash("hello world!"));
    }

    #[test]
    fn safe_id_restricts_and_truncates() {
        let id = safe_id("path/to/../../weird name!.txt");
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'));
        assert!(id.len() <= 50);
    }

    #[tokio::test]
    async fn small_content_is_not_offloaded() {
        let dir = tempfile::tempdir().unwrap();
        let offloader = DataOffloader::new(dir.path().to_path_buf(), OffloadConfig::default());
        let result = offloader.offload("file_read", "small.txt", "short content", false).await.unwrap();
        assert!(!result.offloaded);
        assert_eq!(result.content, "short content");
        assert!(!result.content_hash.is_empty());
    }

    #[tokio::test]
    async fn large_content_is_offloaded_and_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let offloader = DataOffloader::new(dir.path().to_path_buf(), OffloadConfig::default());
        let big = "line\n".repeat(200);

        let first = offloader.offload("file_read", "big.txt", &big, false).await.unwrap();
        assert!(first.offloaded);
        let path = first.file_path.clone().unwrap();

        let second = offloader.offload("file_read", "big.txt", &big, false).await.unwrap();
        assert!(second.offloaded);
        assert_eq!(second.file_path, Some(path));
    }
}
