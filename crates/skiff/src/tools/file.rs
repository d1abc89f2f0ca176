use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

use super::{optional_i64, required_str, Tool};
use crate::errors::{AgentError, AgentResult};
use crate::models::tool::ToolResult;

/// Upper bound on the characters returned by a single read
pub const MAX_READ_CHARS: usize = 128_000;

fn resolve_path(workspace_dir: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace_dir.join(path)
    }
}

fn execution_error(action: &str, e: std::io::Error) -> AgentError {
    AgentError::ExecutionError(format!("Failed to {}: {}", action, e))
}

/// Keep the head and tail of `text`, cutting the middle on line boundaries
pub(crate) fn truncate_middle(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }

    let half = max_chars / 2;
    let byte_at = |chars: usize| {
        text.char_indices()
            .nth(chars)
            .map(|(i, _)| i)
            .unwrap_or(text.len())
    };

    let mut head = &text[..byte_at(half)];
    if let Some(pos) = head.rfind('\n').filter(|pos| *pos > 0) {
        head = &head[..pos];
    }

    let mut tail = &text[byte_at(total - half)..];
    if let Some(pos) = tail.find('\n').filter(|pos| *pos > 0) {
        tail = &tail[pos + 1..];
    }

    format!(
        "{}\n\n... [Content truncated: {} characters -> ~{} characters limit] ...\n\n{}",
        head, total, max_chars, tail
    )
}

/// Reads a file with 1-indexed line numbers
pub struct ReadFileTool {
    workspace_dir: PathBuf,
}

impl ReadFileTool {
    pub fn new(workspace_dir: impl Into<PathBuf>) -> Self {
        Self {
            workspace_dir: workspace_dir.into(),
        }
    }

    async fn read(&self, arguments: &Value) -> AgentResult<String> {
        let path_str = required_str(arguments, "path")?;
        let offset = optional_i64(arguments, "offset")?;
        let limit = optional_i64(arguments, "limit")?;

        let path = resolve_path(&self.workspace_dir, path_str);
        if !path.is_file() {
            return Err(AgentError::InvalidParameters(format!(
                "File not found: {}",
                path_str
            )));
        }

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| execution_error("read file", e))?;

        let lines: Vec<&str> = content.lines().collect();
        let start = offset
            .filter(|o| *o > 0)
            .map(|o| (o - 1) as usize)
            .unwrap_or(0)
            .min(lines.len());
        let end = limit
            .filter(|l| *l >= 0)
            .map(|l| start.saturating_add(l as usize))
            .unwrap_or(lines.len())
            .min(lines.len());

        let numbered = lines[start..end]
            .iter()
            .enumerate()
            .map(|(i, line)| format!("{:6}|{}", start + i + 1, line))
            .collect::<Vec<_>>()
            .join("\n");

        Ok(truncate_middle(&numbered, MAX_READ_CHARS))
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read file contents. Output includes line numbers in the format \
         'LINE_NUMBER|LINE_CONTENT' (1-indexed). Use offset and limit to read large files \
         in chunks."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute path, or a path relative to the workspace."
                },
                "offset": {
                    "type": "integer",
                    "description": "Starting line number (1-indexed)."
                },
                "limit": {
                    "type": "integer",
                    "description": "Number of lines to read."
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, arguments: Value) -> ToolResult {
        match self.read(&arguments).await {
            Ok(content) => ToolResult::success(content),
            Err(e) => ToolResult::failure(e.to_string()),
        }
    }
}

/// Writes a whole file, creating parent directories as needed
pub struct WriteFileTool {
    workspace_dir: PathBuf,
}

impl WriteFileTool {
    pub fn new(workspace_dir: impl Into<PathBuf>) -> Self {
        Self {
            workspace_dir: workspace_dir.into(),
        }
    }

    async fn write(&self, arguments: &Value) -> AgentResult<String> {
        let path = resolve_path(&self.workspace_dir, required_str(arguments, "path")?);
        let content = required_str(arguments, "content")?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| execution_error("create directory", e))?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| execution_error("write file", e))?;

        Ok(format!("Successfully wrote to {}", path.display()))
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file, replacing it completely if it exists. Read existing files \
         first and prefer edit_file for small changes."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute path, or a path relative to the workspace."
                },
                "content": {
                    "type": "string",
                    "description": "Complete file content."
                }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, arguments: Value) -> ToolResult {
        match self.write(&arguments).await {
            Ok(content) => ToolResult::success(content),
            Err(e) => ToolResult::failure(e.to_string()),
        }
    }
}

/// Replaces one exact occurrence of a string in a file
pub struct EditFileTool {
    workspace_dir: PathBuf,
}

impl EditFileTool {
    pub fn new(workspace_dir: impl Into<PathBuf>) -> Self {
        Self {
            workspace_dir: workspace_dir.into(),
        }
    }

    async fn edit(&self, arguments: &Value) -> AgentResult<String> {
        let path_str = required_str(arguments, "path")?;
        let old_str = required_str(arguments, "old_str")?;
        let new_str = required_str(arguments, "new_str")?;

        let path = resolve_path(&self.workspace_dir, path_str);
        if !path.is_file() {
            return Err(AgentError::InvalidParameters(format!(
                "File not found: {}",
                path_str
            )));
        }
        if old_str.is_empty() {
            return Err(AgentError::InvalidParameters(
                "'old_str' must not be empty".into(),
            ));
        }

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| execution_error("read file", e))?;

        match content.matches(old_str).count() {
            0 => {
                return Err(AgentError::InvalidParameters(format!(
                    "Text not found in file: {}",
                    old_str
                )))
            }
            1 => {}
            n => {
                return Err(AgentError::InvalidParameters(format!(
                    "'old_str' must appear exactly once in the file, found {} occurrences",
                    n
                )))
            }
        }

        tokio::fs::write(&path, content.replacen(old_str, new_str, 1))
            .await
            .map_err(|e| execution_error("write file", e))?;

        Ok(format!("Successfully edited {}", path.display()))
    }
}

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Perform an exact string replacement in a file. old_str must match exactly and \
         appear exactly once. Read the file first and preserve its indentation."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute path, or a path relative to the workspace."
                },
                "old_str": {
                    "type": "string",
                    "description": "Exact text to replace; must be unique in the file."
                },
                "new_str": {
                    "type": "string",
                    "description": "Replacement text."
                }
            },
            "required": ["path", "old_str", "new_str"]
        })
    }

    async fn execute(&self, arguments: Value) -> ToolResult {
        match self.edit(&arguments).await {
            Ok(content) => ToolResult::success(content),
            Err(e) => ToolResult::failure(e.to_string()),
        }
    }
}
