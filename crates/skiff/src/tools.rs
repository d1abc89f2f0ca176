//! Capabilities the agent can invoke on behalf of the model.
//!
//! Every tool reports failure through [`ToolResult`] rather than an error: the result is
//! handed back to the model as a tool message either way.

pub mod file;
pub mod mcp;
pub mod note;
pub mod shell;

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::{AgentError, AgentResult};
use crate::models::tool::{ToolResult, ToolSchema};

pub use file::{EditFileTool, ReadFileTool, WriteFileTool};
pub use mcp::{load_mcp_tools, McpTool};
pub use note::{NoteStore, RecallNotesTool, RecordNoteTool};
pub use shell::{BashKillTool, BashOutputTool, BashTool};

#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name the model calls the tool by
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the accepted arguments
    fn parameters(&self) -> Value;

    async fn execute(&self, arguments: Value) -> ToolResult;

    fn schema(&self) -> ToolSchema {
        ToolSchema::new(self.name(), self.description(), self.parameters())
    }
}

pub(crate) fn required_str<'a>(arguments: &'a Value, key: &str) -> AgentResult<&'a str> {
    arguments
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| AgentError::InvalidParameters(format!("Missing '{}' parameter", key)))
}

pub(crate) fn optional_str<'a>(arguments: &'a Value, key: &str) -> Option<&'a str> {
    arguments.get(key).and_then(|v| v.as_str())
}

pub(crate) fn optional_i64(arguments: &Value, key: &str) -> AgentResult<Option<i64>> {
    match arguments.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value.as_i64().map(Some).ok_or_else(|| {
            AgentError::InvalidParameters(format!("'{}' must be an integer", key))
        }),
    }
}

pub(crate) fn optional_bool(arguments: &Value, key: &str) -> bool {
    arguments.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}
