//! Per-run transcript files.
//!
//! Every call to [`crate::agent::Agent::run`] opens a fresh `agent_run_<timestamp>.log` in the
//! log directory and appends one numbered entry per model request, model response and tool
//! result, each as pretty-printed JSON.

use chrono::Local;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::models::message::{Message, ToolCall};
use crate::models::tool::{ToolResult, ToolSchema};
use crate::providers::base::ProviderResponse;

const RULE: &str = "--------------------------------------------------------------------------------";
const HEADER_RULE: &str =
    "================================================================================";

pub struct RunLogger {
    log_dir: PathBuf,
    current: Option<PathBuf>,
    index: usize,
}

impl RunLogger {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            current: None,
            index: 0,
        }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// File of the run in progress, if one was started successfully
    pub fn current_file(&self) -> Option<&Path> {
        self.current.as_deref()
    }

    /// Open a new log file for the next run. On failure logging stays off until the next run.
    pub async fn start_run(&mut self) {
        self.index = 0;
        self.current = None;

        let now = Local::now();
        let stamp = now.format("%Y%m%d_%H%M%S").to_string();
        let header = format!(
            "{rule}\nAgent Run Log - {}\n{rule}\n\n",
            now.format("%Y-%m-%d %H:%M:%S"),
            rule = HEADER_RULE
        );

        match create_log_file(&self.log_dir, &stamp, &header).await {
            Ok(path) => {
                tracing::debug!(path = %path.display(), "started run log");
                self.current = Some(path);
            }
            Err(e) => {
                tracing::warn!(dir = %self.log_dir.display(), error = %e, "could not create run log");
            }
        }
    }

    pub async fn log_request(&mut self, messages: &[Message], tools: &[ToolSchema]) {
        let body = json!({
            "messages": messages,
            "tools": tools.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
        });
        self.write_entry("REQUEST", "LLM Request", &body).await;
    }

    pub async fn log_response(&mut self, response: &ProviderResponse) {
        let mut body = json!({"content": response.content});
        if let Some(thinking) = &response.thinking {
            body["thinking"] = json!(thinking);
        }
        if !response.tool_calls.is_empty() {
            body["tool_calls"] = json!(response.tool_calls);
        }
        body["finish_reason"] = json!(response.finish_reason);
        self.write_entry("RESPONSE", "LLM Response", &body).await;
    }

    pub async fn log_tool_result(&mut self, call: &ToolCall, result: &ToolResult) {
        let mut body = json!({
            "tool_name": call.name(),
            "arguments": call.function.arguments,
            "success": result.success,
        });
        if result.success {
            body["result"] = json!(result.content);
        } else {
            body["error"] = json!(result.error);
        }
        self.write_entry("TOOL_RESULT", "Tool Execution", &body).await;
    }

    async fn write_entry(&mut self, kind: &str, title: &str, body: &Value) {
        let Some(path) = &self.current else {
            return;
        };
        self.index += 1;

        let pretty = serde_json::to_string_pretty(body).unwrap_or_else(|_| body.to_string());
        let entry = format!(
            "\n{rule}\n[{}] {}\nTimestamp: {}\n{rule}\n{}:\n\n{}\n",
            self.index,
            kind,
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            title,
            pretty,
            rule = RULE
        );

        let written = async {
            let mut file = OpenOptions::new().append(true).open(path).await?;
            file.write_all(entry.as_bytes()).await?;
            file.flush().await
        };
        if let Err(e) = written.await {
            tracing::warn!(path = %path.display(), error = %e, "failed to write run log entry");
        }
    }
}

/// Create `agent_run_<stamp>.log`, adding a counter when runs start within the same second
async fn create_log_file(dir: &Path, stamp: &str, header: &str) -> std::io::Result<PathBuf> {
    fs::create_dir_all(dir).await?;

    let mut suffix = 0;
    loop {
        let name = match suffix {
            0 => format!("agent_run_{}.log", stamp),
            n => format!("agent_run_{}_{}.log", stamp, n),
        };
        let path = dir.join(name);
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(mut file) => {
                file.write_all(header.as_bytes()).await?;
                file.flush().await?;
                return Ok(path);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => suffix += 1,
            Err(e) => return Err(e),
        }
    }
}
