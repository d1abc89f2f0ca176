use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;

use super::{optional_bool, optional_i64, optional_str, required_str, Tool};
use crate::errors::{AgentResult, ProcessError};
use crate::models::tool::{ShellOutput, ToolResult};
use crate::process_store::{clamp_timeout, run_foreground, BackgroundProcess, ProcessRegistry};

/// Runs shell commands in the workspace, either to completion or in the background
pub struct BashTool {
    registry: ProcessRegistry,
    workspace_dir: PathBuf,
}

impl BashTool {
    pub fn new(registry: ProcessRegistry, workspace_dir: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            workspace_dir: workspace_dir.into(),
        }
    }

    async fn run(&self, arguments: &Value) -> AgentResult<ToolResult> {
        let command = required_str(arguments, "command")?;
        let timeout = clamp_timeout(optional_i64(arguments, "timeout")?);

        if optional_bool(arguments, "run_in_background") {
            return Ok(match self.registry.start(command, &self.workspace_dir) {
                Ok(id) => {
                    let message = format!(
                        "Background command started with ID: {}\n\
                         Use bash_output with this ID to monitor output, bash_kill to stop it.",
                        id
                    );
                    ToolResult::success(message.clone()).with_shell(ShellOutput {
                        stdout: message,
                        bash_id: Some(id),
                        ..Default::default()
                    })
                }
                Err(e) => ToolResult::failure(e.to_string()),
            });
        }

        tracing::debug!(command, timeout, "running foreground command");
        let result = match run_foreground(command, &self.workspace_dir, timeout).await {
            Ok(output) => {
                let shell = ShellOutput {
                    stdout: output.stdout,
                    stderr: output.stderr,
                    exit_code: Some(output.exit_code),
                    bash_id: None,
                };
                let content = format_output(&shell.stdout, &shell.stderr);
                let result = if output.exit_code == 0 {
                    ToolResult::success(content)
                } else {
                    let mut error = format!("Command failed with exit code {}", output.exit_code);
                    if !shell.stderr.trim().is_empty() {
                        error.push_str(&format!("\n{}", shell.stderr.trim_end()));
                    }
                    ToolResult::failure(error).with_content(content)
                };
                result.with_shell(shell)
            }
            Err(e @ ProcessError::Timeout(_)) => {
                ToolResult::failure(e.to_string()).with_shell(ShellOutput {
                    exit_code: Some(-1),
                    ..Default::default()
                })
            }
            Err(e) => ToolResult::failure(e.to_string()),
        };
        Ok(result)
    }
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Execute a bash command in the workspace directory. Foreground commands run to \
         completion and return stdout, stderr and the exit code; the timeout defaults to \
         120 seconds and is capped at 600. Set run_in_background for long-running commands \
         such as servers, then poll them with bash_output and stop them with bash_kill."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The bash command to execute."
                },
                "timeout": {
                    "type": "integer",
                    "description": "Timeout in seconds for foreground commands (default 120, max 600)."
                },
                "run_in_background": {
                    "type": "boolean",
                    "description": "Start the command in the background and return its ID immediately."
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, arguments: Value) -> ToolResult {
        self.run(&arguments)
            .await
            .unwrap_or_else(|e| ToolResult::failure(e.to_string()))
    }
}

/// Reports the output captured so far from a background command
pub struct BashOutputTool {
    registry: ProcessRegistry,
}

impl BashOutputTool {
    pub fn new(registry: ProcessRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Tool for BashOutputTool {
    fn name(&self) -> &str {
        "bash_output"
    }

    fn description(&self) -> &str {
        "Retrieve the output of a background command started by bash. Returns everything \
         captured since it started, optionally only the lines matching a regex."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "bash_id": {
                    "type": "string",
                    "description": "The ID returned when the background command was started."
                },
                "filter_str": {
                    "type": "string",
                    "description": "Optional regular expression; only matching lines are returned."
                }
            },
            "required": ["bash_id"]
        })
    }

    async fn execute(&self, arguments: Value) -> ToolResult {
        let id = match required_str(&arguments, "bash_id") {
            Ok(id) => id,
            Err(e) => return ToolResult::failure(e.to_string()),
        };

        match self
            .registry
            .output(id, optional_str(&arguments, "filter_str"))
        {
            Ok(process) => process_result(process),
            Err(e) => ToolResult::failure(e.to_string()),
        }
    }
}

/// Terminates a background command and forgets it
pub struct BashKillTool {
    registry: ProcessRegistry,
}

impl BashKillTool {
    pub fn new(registry: ProcessRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Tool for BashKillTool {
    fn name(&self) -> &str {
        "bash_kill"
    }

    fn description(&self) -> &str {
        "Terminate a background command started by bash. Returns its final output."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "bash_id": {
                    "type": "string",
                    "description": "The ID of the background command to terminate."
                }
            },
            "required": ["bash_id"]
        })
    }

    async fn execute(&self, arguments: Value) -> ToolResult {
        let id = match required_str(&arguments, "bash_id") {
            Ok(id) => id,
            Err(e) => return ToolResult::failure(e.to_string()),
        };

        match self.registry.kill(id).await {
            Ok(process) => process_result(process),
            Err(e) => ToolResult::failure(e.to_string()),
        }
    }
}

fn process_result(process: BackgroundProcess) -> ToolResult {
    let content = format!(
        "[{}] status: {}\n{}",
        process.id,
        process.status,
        format_output(&process.stdout, &process.stderr)
    );
    ToolResult::success(content).with_shell(ShellOutput {
        stdout: process.stdout,
        stderr: process.stderr,
        exit_code: process.exit_code,
        bash_id: Some(process.id),
    })
}

fn format_output(stdout: &str, stderr: &str) -> String {
    let mut output = stdout.trim_end().to_string();
    if !stderr.trim().is_empty() {
        if !output.is_empty() {
            output.push('\n');
        }
        output.push_str("[stderr]:\n");
        output.push_str(stderr.trim_end());
    }
    if output.is_empty() {
        output.push_str("(no output)");
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process_store::ProcessStatus;
    use std::time::Duration;
    use tempfile::TempDir;

    fn tools(dir: &TempDir) -> (BashTool, BashOutputTool, BashKillTool) {
        let registry = ProcessRegistry::new();
        (
            BashTool::new(registry.clone(), dir.path()),
            BashOutputTool::new(registry.clone()),
            BashKillTool::new(registry),
        )
    }

    #[tokio::test]
    async fn test_foreground_command() {
        let dir = TempDir::new().unwrap();
        let (bash, _, _) = tools(&dir);

        let result = bash
            .execute(json!({"command": "echo 'Hello from foreground'"}))
            .await;

        assert!(result.success);
        assert!(result.stdout().contains("Hello from foreground"));
        assert_eq!(result.exit_code(), Some(0));
        assert!(result.bash_id().is_none());
        assert_eq!(result.content, "Hello from foreground");
    }

    #[tokio::test]
    async fn test_stderr_is_reported() {
        let dir = TempDir::new().unwrap();
        let (bash, _, _) = tools(&dir);

        let result = bash
            .execute(json!({"command": "echo out; echo 'Error message' >&2"}))
            .await;

        assert!(result.success);
        assert!(result.stderr().contains("Error message"));
        assert_eq!(result.content, "out\n[stderr]:\nError message");
    }

    #[tokio::test]
    async fn test_failing_command() {
        let dir = TempDir::new().unwrap();
        let (bash, _, _) = tools(&dir);

        let result = bash
            .execute(json!({"command": "ls /nonexistent_directory_12345"}))
            .await;

        assert!(!result.success);
        assert_ne!(result.exit_code(), Some(0));
        let error = result.error.as_deref().unwrap();
        assert!(error.starts_with("Command failed with exit code"));
        assert!(error.contains("nonexistent_directory_12345"));
    }

    #[tokio::test]
    async fn test_runs_in_workspace() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let (bash, _, _) = tools(&dir);

        let result = bash.execute(json!({"command": "ls"})).await;
        assert!(result.content.contains("marker.txt"));
    }

    #[tokio::test]
    async fn test_timeout() {
        let dir = TempDir::new().unwrap();
        let (bash, _, _) = tools(&dir);

        let result = bash
            .execute(json!({"command": "sleep 5", "timeout": 1}))
            .await;

        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("timed out"));
        assert_eq!(result.exit_code(), Some(-1));
    }

    #[tokio::test]
    async fn test_missing_command() {
        let dir = TempDir::new().unwrap();
        let (bash, _, _) = tools(&dir);

        let result = bash.execute(json!({})).await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("command"));
    }

    #[tokio::test]
    async fn test_background_lifecycle() {
        let dir = TempDir::new().unwrap();
        let (bash, output, kill) = tools(&dir);

        let started = bash
            .execute(json!({
                "command": "for i in 1 2 3 4 5; do echo Line $i; sleep 0.1; done; sleep 30",
                "run_in_background": true
            }))
            .await;
        assert!(started.success);
        assert!(started.content.contains("Background command started"));
        let id = started.bash_id().unwrap().to_string();

        tokio::time::sleep(Duration::from_millis(800)).await;

        let polled = output.execute(json!({"bash_id": id})).await;
        assert!(polled.success);
        assert!(polled.stdout().contains("Line 1"));
        assert_eq!(polled.bash_id(), Some(id.as_str()));

        let filtered = output
            .execute(json!({"bash_id": id, "filter_str": "Line [24]"}))
            .await;
        assert_eq!(filtered.stdout(), "Line 2\nLine 4\n");

        let killed = kill.execute(json!({"bash_id": id})).await;
        assert!(killed.success);
        assert!(killed.content.contains(&ProcessStatus::Killed.to_string()));

        let gone = output.execute(json!({"bash_id": id})).await;
        assert!(!gone.success);
        assert!(gone.error.as_deref().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_unknown_ids() {
        let dir = TempDir::new().unwrap();
        let (_, output, kill) = tools(&dir);

        let polled = output.execute(json!({"bash_id": "nonexistent123"})).await;
        assert!(!polled.success);
        assert!(polled.error.as_deref().unwrap().contains("not found"));

        let killed = kill.execute(json!({"bash_id": "nonexistent123"})).await;
        assert!(!killed.success);
        assert!(killed.error.as_deref().unwrap().contains("not found"));
    }

    #[test]
    fn test_format_output() {
        assert_eq!(format_output("", ""), "(no output)");
        assert_eq!(format_output("a\n", ""), "a");
        assert_eq!(format_output("", "e\n"), "[stderr]:\ne");
    }
}
