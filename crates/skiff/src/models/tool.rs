use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The schema of a tool as advertised to the model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSchema {
    /// The name of the tool
    pub name: String,
    /// A description of what the tool does
    pub description: String,
    /// JSON schema describing the accepted arguments
    pub input_schema: Value,
}

impl ToolSchema {
    pub fn new<N, D>(name: N, description: D, input_schema: Value) -> Self
    where
        N: Into<String>,
        D: Into<String>,
    {
        ToolSchema {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

/// Extra detail reported by the shell tools
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bash_id: Option<String>,
}

/// Outcome of a tool execution. Failures are values, not errors.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub success: bool,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell: Option<ShellOutput>,
}

impl ToolResult {
    pub fn success<S: Into<String>>(content: S) -> Self {
        ToolResult {
            success: true,
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn failure<S: Into<String>>(error: S) -> Self {
        ToolResult {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_content<S: Into<String>>(mut self, content: S) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_shell(mut self, shell: ShellOutput) -> Self {
        self.shell = Some(shell);
        self
    }

    pub fn stdout(&self) -> &str {
        self.shell.as_ref().map(|s| s.stdout.as_str()).unwrap_or("")
    }

    pub fn stderr(&self) -> &str {
        self.shell.as_ref().map(|s| s.stderr.as_str()).unwrap_or("")
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.shell.as_ref().and_then(|s| s.exit_code)
    }

    pub fn bash_id(&self) -> Option<&str> {
        self.shell.as_ref().and_then(|s| s.bash_id.as_deref())
    }

    /// The text handed back to the model in the tool-role message
    pub fn model_content(&self) -> String {
        if self.success {
            self.content.clone()
        } else {
            format!(
                "Error: {}",
                self.error.as_deref().unwrap_or("Unknown error")
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_content_reports_errors() {
        assert_eq!(ToolResult::success("ok").model_content(), "ok");
        assert_eq!(
            ToolResult::failure("boom").model_content(),
            "Error: boom"
        );
    }

    #[test]
    fn test_shell_accessors() {
        let result = ToolResult::failure("timed out").with_shell(ShellOutput {
            exit_code: Some(-1),
            ..Default::default()
        });
        assert_eq!(result.exit_code(), Some(-1));
        assert_eq!(result.stdout(), "");
        assert!(result.bash_id().is_none());
    }
}
