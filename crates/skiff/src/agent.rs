use futures::stream::{FuturesUnordered, StreamExt};
use indoc::formatdoc;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use crate::errors::{AgentError, AgentResult};
use crate::models::message::{Message, MessageContent, Role, ToolCall};
use crate::models::tool::{ToolResult, ToolSchema};
use crate::providers::base::Provider;
use crate::run_log::RunLogger;
use crate::tools::Tool;

pub const DEFAULT_MAX_STEPS: usize = 50;

const WORKSPACE_MARKER: &str = "Current Workspace";

/// How a call to [`Agent::run`] ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The model answered without requesting tools
    Completed(String),
    /// Every step requested tools; `last_text` is the last non-empty assistant text
    StepLimitExceeded { steps: usize, last_text: String },
    Cancelled { last_text: String },
}

impl RunOutcome {
    pub fn text(&self) -> &str {
        match self {
            RunOutcome::Completed(text) => text,
            RunOutcome::StepLimitExceeded { last_text, .. } => last_text,
            RunOutcome::Cancelled { last_text } => last_text,
        }
    }
}

/// Agent drives a tool-calling conversation with a provider until the model stops asking
/// for tools or the step budget runs out
pub struct Agent {
    provider: Box<dyn Provider>,
    tools: Vec<Box<dyn Tool>>,
    messages: Vec<Message>,
    max_steps: usize,
    workspace_dir: PathBuf,
    cancel: CancellationToken,
    logger: Option<RunLogger>,
}

impl Agent {
    /// Create an agent whose history starts with `system_prompt`.
    ///
    /// The workspace directory is created if missing, and its absolute path is appended to
    /// the prompt unless the prompt already describes the workspace.
    pub fn new(
        provider: Box<dyn Provider>,
        system_prompt: &str,
        workspace_dir: impl AsRef<Path>,
    ) -> AgentResult<Self> {
        let workspace_dir = workspace_dir.as_ref();
        std::fs::create_dir_all(workspace_dir).map_err(|e| {
            AgentError::Internal(format!(
                "Failed to create workspace {}: {}",
                workspace_dir.display(),
                e
            ))
        })?;
        let workspace_dir = workspace_dir
            .canonicalize()
            .map_err(|e| AgentError::Internal(e.to_string()))?;

        let system_prompt = with_workspace_info(system_prompt, &workspace_dir);

        Ok(Self {
            provider,
            tools: Vec::new(),
            messages: vec![Message::system(system_prompt)],
            max_steps: DEFAULT_MAX_STEPS,
            workspace_dir,
            cancel: CancellationToken::new(),
            logger: None,
        })
    }

    pub fn with_tool<T: Tool + 'static>(mut self, tool: T) -> Self {
        self.add_tool(Box::new(tool));
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Write a transcript file for every run
    pub fn with_run_logger(mut self, logger: RunLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Transcript of the latest run, when run logging is on
    pub fn run_log_file(&self) -> Option<&Path> {
        self.logger.as_ref().and_then(RunLogger::current_file)
    }

    /// Register a tool, replacing any tool with the same name
    pub fn add_tool(&mut self, tool: Box<dyn Tool>) {
        if let Some(existing) = self.tools.iter_mut().find(|t| t.name() == tool.name()) {
            tracing::debug!(tool = tool.name(), "replacing tool");
            *existing = tool;
        } else {
            self.tools.push(tool);
        }
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn workspace_dir(&self) -> &Path {
        &self.workspace_dir
    }

    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    pub fn system_prompt(&self) -> String {
        self.messages
            .first()
            .map(Message::text)
            .unwrap_or_default()
    }

    pub fn add_user_message(&mut self, content: impl Into<MessageContent>) -> AgentResult<()> {
        validate_history(&self.messages)?;
        self.messages.push(Message::user(content));
        Ok(())
    }

    /// Independent copy of the conversation so far
    pub fn get_history(&self) -> Vec<Message> {
        self.messages.clone()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Drop everything but the system message
    pub fn reset(&mut self) {
        self.messages.truncate(1);
    }

    pub fn restore_history(&mut self, messages: Vec<Message>) -> AgentResult<()> {
        validate_history(&messages)?;
        self.messages = messages;
        Ok(())
    }

    /// Token that cancels the current (or next) run. A fresh token is installed after each
    /// cancellation, so fetch it again before every run.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the step loop until the model answers without tool calls
    pub async fn run(&mut self) -> AgentResult<RunOutcome> {
        validate_history(&self.messages)?;

        let schemas: Vec<ToolSchema> = self.tools.iter().map(|t| t.schema()).collect();
        let cancel = self.cancel.clone();
        let mut last_text = String::new();

        if let Some(logger) = self.logger.as_mut() {
            logger.start_run().await;
        }

        for step in 1..=self.max_steps {
            tracing::info!(step, max_steps = self.max_steps, "requesting completion");
            if let Some(logger) = self.logger.as_mut() {
                logger.log_request(&self.messages, &schemas).await;
            }

            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                response = self.provider.complete(&self.messages, &schemas) => Some(response),
            };
            let Some(response) = response else {
                return Ok(self.cancelled(last_text));
            };
            let response = response?;
            if let Some(logger) = self.logger.as_mut() {
                logger.log_response(&response).await;
            }

            self.messages.push(response.to_message());
            if !response.content.is_empty() {
                last_text = response.content.clone();
            }

            if response.tool_calls.is_empty() {
                tracing::info!(step, "run completed");
                return Ok(RunOutcome::Completed(response.content));
            }

            let calls = response.tool_calls;
            tracing::info!(step, tool_calls = calls.len(), "dispatching tool calls");

            let results = self.dispatch_all(&calls, &cancel).await;
            let cancelled = results.iter().any(Option::is_none);

            // Every tool call still needs an answer for the history to stay valid
            for (call, result) in calls.iter().zip(results) {
                let result = result.unwrap_or_else(|| ToolResult::failure("cancelled"));
                if let Some(logger) = self.logger.as_mut() {
                    logger.log_tool_result(call, &result).await;
                }
                self.messages
                    .push(Message::tool(&call.id, call.name(), result.model_content()));
            }

            if cancelled {
                return Ok(self.cancelled(last_text));
            }
        }

        tracing::warn!(max_steps = self.max_steps, "step limit reached");
        Ok(RunOutcome::StepLimitExceeded {
            steps: self.max_steps,
            last_text,
        })
    }

    /// Run all calls concurrently. Results stay in call order; calls still running when the
    /// token fires are left as `None`.
    async fn dispatch_all(
        &self,
        calls: &[ToolCall],
        cancel: &CancellationToken,
    ) -> Vec<Option<ToolResult>> {
        let mut results: Vec<Option<ToolResult>> = vec![None; calls.len()];
        let mut pending: FuturesUnordered<_> = calls
            .iter()
            .enumerate()
            .map(|(index, call)| async move { (index, self.dispatch(call).await) })
            .collect();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = pending.next() => match next {
                    Some((index, result)) => results[index] = Some(result),
                    None => break,
                },
            }
        }
        results
    }

    async fn dispatch(&self, call: &ToolCall) -> ToolResult {
        let Some(tool) = self.tools.iter().find(|t| t.name() == call.name()) else {
            tracing::warn!(tool = call.name(), "model requested an unknown tool");
            return ToolResult::failure(AgentError::ToolNotFound(call.name().to_string()).to_string());
        };

        tracing::debug!(
            tool = call.name(),
            id = %call.id,
            arguments = %call.function.arguments,
            "executing tool"
        );
        let result = tool.execute(call.function.arguments.clone()).await;

        if result.success {
            tracing::debug!(tool = call.name(), id = %call.id, "tool succeeded");
        } else {
            tracing::warn!(
                tool = call.name(),
                id = %call.id,
                error = result.error.as_deref().unwrap_or_default(),
                "tool failed"
            );
        }
        result
    }

    fn cancelled(&mut self, last_text: String) -> RunOutcome {
        tracing::info!("run cancelled");
        self.cancel = CancellationToken::new();
        RunOutcome::Cancelled { last_text }
    }
}

fn validate_history(messages: &[Message]) -> AgentResult<()> {
    match messages.first() {
        Some(first) if first.role == Role::System => Ok(()),
        _ => Err(AgentError::InvalidHistory(
            "history must start with the system message".into(),
        )),
    }
}

fn with_workspace_info(system_prompt: &str, workspace_dir: &Path) -> String {
    if system_prompt.contains(WORKSPACE_MARKER) {
        return system_prompt.to_string();
    }
    formatdoc! {"
        {prompt}

        ## {marker}
        You are currently working in: `{dir}`
        All relative paths will be resolved relative to this directory.
        ",
        prompt = system_prompt.trim_end(),
        marker = WORKSPACE_MARKER,
        dir = workspace_dir.display(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ProviderError;
    use crate::providers::mock::MockProvider;
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echoes back the input"
        }

        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]})
        }

        async fn execute(&self, arguments: Value) -> ToolResult {
            ToolResult::success(arguments["text"].as_str().unwrap_or_default())
        }
    }

    /// Sleeps for `ms` milliseconds, then returns `label`
    struct SleepTool;

    #[async_trait]
    impl Tool for SleepTool {
        fn name(&self) -> &str {
            "sleep"
        }

        fn description(&self) -> &str {
            "Sleeps, then answers"
        }

        fn parameters(&self) -> Value {
            json!({"type": "object"})
        }

        async fn execute(&self, arguments: Value) -> ToolResult {
            let ms = arguments["ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            ToolResult::success(arguments["label"].as_str().unwrap_or_default())
        }
    }

    fn agent(provider: &MockProvider, dir: &TempDir) -> Agent {
        Agent::new(Box::new(provider.clone()), "You are a test agent.", dir.path())
            .unwrap()
            .with_tool(EchoTool)
            .with_tool(SleepTool)
    }

    #[test]
    fn test_workspace_is_created_and_announced() {
        let dir = TempDir::new().unwrap();
        let workspace = dir.path().join("nested/workspace");

        let agent = Agent::new(Box::new(MockProvider::default()), "Base prompt.", &workspace).unwrap();

        assert!(workspace.is_dir());
        assert!(agent.workspace_dir().is_absolute());
        let prompt = agent.system_prompt();
        assert!(prompt.starts_with("Base prompt.\n\n## Current Workspace"));
        assert!(prompt.contains(&agent.workspace_dir().display().to_string()));

        let already = "Prompt\n## Current Workspace\nsomewhere";
        let agent = Agent::new(Box::new(MockProvider::default()), already, &workspace).unwrap();
        assert_eq!(agent.system_prompt(), already);
    }

    #[test]
    fn test_add_user_message_and_history_copy() {
        let dir = TempDir::new().unwrap();
        let mut agent = agent(&MockProvider::default(), &dir);

        agent.add_user_message("Hello").unwrap();
        assert_eq!(agent.messages().len(), 2);
        assert_eq!(agent.messages()[1].role, Role::User);
        assert_eq!(agent.messages()[1].text(), "Hello");

        let mut history = agent.get_history();
        history.push(Message::user("not in the agent"));
        assert_eq!(agent.messages().len(), 2);

        agent.reset();
        assert_eq!(agent.messages().len(), 1);
        assert_eq!(agent.messages()[0].role, Role::System);
    }

    #[test]
    fn test_history_must_start_with_system() {
        let dir = TempDir::new().unwrap();
        let mut agent = agent(&MockProvider::default(), &dir);

        let err = agent
            .restore_history(vec![Message::user("no system")])
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidHistory(_)));
        assert_eq!(agent.messages().len(), 1);

        let restored = vec![Message::system("sys"), Message::user("hi")];
        agent.restore_history(restored.clone()).unwrap();
        assert_eq!(agent.get_history(), restored);
    }

    #[test]
    fn test_add_tool_replaces_same_name() {
        let dir = TempDir::new().unwrap();
        let mut agent = agent(&MockProvider::default(), &dir);
        agent.add_tool(Box::new(EchoTool));
        assert_eq!(agent.tool_names(), vec!["echo", "sleep"]);
    }

    #[tokio::test]
    async fn test_simple_response() -> Result<()> {
        let dir = TempDir::new()?;
        let provider = MockProvider::new(vec![MockProvider::text("Hello!")]);
        let mut agent = agent(&provider, &dir);

        agent.add_user_message("Hi")?;
        let outcome = agent.run().await?;

        assert_eq!(outcome, RunOutcome::Completed("Hello!".into()));
        assert_eq!(agent.messages().len(), 3);
        assert_eq!(agent.messages()[2].role, Role::Assistant);
        assert_eq!(provider.requests().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_tool_call_round_trip() -> Result<()> {
        let dir = TempDir::new()?;
        let provider = MockProvider::new(vec![
            MockProvider::tool_calls(vec![ToolCall::new("call_1", "echo", json!({"text": "hi"}))]),
            MockProvider::text("Done!"),
        ]);
        let mut agent = agent(&provider, &dir);

        agent.add_user_message("Echo hi")?;
        let outcome = agent.run().await?;
        assert_eq!(outcome.text(), "Done!");

        // The second request sees exactly one assistant message and one tool result
        let requests = provider.requests();
        assert_eq!(requests.len(), 2);
        let second = &requests[1];
        assert_eq!(second.len(), 4);
        assert_eq!(second[2].role, Role::Assistant);
        assert_eq!(second[2].tool_calls[0].id, "call_1");
        assert_eq!(second[3].role, Role::Tool);
        assert_eq!(second[3].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(second[3].name.as_deref(), Some("echo"));
        assert_eq!(second[3].text(), "hi");

        assert_eq!(agent.messages().len(), 5);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_tool_becomes_error_result() -> Result<()> {
        let dir = TempDir::new()?;
        let provider = MockProvider::new(vec![
            MockProvider::tool_calls(vec![ToolCall::new("call_1", "missing", json!({}))]),
            MockProvider::text("Recovered"),
        ]);
        let mut agent = agent(&provider, &dir);

        agent.add_user_message("Use a missing tool")?;
        let outcome = agent.run().await?;

        assert_eq!(outcome, RunOutcome::Completed("Recovered".into()));
        let tool_message = &agent.messages()[3];
        assert_eq!(tool_message.role, Role::Tool);
        assert_eq!(tool_message.text(), "Error: Tool not found: missing");
        Ok(())
    }

    #[tokio::test]
    async fn test_tool_results_keep_call_order() -> Result<()> {
        let dir = TempDir::new()?;
        let provider = MockProvider::new(vec![
            MockProvider::tool_calls(vec![
                ToolCall::new("a", "sleep", json!({"ms": 400, "label": "first"})),
                ToolCall::new("b", "sleep", json!({"ms": 20, "label": "second"})),
                ToolCall::new("c", "sleep", json!({"ms": 300, "label": "third"})),
            ]),
            MockProvider::text("ok"),
        ]);
        let mut agent = agent(&provider, &dir);

        agent.add_user_message("Sleep in parallel")?;
        let started = Instant::now();
        agent.run().await?;
        let elapsed = started.elapsed();

        let results: Vec<(String, String)> = agent.messages()[3..6]
            .iter()
            .map(|m| (m.tool_call_id.clone().unwrap(), m.text()))
            .collect();
        assert_eq!(
            results,
            vec![
                ("a".to_string(), "first".to_string()),
                ("b".to_string(), "second".to_string()),
                ("c".to_string(), "third".to_string()),
            ]
        );
        // Sequential dispatch would need at least 720ms
        assert!(elapsed < Duration::from_millis(650), "took {:?}", elapsed);
        Ok(())
    }

    #[tokio::test]
    async fn test_step_limit() -> Result<()> {
        let dir = TempDir::new()?;
        let looping = || {
            let mut response =
                MockProvider::tool_calls(vec![ToolCall::new("x", "echo", json!({"text": "again"}))]);
            response.content = "still working".into();
            response
        };
        let provider = MockProvider::new(vec![looping(), looping(), looping(), looping()]);
        let mut agent = agent(&provider, &dir).with_max_steps(3);

        agent.add_user_message("Loop forever")?;
        let outcome = agent.run().await?;

        assert_eq!(
            outcome,
            RunOutcome::StepLimitExceeded {
                steps: 3,
                last_text: "still working".into()
            }
        );
        assert_eq!(provider.requests().len(), 3);
        // system + user + 3 * (assistant + tool)
        assert_eq!(agent.messages().len(), 8);
        Ok(())
    }

    #[tokio::test]
    async fn test_provider_error_propagates() -> Result<()> {
        let dir = TempDir::new()?;
        let provider = MockProvider::with_results(vec![Err(ProviderError::InsufficientBalance(
            "balance".into(),
        ))]);
        let mut agent = agent(&provider, &dir);

        agent.add_user_message("Hi")?;
        let err = agent.run().await.unwrap_err();

        assert!(matches!(
            err,
            AgentError::Provider(ProviderError::InsufficientBalance(_))
        ));
        assert_eq!(agent.messages().len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_provider() -> Result<()> {
        let dir = TempDir::new()?;
        let provider = MockProvider::new(vec![MockProvider::text("too late")])
            .with_delay(Duration::from_secs(5));
        let mut agent = agent(&provider, &dir);

        agent.add_user_message("Hi")?;
        let token = agent.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        let started = Instant::now();
        let outcome = agent.run().await?;

        assert!(matches!(outcome, RunOutcome::Cancelled { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(agent.messages().len(), 2);
        assert!(!agent.cancellation_token().is_cancelled());
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_while_dispatching() -> Result<()> {
        let dir = TempDir::new()?;
        let provider = MockProvider::new(vec![MockProvider::tool_calls(vec![
            ToolCall::new("slow", "sleep", json!({"ms": 5000, "label": "never"})),
            ToolCall::new("fast", "echo", json!({"text": "quick"})),
        ])]);
        let mut agent = agent(&provider, &dir);

        agent.add_user_message("Start something slow")?;
        let token = agent.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
        });

        let outcome = agent.run().await?;
        assert!(matches!(outcome, RunOutcome::Cancelled { .. }));

        let tool_messages: Vec<&Message> = agent
            .messages()
            .iter()
            .filter(|m| m.role == Role::Tool)
            .collect();
        let texts: Vec<String> = tool_messages.iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["Error: cancelled", "quick"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_run_writes_transcript() -> Result<()> {
        let dir = TempDir::new()?;
        let log_dir = dir.path().join("log");
        let provider = MockProvider::new(vec![
            MockProvider::tool_calls(vec![ToolCall::new("call_1", "echo", json!({"text": "hi"}))]),
            MockProvider::text("Done!"),
        ]);
        let mut agent = agent(&provider, &dir).with_run_logger(RunLogger::new(&log_dir));
        assert!(agent.run_log_file().is_none());

        agent.add_user_message("Echo hi")?;
        agent.run().await?;

        let path = agent.run_log_file().unwrap().to_path_buf();
        assert!(path.starts_with(&log_dir));
        let text = std::fs::read_to_string(&path)?;
        assert!(text.contains("[1] REQUEST"));
        assert!(text.contains("[2] RESPONSE"));
        assert!(text.contains("[3] TOOL_RESULT"));
        assert!(text.contains("\"tool_name\": \"echo\""));
        assert!(text.contains("[4] REQUEST"));
        assert!(text.contains("[5] RESPONSE"));
        assert!(text.contains("Done!"));
        Ok(())
    }
}
