use async_trait::async_trait;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use crate::errors::ProviderError;
use crate::models::message::Message;
use crate::models::tool::ToolSchema;
use crate::providers::base::{Provider, ProviderResponse};

/// A mock provider that returns pre-configured responses for testing
#[derive(Clone, Default)]
pub struct MockProvider {
    responses: Arc<Mutex<Vec<Result<ProviderResponse, ProviderError>>>>,
    requests: Arc<Mutex<Vec<Vec<Message>>>>,
    delay: Option<Duration>,
}

impl MockProvider {
    /// Create a new mock provider with a sequence of responses
    pub fn new(responses: Vec<ProviderResponse>) -> Self {
        Self::with_results(responses.into_iter().map(Ok).collect())
    }

    pub fn with_results(responses: Vec<Result<ProviderResponse, ProviderError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            ..Default::default()
        }
    }

    /// Sleep before answering each request
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Histories received so far, one per call
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().unwrap().clone()
    }

    pub fn text(content: &str) -> ProviderResponse {
        ProviderResponse {
            content: content.to_string(),
            finish_reason: "end_turn".to_string(),
            ..Default::default()
        }
    }

    pub fn tool_calls(calls: Vec<crate::models::message::ToolCall>) -> ProviderResponse {
        ProviderResponse {
            tool_calls: calls,
            finish_reason: "tool_use".to_string(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn complete(
        &self,
        messages: &[Message],
        _tools: &[ToolSchema],
    ) -> Result<ProviderResponse, ProviderError> {
        self.requests.lock().unwrap().push(messages.to_vec());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                None
            } else {
                Some(responses.remove(0))
            }
        };

        // Return an empty reply once the script runs out
        next.unwrap_or_else(|| {
            Ok(ProviderResponse {
                finish_reason: "stop".to_string(),
                ..Default::default()
            })
        })
    }
}
