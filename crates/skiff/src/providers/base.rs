use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::ProviderError;
use crate::models::message::{Message, ToolCall};
use crate::models::tool::ToolSchema;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: Option<i32>,
    pub output_tokens: Option<i32>,
}

impl Usage {
    pub fn new(input_tokens: Option<i32>, output_tokens: Option<i32>) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total_tokens(&self) -> Option<i32> {
        match (self.input_tokens, self.output_tokens) {
            (None, None) => None,
            (input, output) => Some(input.unwrap_or(0) + output.unwrap_or(0)),
        }
    }
}

/// A parsed model reply
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderResponse {
    pub content: String,
    pub thinking: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: String,
    pub usage: Usage,
}

impl ProviderResponse {
    /// Convert the reply into the assistant message appended to history
    pub fn to_message(&self) -> Message {
        let mut message = Message::assistant(self.content.as_str())
            .with_tool_calls(self.tool_calls.iter().cloned());
        message.thinking = self.thinking.clone();
        message
    }
}

/// Base trait for chat-completion providers
#[async_trait]
pub trait Provider: Send + Sync {
    /// Generate the next assistant reply for the full conversation history.
    /// The system message, if any, is part of `messages`.
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
    ) -> Result<ProviderResponse, ProviderError>;
}
