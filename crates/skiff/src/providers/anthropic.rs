use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

use super::base::{Provider, ProviderResponse};
use super::configs::AnthropicProviderConfig;
use super::retry::{retry_with_backoff, RetryConfig};
use super::utils::{anthropic_response_to_provider_response, check_error_envelope, create_request};
use crate::errors::ProviderError;
use crate::models::message::Message;
use crate::models::tool::ToolSchema;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

pub struct AnthropicProvider {
    client: Client,
    config: AnthropicProviderConfig,
    retry: RetryConfig,
}

impl AnthropicProvider {
    pub fn new(config: AnthropicProviderConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::InvalidRequest(e.to_string()))?;

        Ok(Self {
            client,
            config,
            retry: RetryConfig::default(),
        })
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &AnthropicProviderConfig {
        &self.config
    }

    async fn post(&self, payload: &Value) -> Result<Value, ProviderError> {
        let url = format!("{}/v1/messages", self.config.host.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        match serde_json::from_str::<Value>(&body) {
            Ok(parsed) => {
                check_error_envelope(&parsed, &self.config.model)?;
                if !status.is_success() {
                    return Err(ProviderError::Http {
                        status: status.as_u16(),
                        body,
                    });
                }
                Ok(parsed)
            }
            Err(_) if !status.is_success() => Err(ProviderError::Http {
                status: status.as_u16(),
                body,
            }),
            Err(e) => Err(ProviderError::InvalidResponse(format!(
                "Response body is not JSON: {}",
                e
            ))),
        }
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
    ) -> Result<ProviderResponse, ProviderError> {
        let payload = create_request(&self.config.model, messages, tools, self.config.max_tokens)?;
        tracing::debug!(
            model = %self.config.model,
            messages = messages.len(),
            tools = tools.len(),
            "sending completion request"
        );

        let response = retry_with_backoff(&self.retry, || self.post(&payload)).await?;
        let parsed = anthropic_response_to_provider_response(&response)?;

        tracing::debug!(
            finish_reason = %parsed.finish_reason,
            tool_calls = parsed.tool_calls.len(),
            input_tokens = ?parsed.usage.input_tokens,
            output_tokens = ?parsed.usage.output_tokens,
            "received completion"
        );
        Ok(parsed)
    }
}
