use serde_json::{json, Map, Value};
use std::collections::HashSet;

use super::base::{ProviderResponse, Usage};
use crate::errors::ProviderError;
use crate::models::message::{Message, Role, ToolCall};
use crate::models::tool::ToolSchema;

/// Vendor status codes that mean the request succeeded
const VENDOR_OK_CODES: [i64; 2] = [0, 1000];
pub const VENDOR_INSUFFICIENT_BALANCE: i64 = 1008;
pub const VENDOR_MODEL_NOT_SUPPORTED: i64 = 2013;

/// Convert the internal history to anthropic's messages wire format.
///
/// The system message is lifted out of the list and returned separately, since the wire
/// format carries it in a dedicated request field.
pub fn messages_to_anthropic_spec(messages: &[Message]) -> (Option<Value>, Vec<Value>) {
    let mut system = None;
    let mut spec = Vec::new();

    for message in messages {
        match message.role {
            Role::System => {
                system = Some(json!(message.content));
            }
            Role::Assistant if message.thinking.is_some() || message.has_tool_calls() => {
                let mut blocks = Vec::new();

                if let Some(thinking) = &message.thinking {
                    blocks.push(json!({"type": "thinking", "thinking": thinking}));
                }

                let text = message.text();
                if !text.is_empty() {
                    blocks.push(json!({"type": "text", "text": text}));
                }

                for call in &message.tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.function.name,
                        "input": call.function.arguments,
                    }));
                }

                spec.push(json!({"role": "assistant", "content": blocks}));
            }
            Role::User | Role::Assistant => {
                spec.push(json!({"role": message.role, "content": message.content}));
            }
            Role::Tool => {
                spec.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": message.tool_call_id,
                        "content": message.content,
                    }]
                }));
            }
        }
    }

    (system, spec)
}

/// Convert internal tool schemas to anthropic's tool definitions
pub fn tools_to_anthropic_spec(tools: &[ToolSchema]) -> Result<Vec<Value>, ProviderError> {
    let mut tool_names = HashSet::new();
    let mut result = Vec::new();

    for tool in tools {
        if !tool_names.insert(&tool.name) {
            return Err(ProviderError::InvalidRequest(format!(
                "Duplicate tool name: {}",
                tool.name
            )));
        }

        result.push(json!({
            "name": tool.name,
            "description": tool.description,
            "input_schema": tool.input_schema,
        }));
    }

    Ok(result)
}

/// Build the full request payload
pub fn create_request(
    model: &str,
    messages: &[Message],
    tools: &[ToolSchema],
    max_tokens: u32,
) -> Result<Value, ProviderError> {
    let (system, messages_spec) = messages_to_anthropic_spec(messages);

    let mut payload = Map::new();
    payload.insert("model".to_string(), json!(model));
    payload.insert("messages".to_string(), json!(messages_spec));
    payload.insert("max_tokens".to_string(), json!(max_tokens));

    if let Some(system) = system.filter(|s| s.as_str() != Some("")) {
        payload.insert("system".to_string(), system);
    }

    if !tools.is_empty() {
        payload.insert(
            "tools".to_string(),
            json!(tools_to_anthropic_spec(tools)?),
        );
    }

    Ok(Value::Object(payload))
}

/// Recognize the two error envelopes a response body can carry
pub fn check_error_envelope(response: &Value, model: &str) -> Result<(), ProviderError> {
    if response.get("type").and_then(Value::as_str) == Some("error") {
        let error = response.get("error").cloned().unwrap_or(Value::Null);
        return Err(ProviderError::Api {
            kind: error
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error")
                .to_string(),
        });
    }

    if let Some(base_resp) = response.get("base_resp") {
        let Some(code) = base_resp.get("status_code").and_then(Value::as_i64) else {
            return Ok(());
        };
        if VENDOR_OK_CODES.contains(&code) {
            return Ok(());
        }

        let message = base_resp
            .get("status_msg")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        return Err(match code {
            VENDOR_INSUFFICIENT_BALANCE => ProviderError::InsufficientBalance(message),
            VENDOR_MODEL_NOT_SUPPORTED => ProviderError::ModelNotSupported {
                model: model.to_string(),
                message,
            },
            _ => ProviderError::Vendor { code, message },
        });
    }

    Ok(())
}

/// Convert anthropic's API response to a parsed reply
pub fn anthropic_response_to_provider_response(
    response: &Value,
) -> Result<ProviderResponse, ProviderError> {
    let blocks = match response.get("content") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(blocks)) => blocks.clone(),
        Some(other) => {
            return Err(ProviderError::InvalidResponse(format!(
                "Expected a list of content blocks, got: {}",
                other
            )))
        }
    };

    let mut content = String::new();
    let mut thinking = String::new();
    let mut tool_calls = Vec::new();

    for block in &blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                content.push_str(block.get("text").and_then(Value::as_str).unwrap_or_default());
            }
            Some("thinking") => {
                thinking.push_str(
                    block
                        .get("thinking")
                        .and_then(Value::as_str)
                        .unwrap_or_default(),
                );
            }
            Some("tool_use") => {
                let id = block
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ProviderError::InvalidResponse("tool_use block without id".into()))?;
                let name = block
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        ProviderError::InvalidResponse("tool_use block without name".into())
                    })?;
                let input = block.get("input").cloned().unwrap_or_else(|| json!({}));
                tool_calls.push(ToolCall::new(id, name, input));
            }
            other => {
                tracing::debug!(block_type = ?other, "ignoring unknown content block");
            }
        }
    }

    let finish_reason = response
        .get("stop_reason")
        .and_then(Value::as_str)
        .unwrap_or("stop")
        .to_string();

    let usage = response
        .get("usage")
        .map(|usage| {
            Usage::new(
                usage
                    .get("input_tokens")
                    .and_then(Value::as_i64)
                    .map(|v| v as i32),
                usage
                    .get("output_tokens")
                    .and_then(Value::as_i64)
                    .map(|v| v as i32),
            )
        })
        .unwrap_or_default();

    Ok(ProviderResponse {
        content,
        thinking: (!thinking.is_empty()).then_some(thinking),
        tool_calls,
        finish_reason,
        usage,
    })
}
