//! Message adapters - convert between domain messages and API formats

use crate::domain::{ChatMessage, MessageRole, ToolCall, ToolDescriptor};
use serde_json::{Value, json};

/// Adapter for converting messages to different API formats
pub struct MessageAdapter;

impl MessageAdapter {
    /// Convert messages to OpenAI-style chat format, including tool calls
    /// and tool results.
    pub fn to_openai_format(messages: &[ChatMessage]) -> Vec<Value> {
        messages
            .iter()
            .map(|msg| match msg.role {
                MessageRole::Assistant if msg.has_tool_calls() => json!({
                    "role": "assistant",
                    "content": msg.content.clone(),
                    "tool_calls": msg.tool_calls.iter().map(Self::tool_call).collect::<Vec<_>>(),
                }),
                MessageRole::Tool => json!({
                    "role": "tool",
                    "tool_call_id": msg.tool_call_id.clone().unwrap_or_default(),
                    "content": msg.content.clone().unwrap_or_default(),
                }),
                role => json!({
                    "role": role.as_str(),
                    "content": msg.content.clone().unwrap_or_default(),
                }),
            })
            .collect()
    }

    /// Function-tool declarations for the `tools` request field.
    pub fn to_openai_tools(tools: &[ToolDescriptor]) -> Vec<Value> {
        tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.input_schema,
                    }
                })
            })
            .collect()
    }

    fn tool_call(call: &ToolCall) -> Value {
        json!({
            "id": call.id,
            "type": "function",
            "function": {
                "name": call.name,
                "arguments": call.arguments.to_string(),
            }
        })
    }

    /// Arguments arrive as a JSON-encoded string; keep the raw text when it
    /// does not parse.
    pub fn parse_arguments(raw: &str) -> Value {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return json!({});
        }
        serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(raw.to_string()))
    }
}
