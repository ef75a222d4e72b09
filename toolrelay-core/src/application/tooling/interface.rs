use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use super::error::ToolInvokeError;
use super::registry::RegistryError;
use crate::config::ResolvedEndpoint;
use crate::domain::ToolDescriptor;

/// A live channel to one tool provider.
#[async_trait]
pub trait ProviderTransport: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolInvokeError>;

    /// Returns the raw `tools/call` result payload.
    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value, ToolInvokeError>;

    /// Usage notes the provider announced during its handshake.
    async fn instructions(&self) -> Option<String>;

    /// Bumped whenever the provider's tool list changes after connect.
    fn tool_revision(&self) -> u64 {
        0
    }

    async fn close(&self) -> Result<(), ToolInvokeError>;
}

/// Opens transports for resolved endpoints.
#[async_trait]
pub trait ProviderConnector: Send + Sync {
    async fn open(
        &self,
        endpoint: &ResolvedEndpoint,
    ) -> Result<Arc<dyn ProviderTransport>, ToolInvokeError>;
}

/// What the conversation driver needs from the registry.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, name: &str, arguments: Value) -> Result<ToolOutput, RegistryError>;

    async fn descriptors(&self) -> Vec<ToolDescriptor>;

    /// Provider usage notes to fold into the system prompt.
    async fn instructions(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Rendered result of a successful tool call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
    pub raw: Value,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            raw: serde_json::json!({
                "content": [{ "type": "text", "text": content.clone() }]
            }),
            content,
            is_error: false,
        }
    }

    pub fn from_result(raw: Value) -> Self {
        let is_error = raw
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let content = raw
            .get("content")
            .map(render_content)
            .or_else(|| raw.get("structuredContent").map(Value::to_string))
            .unwrap_or_else(|| match &raw {
                Value::String(text) => text.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            });
        Self {
            content,
            is_error,
            raw,
        }
    }
}

fn render_content(value: &Value) -> String {
    let Some(items) = value.as_array() else {
        return match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
    };
    let chunks: Vec<String> = items
        .iter()
        .map(|item| {
            item.get("text")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| item.to_string())
        })
        .collect();
    chunks.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_text_blocks_joined_by_newlines() {
        let output = ToolOutput::from_result(json!({
            "content": [
                { "type": "text", "text": "first" },
                { "type": "text", "text": "second" }
            ]
        }));
        assert_eq!(output.content, "first\nsecond");
        assert!(!output.is_error);
    }

    #[test]
    fn keeps_error_flag_and_non_text_blocks() {
        let output = ToolOutput::from_result(json!({
            "isError": true,
            "content": [{ "type": "image", "data": "xx" }]
        }));
        assert!(output.is_error);
        assert!(output.content.contains("\"image\""));
    }

    #[test]
    fn falls_back_to_structured_content() {
        let output = ToolOutput::from_result(json!({ "structuredContent": { "sum": 3 } }));
        assert_eq!(output.content, r#"{"sum":3}"#);
    }
}
