use super::error::ToolInvokeError;
use super::interface::ProviderTransport;
use crate::config::{Launch, ResolvedEndpoint};
use crate::constants::PROTOCOL_VERSION;
use crate::domain::ToolDescriptor;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

const SESSION_HEADER: &str = "mcp-session-id";

/// Tool provider reached over HTTP JSON-RPC POSTs.
///
/// Endpoint env entries are sent as request headers.
pub struct HttpTransport {
    label: String,
    url: String,
    client: reqwest::Client,
    headers: HeaderMap,
    session_id: AsyncMutex<Option<String>>,
    id_counter: AtomicU64,
    open: AtomicBool,
    instructions: Option<String>,
    tools: Vec<ToolDescriptor>,
}

impl HttpTransport {
    pub async fn connect(endpoint: &ResolvedEndpoint) -> Result<Self, ToolInvokeError> {
        let Launch::Url(url) = &endpoint.launch else {
            return Err(ToolInvokeError::Transport {
                server: endpoint.label.clone(),
                message: "endpoint does not describe a URL".to_string(),
            });
        };

        let mut transport = Self {
            label: endpoint.label.clone(),
            url: url.clone(),
            client: reqwest::Client::new(),
            headers: build_headers(&endpoint.label, &endpoint.env)?,
            session_id: AsyncMutex::new(None),
            id_counter: AtomicU64::new(1),
            open: AtomicBool::new(true),
            instructions: None,
            tools: Vec::new(),
        };

        let init = transport
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "clientInfo": {
                        "name": env!("CARGO_PKG_NAME"),
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                    "capabilities": {}
                }),
            )
            .await?;
        transport.instructions = init
            .get("instructions")
            .and_then(Value::as_str)
            .map(String::from);
        transport
            .notify("notifications/initialized", json!({}))
            .await?;

        let listed = transport.request("tools/list", json!({})).await?;
        transport.tools = parse_tools(&listed);
        info!(
            server = %transport.label,
            tools = transport.tools.len(),
            "HTTP provider ready"
        );
        Ok(transport)
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, ToolInvokeError> {
        let id = self.id_counter.fetch_add(1, Ordering::SeqCst);
        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let body = self.post(&payload).await?;
        let message = extract_response(&body, id).ok_or_else(|| ToolInvokeError::Transport {
            server: self.label.clone(),
            message: format!("no JSON-RPC response for request {id}"),
        })?;

        if let Some(error) = message.get("error") {
            return Err(ToolInvokeError::Rpc {
                server: self.label.clone(),
                code: error.get("code").and_then(Value::as_i64).unwrap_or(-32000),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            });
        }
        Ok(message.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), ToolInvokeError> {
        let payload = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        self.post(&payload).await.map(|_| ())
    }

    async fn post(&self, payload: &Value) -> Result<String, ToolInvokeError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(ToolInvokeError::Terminated {
                server: self.label.clone(),
            });
        }

        let mut request = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .json(payload);
        if let Some(session) = self.session_id.lock().await.as_deref() {
            request = request.header(SESSION_HEADER, session);
        }

        let response = request.send().await.map_err(|err| self.transport(err))?;
        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            *self.session_id.lock().await = Some(session.to_string());
        }

        let status = response.status();
        let text = response.text().await.map_err(|err| self.transport(err))?;
        if !status.is_success() {
            return Err(ToolInvokeError::Transport {
                server: self.label.clone(),
                message: format!(
                    "HTTP {}: {}",
                    status.as_u16(),
                    text.chars().take(400).collect::<String>()
                ),
            });
        }
        Ok(text)
    }

    fn transport(&self, err: reqwest::Error) -> ToolInvokeError {
        ToolInvokeError::Transport {
            server: self.label.clone(),
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl ProviderTransport for HttpTransport {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolInvokeError> {
        Ok(self.tools.clone())
    }

    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value, ToolInvokeError> {
        let arguments = match arguments {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        self.request("tools/call", json!({ "name": tool, "arguments": arguments }))
            .await
    }

    async fn instructions(&self) -> Option<String> {
        self.instructions.clone()
    }

    async fn close(&self) -> Result<(), ToolInvokeError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let Some(session) = self.session_id.lock().await.take() else {
            return Ok(());
        };
        // Servers without session support answer 405; either way we are done.
        match self
            .client
            .delete(&self.url)
            .headers(self.headers.clone())
            .header(SESSION_HEADER, session)
            .send()
            .await
        {
            Ok(response) => {
                debug!(server = %self.label, status = %response.status(), "closed HTTP session");
            }
            Err(err) => debug!(server = %self.label, %err, "failed to close HTTP session"),
        }
        Ok(())
    }
}

fn build_headers(
    label: &str,
    entries: &HashMap<String, String>,
) -> Result<HeaderMap, ToolInvokeError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("application/json, text/event-stream"),
    );
    for (key, value) in entries {
        let invalid = |message: String| ToolInvokeError::Transport {
            server: label.to_string(),
            message,
        };
        let name = HeaderName::from_bytes(key.trim().as_bytes())
            .map_err(|err| invalid(format!("invalid header name '{key}': {err}")))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|err| invalid(format!("invalid header value for '{key}': {err}")))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

/// Finds the response to `id` in either a plain JSON body or an SSE stream.
fn extract_response(body: &str, id: u64) -> Option<Value> {
    let trimmed = body.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return match value {
            Value::Array(batch) => batch.into_iter().find(|item| matches_id(item, id)),
            single => Some(single),
        };
    }

    trimmed
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .filter_map(|data| serde_json::from_str::<Value>(data.trim()).ok())
        .find(|message| matches_id(message, id))
}

fn matches_id(message: &Value, id: u64) -> bool {
    match message.get("id") {
        Some(Value::Number(num)) => num.as_u64() == Some(id),
        Some(Value::String(text)) => text == &id.to_string(),
        _ => false,
    }
}

fn parse_tools(result: &Value) -> Vec<ToolDescriptor> {
    result
        .get("tools")
        .and_then(Value::as_array)
        .map(|tools| {
            tools
                .iter()
                .filter_map(|tool| serde_json::from_value::<ToolDescriptor>(tool.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}
