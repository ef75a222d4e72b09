use crate::config::EndpointKind;
use std::time::Duration;
use thiserror::Error;

/// Failures raised by a single provider transport.
#[derive(Debug, Error)]
pub enum ToolInvokeError {
    #[error("failed to spawn provider '{server}': {source}")]
    Spawn {
        server: String,
        #[source]
        source: std::io::Error,
    },
    #[error("provider '{server}' transport error: {message}")]
    Transport { server: String, message: String },
    #[error("provider '{server}' returned invalid JSON: {source}")]
    InvalidJson {
        server: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("provider '{server}' returned JSON-RPC error {code}: {message}")]
    Rpc {
        server: String,
        code: i64,
        message: String,
    },
    #[error("provider '{server}' terminated unexpectedly")]
    Terminated { server: String },
    #[error("provider '{server}' request cancelled")]
    Cancelled { server: String },
    #[error("provider '{server}' did not answer within {limit:?}")]
    TimedOut { server: String, limit: Duration },
    #[error("{kind} endpoints are not supported in this build ('{server}')")]
    Unsupported { server: String, kind: EndpointKind },
}

impl ToolInvokeError {
    /// True when the channel itself is unusable, as opposed to the provider
    /// rejecting one request.
    pub fn is_channel_failure(&self) -> bool {
        !matches!(self, ToolInvokeError::Rpc { .. })
    }
}
