use super::error::ToolInvokeError;
use super::http::HttpTransport;
use super::interface::{ProviderConnector, ProviderTransport};
use crate::config::{Launch, ResolvedEndpoint};
use async_trait::async_trait;
use std::sync::Arc;

/// Opens stdio child processes for local and package endpoints and HTTP
/// sessions for networked ones.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultConnector;

#[async_trait]
impl ProviderConnector for DefaultConnector {
    async fn open(
        &self,
        endpoint: &ResolvedEndpoint,
    ) -> Result<Arc<dyn ProviderTransport>, ToolInvokeError> {
        match &endpoint.launch {
            Launch::Url(_) => Ok(Arc::new(HttpTransport::connect(endpoint).await?)),
            Launch::Process { .. } => open_process(endpoint).await,
        }
    }
}

#[cfg(feature = "native-transport")]
async fn open_process(
    endpoint: &ResolvedEndpoint,
) -> Result<Arc<dyn ProviderTransport>, ToolInvokeError> {
    let transport = super::process::StdioTransport::spawn(endpoint).await?;
    Ok(Arc::new(transport))
}

#[cfg(not(feature = "native-transport"))]
async fn open_process(
    endpoint: &ResolvedEndpoint,
) -> Result<Arc<dyn ProviderTransport>, ToolInvokeError> {
    Err(ToolInvokeError::Unsupported {
        server: endpoint.label.clone(),
        kind: endpoint.kind,
    })
}
