use super::error::{BridgeError, ClientError};
use super::worker::BridgeHandle;
use crate::application::agent::{ConversationDriver, ConversationOutcome};
use crate::application::tooling::{
    CloseSummary, ConnectionRegistry, SessionInfo, ToolCatalog, ToolOutput,
};
use crate::config::EndpointSpec;
use crate::domain::Task;
use crate::infrastructure::model::ModelProvider;
use serde_json::Value;
use std::sync::Arc;

/// Synchronous facade over a registry whose I/O all runs on the bridge.
#[derive(Clone)]
pub struct BlockingToolClient {
    bridge: BridgeHandle,
    registry: Arc<ConnectionRegistry>,
}

impl BlockingToolClient {
    pub fn new(bridge: BridgeHandle, registry: Arc<ConnectionRegistry>) -> Self {
        Self { bridge, registry }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn connect(&self, specs: Vec<EndpointSpec>) -> Result<ToolCatalog, ClientError> {
        let registry = Arc::clone(&self.registry);
        let catalog = self
            .bridge
            .submit(move || async move { registry.connect(&specs).await })??;
        Ok(catalog)
    }

    pub fn invoke(&self, name: &str, arguments: Value) -> Result<ToolOutput, ClientError> {
        let registry = Arc::clone(&self.registry);
        let name = name.to_string();
        let output = self
            .bridge
            .submit(move || async move { registry.invoke(&name, arguments).await })??;
        Ok(output)
    }

    /// Routing lookups touch no provider and skip the bridge.
    pub fn tool_owner(&self, name: &str) -> Option<SessionInfo> {
        self.registry.tool_owner(name)
    }

    pub fn catalog(&self) -> ToolCatalog {
        self.registry.catalog()
    }

    pub fn close_all(&self) -> Result<CloseSummary, BridgeError> {
        let registry = Arc::clone(&self.registry);
        self.bridge
            .submit(move || async move { registry.close_all().await })
    }

    pub fn run_conversation<P>(
        &self,
        driver: Arc<ConversationDriver<P>>,
        task: Task,
    ) -> Result<ConversationOutcome, BridgeError>
    where
        P: ModelProvider + 'static,
    {
        let registry = Arc::clone(&self.registry);
        self.bridge
            .submit(move || async move { driver.run(&task, &*registry).await })
    }
}
