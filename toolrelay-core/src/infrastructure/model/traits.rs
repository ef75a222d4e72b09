//! Model traits

use super::types::{ModelError, ModelRequest, ModelResponse};
use async_trait::async_trait;
use std::sync::Arc;

/// Trait for model provider implementations
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Send a chat request to the model provider
    async fn chat(&self, request: ModelRequest) -> Result<ModelResponse, ModelError>;
}

#[async_trait]
impl<P: ModelProvider + ?Sized> ModelProvider for Arc<P> {
    async fn chat(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        (**self).chat(request).await
    }
}
