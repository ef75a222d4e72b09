use crate::application::tooling::RegistryError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to start bridge worker: {0}")]
    Start(String),
    #[error("bridge worker is not running")]
    Closed,
    #[error("bridge operation panicked: {0}")]
    OperationPanicked(String),
    #[error("bridge operation submitted from the bridge thread itself")]
    Reentrant,
}

/// Errors surfaced by [`super::BlockingToolClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}
