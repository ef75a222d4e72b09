use super::endpoint::EndpointSpec;
use super::error::ConfigError;
use super::provider::ModelProviderConfig;
use crate::constants::{
    DEFAULT_CLARIFICATION_MARKER, DEFAULT_MAX_TURNS, DEFAULT_TOOL_CALL_TIMEOUT_SECS,
};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration loaded from relay.toml
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub project_root: PathBuf,
    pub model: String,
    pub max_turns: usize,
    pub tool_call_timeout: Duration,
    pub system_prompt: Option<String>,
    pub clarification_marker: String,
    pub provider: ModelProviderConfig,
    pub endpoints: Vec<EndpointSpec>,
}

impl AppConfig {
    /// Load configuration from a file path (or default path if None)
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        super::loader::load_config(path)
    }

    pub fn new(model: impl Into<String>) -> Self {
        Self {
            project_root: PathBuf::from("."),
            model: model.into(),
            max_turns: DEFAULT_MAX_TURNS,
            tool_call_timeout: Duration::from_secs(DEFAULT_TOOL_CALL_TIMEOUT_SECS),
            system_prompt: None,
            clarification_marker: DEFAULT_CLARIFICATION_MARKER.to_string(),
            provider: ModelProviderConfig::default(),
            endpoints: Vec::new(),
        }
    }
}
