use crate::constants::{DEFAULT_OPENAI_API_PATH, DEFAULT_OPENAI_ENDPOINT};
use serde::Deserialize;

/// LLM backend settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelProviderConfig {
    pub id: String,
    pub endpoint: String,
    pub api_key: Option<String>,
    pub api_path: String,
}

impl ModelProviderConfig {
    pub fn openai(api_key: Option<String>) -> Self {
        Self {
            id: "openai".to_string(),
            endpoint: DEFAULT_OPENAI_ENDPOINT.to_string(),
            api_key,
            api_path: DEFAULT_OPENAI_API_PATH.to_string(),
        }
    }
}

impl Default for ModelProviderConfig {
    fn default() -> Self {
        Self::openai(None)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub(crate) struct RawProviderConfig {
    #[serde(default)]
    pub id: Option<String>,
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_path: Option<String>,
}
