use super::app::AppConfig;
use super::endpoint::{EndpointKind, EndpointSpec};
use super::error::ConfigError;
use super::provider::{ModelProviderConfig, RawProviderConfig};
use crate::constants::{
    CONFIG_PATH, DEFAULT_CLARIFICATION_MARKER, DEFAULT_MAX_TURNS, DEFAULT_OPENAI_API_PATH,
    DEFAULT_TOOL_CALL_TIMEOUT_SECS, ENV_PATH,
};
use dotenvy::from_filename;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Once;
use std::time::Duration;
use tracing::{debug, warn};

static ENV_LOADER: Once = Once::new();

/// Raw configuration structure for deserialization from TOML
#[derive(Debug, Deserialize, Default)]
pub(super) struct RawConfig {
    pub project_root: Option<String>,
    pub model: Option<String>,
    pub max_turns: Option<usize>,
    pub tool_call_timeout_secs: Option<u64>,
    pub system_prompt: Option<String>,
    pub clarification_marker: Option<String>,
    #[serde(default)]
    pub provider: Option<RawProviderConfig>,
    #[serde(default)]
    pub endpoints: Vec<RawEndpoint>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(super) enum RawEndpoint {
    Spec(String),
    Detailed {
        path: String,
        #[serde(default)]
        kind: Option<EndpointKind>,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
}

/// Ensures environment variables are loaded from config/.env
pub fn ensure_env_loaded() {
    ENV_LOADER.call_once(|| {
        let _ = from_filename(ENV_PATH);
    });
}

/// Load and validate configuration from a file path
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    ensure_env_loaded();
    let config_path = path.unwrap_or_else(|| Path::new(CONFIG_PATH));
    read_config(config_path)
}

/// Parse configuration text; relative roots resolve against `base_dir`.
pub fn parse_config(content: &str, base_dir: &Path) -> Result<AppConfig, ConfigError> {
    let parsed: RawConfig = toml::from_str(content).map_err(|source| ConfigError::Parse {
        path: base_dir.to_path_buf(),
        source,
    })?;
    validate_and_build(parsed, base_dir)
}

fn read_config(path: &Path) -> Result<AppConfig, ConfigError> {
    debug!(path = %path.display(), "Reading relay configuration file");

    let content = fs::read_to_string(path).map_err(|source| {
        if source.kind() == io::ErrorKind::NotFound {
            ConfigError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;

    let parsed: RawConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let base_dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    validate_and_build(parsed, &base_dir)
}

fn validate_and_build(parsed: RawConfig, base_dir: &Path) -> Result<AppConfig, ConfigError> {
    let model = parsed.model.ok_or(ConfigError::MissingModel)?;
    let max_turns = parsed.max_turns.unwrap_or(DEFAULT_MAX_TURNS);
    if max_turns == 0 {
        return Err(ConfigError::InvalidMaxTurns);
    }

    let project_root = match parsed.project_root {
        Some(raw) => {
            let expanded = PathBuf::from(expand(&raw));
            if expanded.is_absolute() {
                expanded
            } else {
                base_dir.join(expanded)
            }
        }
        None => env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    };

    let provider = match parsed.provider {
        Some(raw) => build_provider(raw)?,
        None => ModelProviderConfig::openai(resolve_api_key("openai", Some("OPENAI_API_KEY"))),
    };

    let mut endpoints = Vec::with_capacity(parsed.endpoints.len());
    for (index, raw) in parsed.endpoints.into_iter().enumerate() {
        let spec = match raw {
            RawEndpoint::Spec(text) => EndpointSpec::parse(&text)
                .map_err(|source| ConfigError::InvalidEndpoint { index, source })?,
            RawEndpoint::Detailed {
                path,
                kind,
                args,
                env,
            } => EndpointSpec {
                path,
                kind,
                args: args.iter().map(|arg| expand(arg)).collect(),
                env,
            },
        };
        endpoints.push(spec);
    }

    Ok(AppConfig {
        project_root,
        model,
        max_turns,
        tool_call_timeout: Duration::from_secs(
            parsed
                .tool_call_timeout_secs
                .unwrap_or(DEFAULT_TOOL_CALL_TIMEOUT_SECS),
        ),
        system_prompt: parsed.system_prompt,
        clarification_marker: parsed
            .clarification_marker
            .filter(|marker| !marker.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CLARIFICATION_MARKER.to_string()),
        provider,
        endpoints,
    })
}

fn build_provider(raw: RawProviderConfig) -> Result<ModelProviderConfig, ConfigError> {
    let id = raw.id.unwrap_or_else(|| "openai".to_string());
    let endpoint = raw
        .endpoint
        .filter(|endpoint| !endpoint.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingEndpoint {
            provider: id.clone(),
        })?;
    let api_key = resolve_api_key(&id, raw.api_key.as_deref());
    Ok(ModelProviderConfig {
        api_path: raw
            .api_path
            .unwrap_or_else(|| DEFAULT_OPENAI_API_PATH.to_string()),
        id,
        endpoint: expand(&endpoint),
        api_key,
    })
}

/// Reads the API key from the environment variable named in the config.
pub fn resolve_api_key(provider: &str, spec: Option<&str>) -> Option<String> {
    let raw = spec.map(str::trim)?;
    if raw.is_empty() {
        return None;
    }
    match env::var(raw) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(
                provider,
                env_var = raw,
                %err,
                "API key environment variable is not set"
            );
            None
        }
    }
}

fn expand(value: &str) -> String {
    shellexpand::full(value)
        .map(|cow| cow.into_owned())
        .unwrap_or_else(|_| value.to_string())
}
