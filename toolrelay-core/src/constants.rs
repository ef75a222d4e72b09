//! Application constants
//!
//! Single source of truth for paths and other constants.

/// Default configuration file path
pub const CONFIG_PATH: &str = "config/relay.toml";

/// Default environment file path
pub const ENV_PATH: &str = "config/.env";

pub const DEFAULT_MAX_TURNS: usize = 10;
pub const DEFAULT_TOOL_CALL_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_CLARIFICATION_MARKER: &str = "NEEDS_CLARIFICATION";
pub const DEFAULT_OPENAI_ENDPOINT: &str = "https://api.openai.com";
pub const DEFAULT_OPENAI_API_PATH: &str = "/v1/chat/completions";

/// MCP protocol revision announced during `initialize`.
pub const PROTOCOL_VERSION: &str = "2025-06-18";
