#![allow(dead_code)]

use std::path::{Path, PathBuf};
use toolrelay_core::EndpointSpec;

pub const FAKE_SERVER: &str = env!("CARGO_BIN_EXE_fake-mcp-server");

pub fn fake_server_path() -> PathBuf {
    PathBuf::from(FAKE_SERVER)
}

pub fn fake_server_dir() -> PathBuf {
    Path::new(FAKE_SERVER)
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Endpoint for the fake provider exposing `tools`.
pub fn fake_endpoint(tools: &str) -> EndpointSpec {
    EndpointSpec::new(FAKE_SERVER).with_env("FAKE_TOOLS", tools)
}

pub fn fake_endpoint_with_prefix(tools: &str, prefix: &str) -> EndpointSpec {
    fake_endpoint(tools).with_env("FAKE_ECHO_PREFIX", prefix)
}
