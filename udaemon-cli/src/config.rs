//! YAML application configuration of the demo daemon.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use udaemon_runtime::BoxError;

pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";
pub const DEFAULT_SERVER_PORT: u16 = 9000;
pub const DEFAULT_MESSAGE: &str = "hello world!";

/// Server the demo keeps a connection to, and the greeting it sends.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub server_host: String,
    pub server_port: u16,
    pub message: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server_host: DEFAULT_SERVER_HOST.to_string(),
            server_port: DEFAULT_SERVER_PORT,
            message: DEFAULT_MESSAGE.to_string(),
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }
}

/// Config parser hook: the first load falls back to built-in defaults, a
/// failed reload keeps the running configuration.
pub fn parse(path: &Path, previous: Option<&AppConfig>) -> Result<AppConfig, BoxError> {
    match AppConfig::load(path) {
        Ok(config) => {
            tracing::debug!(path = %path.display(), ?config, "configuration parsed");
            Ok(config)
        }
        Err(err) if previous.is_none() => {
            tracing::warn!(error = %format!("{err:#}"), "using built-in configuration");
            Ok(AppConfig::default())
        }
        Err(err) => Err(err.into()),
    }
}

/// Config cleanup hook.
pub fn release(config: &AppConfig) {
    tracing::debug!(
        server = %config.server_host,
        port = config.server_port,
        "configuration released"
    );
}
