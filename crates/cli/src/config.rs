//! Configuration loading from skiff.toml.

use runtime::DEFAULT_MAX_ROUNDS;
use runtime::providers::{DEFAULT_BASE_URL, DEFAULT_MAX_TOKENS};
use serde::Deserialize;
use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;

/// Config file looked up in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "skiff.toml";

const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub session: SessionConfig,
}

/// Model provider configuration.
#[derive(Debug, Deserialize)]
pub struct BackendConfig {
    /// Model to use.
    #[serde(default = "default_model")]
    pub model: String,

    /// Anthropic API key. Falls back to `ANTHROPIC_API_KEY`.
    pub api_key: Option<String>,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            api_key: None,
            max_tokens: default_max_tokens(),
            base_url: default_base_url(),
        }
    }
}

/// Orchestration and tool-server settings.
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    /// Model turns allowed per query. Must be at least 1.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: NonZeroUsize,

    /// System prompt sent with every model call.
    pub system: Option<String>,

    /// Per-request timeout for the tool server, in seconds. 0 disables it.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            system: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl SessionConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_max_rounds() -> NonZeroUsize {
    NonZeroUsize::new(DEFAULT_MAX_ROUNDS).unwrap_or(NonZeroUsize::MIN)
}

fn default_request_timeout_secs() -> u64 {
    mcp::DEFAULT_TIMEOUT.as_secs()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML string.
    pub fn parse(toml: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load the explicit path, else `skiff.toml` if present, else defaults.
    pub fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match explicit {
            Some(path) => Self::load(path),
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::load(DEFAULT_CONFIG_FILE),
            None => Ok(Self::default()),
        }
    }

    /// The API key from config, or from the environment.
    pub fn api_key(&self) -> Result<String, ConfigError> {
        self.api_key_or(std::env::var(API_KEY_ENV).ok())
    }

    fn api_key_or(&self, env_key: Option<String>) -> Result<String, ConfigError> {
        self.backend
            .api_key
            .clone()
            .or(env_key)
            .filter(|key| !key.trim().is_empty())
            .ok_or(ConfigError::MissingApiKey)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("API key not configured: set backend.api_key or ANTHROPIC_API_KEY")]
    MissingApiKey,
}
