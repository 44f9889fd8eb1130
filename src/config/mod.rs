pub mod validation;

use serde::{Deserialize, Serialize};
use std::fmt;

use self::validation::validate_config;

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Inline markup the upstream is known to emit in its answer text.
///
/// Selects the content adapter for every session against this upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MarkupMode {
    #[default]
    None,
    Tags,
}

impl fmt::Display for MarkupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarkupMode::None => write!(f, "none"),
            MarkupMode::Tags => write!(f, "tags"),
        }
    }
}

/// Which delta field carries reasoning text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningField {
    /// Accept `reasoning_content`, falling back to `reasoning`.
    #[default]
    Auto,
    Reasoning,
    ReasoningContent,
}

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_worker_threads: Option<usize>,
}

fn default_port() -> u16 {
    8082
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_timeout() -> u64 {
    300
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            timeout: default_timeout(),
            runtime_worker_threads: None,
        }
    }
}

/// Upstream chat-completions backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Replaces the client's model name when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub markup: MarkupMode,
    #[serde(default = "default_tool_tags")]
    pub tool_tags: Vec<String>,
    #[serde(default = "default_max_markup_buffer_bytes")]
    pub max_markup_buffer_bytes: usize,
    #[serde(default)]
    pub reasoning_field: ReasoningField,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
}

fn default_tool_tags() -> Vec<String> {
    vec!["tool".to_string(), "tool_call".to_string()]
}
fn default_max_markup_buffer_bytes() -> usize {
    512 * 1024
}
fn default_retry_max_attempts() -> u32 {
    2
}

impl UpstreamConfig {
    /// Upstream config pointing at `base_url` with every other field defaulted.
    #[must_use]
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            model: None,
            markup: MarkupMode::default(),
            tool_tags: default_tool_tags(),
            max_markup_buffer_bytes: default_max_markup_buffer_bytes(),
            reasoning_field: ReasoningField::default(),
            retry_max_attempts: default_retry_max_attempts(),
        }
    }

    /// `{base_url}/chat/completions`, tolerating a trailing slash.
    #[must_use]
    pub fn chat_completions_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let mut url = String::with_capacity(base.len() + 18);
        url.push_str(base);
        url.push_str("/chat/completions");
        url
    }
}

/// Feature flags and settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    /// Used when the client omits `max_tokens`.
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u64,
}

fn default_log_level() -> String {
    "INFO".to_string()
}
fn default_max_tokens() -> u64 {
    4096
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            default_max_tokens: default_max_tokens(),
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
}

/// Load configuration from a YAML file and validate it.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] when reading the file fails, [`ConfigError::Yaml`]
/// when parsing fails, or [`ConfigError::Validation`] when semantic validation fails.
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents)
}

/// Parse and validate configuration from YAML text.
///
/// # Errors
///
/// Returns [`ConfigError::Yaml`] or [`ConfigError::Validation`].
pub fn parse_config(contents: &str) -> Result<AppConfig, ConfigError> {
    let config: AppConfig = serde_yaml::from_str(contents)?;
    validate_config(&config)?;
    Ok(config)
}
