//! Configuration loading, validation, and management for Parley.
//!
//! Loads configuration from `~/.parley/config.toml` (or `PARLEY_CONFIG`)
//! with environment variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `~/.parley/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Language model endpoint
    #[serde(default)]
    pub llm: LlmConfig,

    /// ReAct loop budgets and limits
    #[serde(default)]
    pub agent: AgentConfig,

    /// Tool providers and the gateway cache
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Session-to-session messaging
    #[serde(default)]
    pub bus: BusConfig,

    /// Session persistence
    #[serde(default)]
    pub session: SessionConfig,
}

// ── LLM ──

#[derive(Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider label (e.g., "openai", "openrouter", "ollama")
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Base URL of an OpenAI-compatible API; derived from `provider` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Upper bound on tokens per LLM turn
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_provider() -> String {
    "openai".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            api_url: None,
            api_key: None,
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

/// Redact a secret for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmConfig")
            .field("provider", &self.provider)
            .field("api_url", &self.api_url)
            .field("api_key", &redact(&self.api_key))
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

// ── Agent loop ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Wall-clock budget for a whole task
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Token budget of the first turn of a task
    #[serde(default = "default_first_turn_tokens")]
    pub first_turn_tokens: u32,

    /// Token budget of every later turn
    #[serde(default = "default_turn_tokens")]
    pub turn_tokens: u32,

    /// Chunks still read after a closing tag, for trailing usage metadata
    #[serde(default = "default_trailing_chunks")]
    pub trailing_chunks: usize,

    /// Remaining time below which an iteration is not started
    #[serde(default = "default_timeout_margin_secs")]
    pub timeout_margin_secs: u64,

    #[serde(default = "default_first_turn_min_secs")]
    pub first_turn_min_secs: u64,

    #[serde(default = "default_turn_min_secs")]
    pub turn_min_secs: u64,

    #[serde(default = "default_first_turn_cap_secs")]
    pub first_turn_cap_secs: u64,

    #[serde(default = "default_turn_cap_secs")]
    pub turn_cap_secs: u64,

    #[serde(default = "default_scratchpad_limit")]
    pub scratchpad_limit: usize,

    #[serde(default = "default_scratchpad_keep")]
    pub scratchpad_keep: usize,

    #[serde(default = "default_qa_limit")]
    pub qa_limit: usize,

    #[serde(default = "default_qa_keep")]
    pub qa_keep: usize,

    /// Tool results longer than this are truncated in observations
    #[serde(default = "default_observation_max_chars")]
    pub observation_max_chars: usize,

    /// Consecutive tool failures before a recovery hint is injected
    #[serde(default = "default_consecutive_failure_limit")]
    pub consecutive_failure_limit: u32,
}

fn default_max_iterations() -> u32 {
    20
}
fn default_timeout_secs() -> u64 {
    300
}
fn default_first_turn_tokens() -> u32 {
    1024
}
fn default_turn_tokens() -> u32 {
    512
}
fn default_trailing_chunks() -> usize {
    3
}
fn default_timeout_margin_secs() -> u64 {
    2
}
fn default_first_turn_min_secs() -> u64 {
    15
}
fn default_turn_min_secs() -> u64 {
    8
}
fn default_first_turn_cap_secs() -> u64 {
    60
}
fn default_turn_cap_secs() -> u64 {
    30
}
fn default_scratchpad_limit() -> usize {
    60
}
fn default_scratchpad_keep() -> usize {
    30
}
fn default_qa_limit() -> usize {
    80
}
fn default_qa_keep() -> usize {
    50
}
fn default_observation_max_chars() -> usize {
    2000
}
fn default_consecutive_failure_limit() -> u32 {
    3
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            timeout_secs: default_timeout_secs(),
            first_turn_tokens: default_first_turn_tokens(),
            turn_tokens: default_turn_tokens(),
            trailing_chunks: default_trailing_chunks(),
            timeout_margin_secs: default_timeout_margin_secs(),
            first_turn_min_secs: default_first_turn_min_secs(),
            turn_min_secs: default_turn_min_secs(),
            first_turn_cap_secs: default_first_turn_cap_secs(),
            turn_cap_secs: default_turn_cap_secs(),
            scratchpad_limit: default_scratchpad_limit(),
            scratchpad_keep: default_scratchpad_keep(),
            qa_limit: default_qa_limit(),
            qa_keep: default_qa_keep(),
            observation_max_chars: default_observation_max_chars(),
            consecutive_failure_limit: default_consecutive_failure_limit(),
        }
    }
}

impl AgentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// ── Tools ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// How long a discovered tool list stays fresh
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Extra attempts after a failed tool call
    #[serde(default = "default_retries")]
    pub retries: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Per-request timeout on a provider RPC
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub providers: Vec<ToolProviderConfig>,
}

fn default_cache_ttl_secs() -> u64 {
    300
}
fn default_retries() -> u32 {
    2
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
            retries: default_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            providers: Vec::new(),
        }
    }
}

/// A tool provider subprocess speaking JSON-RPC over stdio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolProviderConfig {
    pub name: String,

    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,
}

// ── Bus ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Namespace for registry keys and channels
    #[serde(default = "default_bus_prefix")]
    pub prefix: String,

    /// Pause before a dropped subscription is re-established
    #[serde(default = "default_resubscribe_delay_ms")]
    pub resubscribe_delay_ms: u64,
}

fn default_bus_prefix() -> String {
    "parley".into()
}
fn default_resubscribe_delay_ms() -> u64 {
    500
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            prefix: default_bus_prefix(),
            resubscribe_delay_ms: default_resubscribe_delay_ms(),
        }
    }
}

// ── Session ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Directory holding one JSON file per session
    #[serde(default = "default_session_dir")]
    pub dir: PathBuf,

    /// Replaces the built-in system prompt when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

fn default_session_dir() -> PathBuf {
    AppConfig::config_dir().join("sessions")
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            dir: default_session_dir(),
            system_prompt: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path.
    ///
    /// `PARLEY_CONFIG` selects another file. Environment overrides:
    /// - `PARLEY_API_KEY` (highest priority), then `OPENAI_API_KEY`
    /// - `PARLEY_MODEL`
    /// - `PARLEY_API_URL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = std::env::var("PARLEY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::config_dir().join("config.toml"));
        Self::load_at(&config_path)
    }

    /// Load `path` and apply the environment overrides on top.
    pub fn load_at(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from(path)?;
        config.apply_env();
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("PARLEY_API_KEY") {
            self.llm.api_key = Some(key);
        } else if self.llm.api_key.is_none() {
            self.llm.api_key = std::env::var("OPENAI_API_KEY").ok();
        }

        if let Ok(model) = std::env::var("PARLEY_MODEL") {
            self.llm.model = model;
        }

        if let Ok(url) = std::env::var("PARLEY_API_URL") {
            self.llm.api_url = Some(url);
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".parley")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(ConfigError::ValidationError(
                "llm.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.agent.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_iterations must be at least 1".into(),
            ));
        }

        if self.agent.timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "agent.timeout_secs must be at least 1".into(),
            ));
        }

        if self.agent.scratchpad_keep >= self.agent.scratchpad_limit {
            return Err(ConfigError::ValidationError(
                "agent.scratchpad_keep must be below agent.scratchpad_limit".into(),
            ));
        }

        if self.agent.qa_keep >= self.agent.qa_limit {
            return Err(ConfigError::ValidationError(
                "agent.qa_keep must be below agent.qa_limit".into(),
            ));
        }

        let mut seen = HashSet::new();
        for provider in &self.tools.providers {
            if !seen.insert(provider.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate tool provider name '{}'",
                    provider.name
                )));
            }
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.llm.api_key.is_some()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.agent.max_iterations, 20);
        assert_eq!(config.agent.timeout(), Duration::from_secs(300));
        assert_eq!(config.tools.cache_ttl_secs, 300);
        assert_eq!(config.bus.prefix, "parley");
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.llm.model, config.llm.model);
        assert_eq!(parsed.agent.qa_limit, config.agent.qa_limit);
    }

    #[test]
    fn invalid_temperature_rejected() {
        let mut config = AppConfig::default();
        config.llm.temperature = 5.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn keep_must_be_below_limit() {
        let mut config = AppConfig::default();
        config.agent.scratchpad_keep = 60;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.agent.qa_keep = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_provider_names_rejected() {
        let toml_str = r#"
[[tools.providers]]
name = "market"
command = "market-server"

[[tools.providers]]
name = "market"
command = "other"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("market"));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let toml_str = r#"
[agent]
max_iterations = 5

[[tools.providers]]
name = "fs"
command = "npx"
args = ["-y", "fs-server"]
env = { ROOT = "/tmp" }
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.agent.max_iterations, 5);
        assert_eq!(config.agent.timeout_secs, 300);
        assert_eq!(config.tools.providers[0].args, vec!["-y", "fs-server"]);
        assert_eq!(config.tools.providers[0].env["ROOT"], "/tmp");
        assert_eq!(config.tools.retries, 2);
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let result = AppConfig::load_from(Path::new("/nonexistent/config.toml"));
        assert!(result.is_ok());
        assert_eq!(result.unwrap().llm.provider, "openai");
    }

    #[test]
    fn load_from_file_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[agent]\nmax_iterations = 0\n").unwrap();
        assert!(matches!(
            AppConfig::load_from(&path),
            Err(ConfigError::ValidationError(_))
        ));

        std::fs::write(&path, "not = [valid").unwrap();
        assert!(matches!(
            AppConfig::load_from(&path),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn api_key_is_redacted_in_debug() {
        let mut config = AppConfig::default();
        config.llm.api_key = Some("sk-secret".into());
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("[REDACTED]"));
    }
}
