use crate::error::{to_env_var, ConfigError, ENV_PREFIX};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use skiff::agent::DEFAULT_MAX_STEPS;
use skiff::providers::configs::{
    AnthropicProviderConfig, DEFAULT_HOST, DEFAULT_MAX_TOKENS, DEFAULT_MODEL,
};
use skiff::providers::retry::RetryConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_exponential_base")]
    pub exponential_base: f64,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            exponential_base: default_exponential_base(),
            jitter: true,
        }
    }
}

impl RetrySettings {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            enabled: self.enabled,
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            exponential_base: self.exponential_base,
            jitter: self.jitter,
            on_retry: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LlmSettings {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub retry: RetrySettings,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: default_api_base(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            retry: RetrySettings::default(),
        }
    }
}

impl LlmSettings {
    pub fn provider_config(&self) -> Result<AnthropicProviderConfig, ConfigError> {
        let api_key = self
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| ConfigError::MissingField {
                env_var: to_env_var("llm.api_key"),
            })?;

        Ok(AnthropicProviderConfig::new(api_key)
            .with_host(&self.api_base)
            .with_model(&self.model)
            .with_max_tokens(self.max_tokens))
    }
}

#[derive(Debug, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            workspace_dir: default_workspace_dir(),
            system_prompt: default_system_prompt(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ToolSettings {
    #[serde(default = "default_true")]
    pub enable_file_tools: bool,
    #[serde(default = "default_true")]
    pub enable_bash: bool,
    #[serde(default = "default_true")]
    pub enable_note: bool,
    /// Relative to the workspace directory
    #[serde(default = "default_note_file")]
    pub note_file: PathBuf,
    #[serde(default = "default_true")]
    pub enable_mcp: bool,
    /// JSON file listing MCP servers; relative paths resolve against the working directory
    #[serde(default = "default_mcp_config")]
    pub mcp_config: PathBuf,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            enable_file_tools: true,
            enable_bash: true,
            enable_note: true,
            note_file: default_note_file(),
            enable_mcp: true,
            mcp_config: default_mcp_config(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingSettings {
    /// Write a transcript file for every run
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: default_log_dir(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub llm: LlmSettings,
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub tools: ToolSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Settings {
    /// Load settings from `path` (or the default location) layered with `SKIFF__*`
    /// environment variables. An explicitly given file must exist.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(path) => (Some(path.to_path_buf()), true),
            None => (default_config_path(), false),
        };

        let mut builder = Config::builder();
        if let Some(path) = path {
            tracing::debug!(path = %path.display(), required, "loading config file");
            builder = builder.add_source(
                File::new(&path.to_string_lossy(), FileFormat::Yaml).required(required),
            );
        }

        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        Ok(settings)
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("skiff").join("config.yaml"))
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_exponential_base() -> f64 {
    2.0
}

fn default_api_base() -> String {
    DEFAULT_HOST.to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

fn default_max_steps() -> usize {
    DEFAULT_MAX_STEPS
}

fn default_workspace_dir() -> PathBuf {
    PathBuf::from("./workspace")
}

fn default_system_prompt() -> String {
    "You are a helpful AI assistant that completes tasks with the tools available to you."
        .to_string()
}

fn default_note_file() -> PathBuf {
    PathBuf::from(".agent_memory.json")
}

fn default_mcp_config() -> PathBuf {
    PathBuf::from("mcp.json")
}

fn default_log_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".skiff").join("log"))
        .unwrap_or_else(|| PathBuf::from(".skiff/log"))
}
