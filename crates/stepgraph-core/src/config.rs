use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StepGraphError};

/// Top-level stepgraph configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub apps: AppsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model_id: default_model_id(),
            api_key: None,
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
            extra_headers: HashMap::new(),
        }
    }
}

fn default_provider() -> String { "ollama".to_string() }
fn default_model_id() -> String { "llama3.2:3b".to_string() }
fn default_max_tokens() -> u32 { 1024 }
fn default_temperature() -> f32 { 0.7 }
fn default_timeout_secs() -> u64 { 120 }

/// Run-level engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Run the steps of a fan-out concurrently (default: true).
    #[serde(default = "default_parallel")]
    pub parallel: bool,
    /// Abort a run after this many seconds. Unset means no deadline.
    #[serde(default)]
    pub deadline_secs: Option<u64>,
    /// Abort a run after this many step executions. Unset means unbounded.
    #[serde(default)]
    pub step_limit: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallel: default_parallel(),
            deadline_secs: None,
            step_limit: None,
        }
    }
}

impl EngineConfig {
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs.map(Duration::from_secs)
    }
}

fn default_parallel() -> bool { true }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppsConfig {
    #[serde(default)]
    pub tweet: TweetConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TweetConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

impl Default for TweetConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
        }
    }
}

fn default_max_iterations() -> u32 { 5 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StepGraphError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml(&content)
    }

    /// Parse config from a TOML string, with env var expansion.
    pub fn from_toml(content: &str) -> Result<Self> {
        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(content);

        let config: AppConfig =
            toml::from_str(&expanded).map_err(|e| StepGraphError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "Config file absent, using defaults");
            Ok(Self::default())
        }
    }

    fn validate(&self) -> Result<()> {
        if self.model.model_id.trim().is_empty() {
            return Err(StepGraphError::Config("model.model_id must not be empty".into()));
        }
        if self.apps.tweet.max_iterations == 0 {
            return Err(StepGraphError::Config(
                "apps.tweet.max_iterations must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}
