use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::ConfigError;
use crate::tier::TierPolicy;

/// Pipeline component whose chat model can be configured independently.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Component {
    Understanding,
    Director,
    Writer,
    Consistency,
}

impl Component {
    pub const ALL: [Self; 4] = [
        Self::Understanding,
        Self::Director,
        Self::Writer,
        Self::Consistency,
    ];

    /// Components whose failure aborts a request.
    pub fn is_load_bearing(self) -> bool {
        matches!(self, Self::Understanding | Self::Writer)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Path to config.toml - computed, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    #[serde(default)]
    pub engine: EngineSettings,

    #[serde(default)]
    pub tiers: TierPolicy,

    #[serde(default)]
    pub chat: ChatConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Per-component overrides of the default chat backend.
    #[serde(default)]
    pub models: BTreeMap<Component, ModelConfig>,

    #[serde(default)]
    pub prompts: PromptOverrides,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::new(),
            engine: EngineSettings::default(),
            tiers: TierPolicy::default(),
            chat: ChatConfig::default(),
            embedding: EmbeddingConfig::default(),
            models: BTreeMap::new(),
            prompts: PromptOverrides::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tiers.validate()?;
        let e = &self.engine;
        if e.max_query_length == 0 {
            return Err(ConfigError::Validation(
                "engine.max_query_length must be positive".into(),
            ));
        }
        if e.batch_concurrency == 0 {
            return Err(ConfigError::Validation(
                "engine.batch_concurrency must be positive".into(),
            ));
        }
        if e.chunk_size == 0 {
            return Err(ConfigError::Validation(
                "engine.chunk_size must be positive".into(),
            ));
        }
        if !(0.0..=2.0).contains(&self.chat.temperature) {
            return Err(ConfigError::Validation(
                "chat.temperature must be within 0.0..=2.0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Maximum user query length in characters
    #[serde(default = "default_max_query_length")]
    pub max_query_length: usize,
    /// Concurrent requests during batch generation
    #[serde(default = "default_batch_concurrency")]
    pub batch_concurrency: usize,
    /// Characters of each memory shown to the writer
    #[serde(default = "default_memory_display_chars")]
    pub memory_display_chars: usize,
    /// Most recent conversation turns kept verbatim
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
    #[serde(default = "default_health_timeout_secs")]
    pub health_timeout_secs: u64,
    /// Max characters per chunk for document splitting
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_max_query_length() -> usize {
    2000
}
fn default_batch_concurrency() -> usize {
    4
}
fn default_memory_display_chars() -> usize {
    500
}
fn default_history_turns() -> usize {
    5
}
fn default_health_timeout_secs() -> u64 {
    5
}
fn default_chunk_size() -> usize {
    800
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_query_length: default_max_query_length(),
            batch_concurrency: default_batch_concurrency(),
            memory_display_chars: default_memory_display_chars(),
            history_turns: default_history_turns(),
            health_timeout_secs: default_health_timeout_secs(),
            chunk_size: default_chunk_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_temperature() -> f64 {
    0.8
}
fn default_max_retries() -> u32 {
    2
}
fn default_backoff_ms() -> u64 {
    250
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            temperature: default_temperature(),
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl ChatConfig {
    pub fn as_model_config(&self) -> ModelConfig {
        ModelConfig {
            model_id: None,
            api_key: self.api_key.clone(),
            base_url: Some(self.base_url.clone()),
            temperature: Some(self.temperature),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Embedding model name (e.g. "text-embedding-3-small")
    #[serde(default = "default_embedding_model")]
    pub model: String,
    /// Embedding vector dimensions
    #[serde(default = "default_embedding_dims")]
    pub dimensions: usize,
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}
fn default_embedding_dims() -> usize {
    1536
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            model: default_embedding_model(),
            dimensions: default_embedding_dims(),
        }
    }
}

/// Credentials and defaults for one component's chat model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
}

impl ModelConfig {
    /// Require non-empty `api_key` and an http(s) `base_url`.
    pub fn validate(&self, component: Component) -> Result<(), ConfigError> {
        let missing = |field| ConfigError::MissingCredential {
            component: component.to_string(),
            field,
        };

        if self.api_key.as_deref().is_none_or(|k| k.trim().is_empty()) {
            return Err(missing("api_key"));
        }
        let base_url = self
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| missing("base_url"))?;

        let parsed = url::Url::parse(base_url).map_err(|e| {
            ConfigError::Validation(format!("{component}: invalid base_url: {e}"))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::Validation(format!(
                "{component}: base_url must use http(s)"
            )));
        }
        if let Some(t) = self.temperature
            && !(0.0..=2.0).contains(&t)
        {
            return Err(ConfigError::Validation(format!(
                "{component}: temperature must be within 0.0..=2.0"
            )));
        }
        Ok(())
    }
}

/// Optional replacements for the built-in stage prompt templates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptOverrides {
    #[serde(default)]
    pub understanding: Option<String>,
    #[serde(default)]
    pub director: Option<String>,
    #[serde(default)]
    pub writer: Option<String>,
    #[serde(default)]
    pub consistency: Option<String>,
}
