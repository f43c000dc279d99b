use directories::UserDirs;
use std::fs;
use std::path::{Path, PathBuf};

use super::EngineConfig;
use crate::error::ConfigError;

/// `~/.storyloom/config.toml`
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .ok_or_else(|| ConfigError::Load("could not find home directory".into()))?;
    Ok(home.join(".storyloom").join("config.toml"))
}

impl EngineConfig {
    /// Load from `path` (or the default location). A missing file yields the
    /// built-in defaults; a malformed one is an error.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_path()?,
        };

        let mut config = if config_path.exists() {
            load_from_path(&config_path)?
        } else {
            tracing::debug!(path = %config_path.display(), "no config file, using defaults");
            Self::default()
        };
        config.config_path = config_path;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("STORYLOOM_API_KEY")
            && !key.is_empty()
        {
            if self.embedding.api_key.is_none() {
                self.embedding.api_key = Some(key.clone());
            }
            self.chat.api_key = Some(key);
        }

        if let Ok(base_url) = std::env::var("STORYLOOM_BASE_URL")
            && !base_url.is_empty()
        {
            self.embedding.base_url.clone_from(&base_url);
            self.chat.base_url = base_url;
        }

        if let Ok(model) = std::env::var("STORYLOOM_MODEL")
            && !model.is_empty()
        {
            for tier in [
                &mut self.tiers.free,
                &mut self.tiers.regular,
                &mut self.tiers.vip,
            ] {
                tier.default_model.clone_from(&model);
            }
        }

        if let Ok(model) = std::env::var("STORYLOOM_EMBEDDING_MODEL")
            && !model.is_empty()
        {
            self.embedding.model = model;
        }
    }
}

fn load_from_path(path: &Path) -> Result<EngineConfig, ConfigError> {
    let contents = fs::read_to_string(path)?;
    toml::from_str(&contents)
        .map_err(|e| ConfigError::Load(format!("failed to parse {}: {e}", path.display())))
}
