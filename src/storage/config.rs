//! JSON Configuration Management
//!
//! Handles reading and writing the engine configuration file.

use std::fs;
use std::path::{Path, PathBuf};

use crate::models::settings::EngineConfig;
use crate::utils::error::{AppError, AppResult};
use crate::utils::paths::{config_path, ensure_agent_chat_dir, ensure_dir, history_dir};

/// Configuration service for managing engine settings
#[derive(Debug)]
pub struct ConfigService {
    config_path: PathBuf,
    config: EngineConfig,
}

impl ConfigService {
    /// Load ~/.agent-chat/config.json, writing defaults on first run
    pub fn new() -> AppResult<Self> {
        ensure_agent_chat_dir()?;
        Self::with_path(config_path()?)
    }

    /// Load configuration from an explicit path, writing defaults if it is missing
    pub fn with_path(path: impl Into<PathBuf>) -> AppResult<Self> {
        let config_path = path.into();
        let config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            if let Some(parent) = config_path.parent() {
                ensure_dir(parent)?;
            }
            let default_config = EngineConfig::default();
            Self::save_to_file(&config_path, &default_config)?;
            default_config
        };

        Ok(Self {
            config_path,
            config,
        })
    }

    /// Load configuration from a file
    fn load_from_file(path: &Path) -> AppResult<EngineConfig> {
        let content = fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&content)?;
        config.validate().map_err(AppError::validation)?;
        Ok(config)
    }

    /// Save configuration to a file with pretty formatting
    fn save_to_file(path: &Path, config: &EngineConfig) -> AppResult<()> {
        config.validate().map_err(AppError::validation)?;
        let content = serde_json::to_string_pretty(config)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// File the configuration was loaded from
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Get a clone of the current configuration
    pub fn get_config_clone(&self) -> EngineConfig {
        self.config.clone()
    }

    /// Directory the file history store should use
    pub fn history_dir(&self) -> AppResult<PathBuf> {
        match &self.config.history_dir {
            Some(dir) => Ok(PathBuf::from(dir)),
            None => history_dir(),
        }
    }
}
