//! Configuration module for tomopipe
//!
//! This module handles loading and saving [`PipelineSettings`].
//!
//! # Settings Location
//!
//! Settings are read from `$TOMOPIPE_CONFIG` when it is set, otherwise from
//! the platform-appropriate config location:
//! - **Linux**: `~/.config/dev.tomviz.tomopipe/settings.toml`
//! - **macOS**: `~/Library/Application Support/dev.tomviz.tomopipe/settings.toml`
//! - **Windows**: `%APPDATA%\dev.tomviz.tomopipe\settings.toml`
//!
//! # Example
//!
//! ```ignore
//! use tomopipe::config::PipelineSettings;
//!
//! let mut settings = PipelineSettings::load_or_default();
//! settings.set_value("docker.image", "tomviz/pipeline")?;
//! settings.save()?;
//! ```

pub mod settings;

pub use settings::*;

use crate::error::{PipelineError, Result};
use std::path::{Path, PathBuf};

/// Application identifier for config directories
pub const APP_ID: &str = "dev.tomviz.tomopipe";

/// Settings filename
pub const SETTINGS_FILE: &str = "settings.toml";

/// Environment variable overriding the settings path
pub const CONFIG_ENV_VAR: &str = "TOMOPIPE_CONFIG";

// ==================== Config Directory ====================

/// Get the application config directory path
pub fn app_config_dir() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_ID))
}

/// Ensure the app config directory exists
pub fn ensure_app_config_dir() -> Result<PathBuf> {
    let dir = app_config_dir().ok_or_else(|| {
        PipelineError::Config("Could not determine app config directory".to_string())
    })?;

    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| {
            PipelineError::Config(format!("Failed to create app config directory: {}", e))
        })?;
    }

    Ok(dir)
}

/// Path of the settings file, honouring `$TOMOPIPE_CONFIG`
pub fn settings_path() -> Option<PathBuf> {
    match std::env::var_os(CONFIG_ENV_VAR) {
        Some(path) if !path.is_empty() => Some(PathBuf::from(path)),
        _ => app_config_dir().map(|p| p.join(SETTINGS_FILE)),
    }
}

// ==================== Persistence ====================

impl PipelineSettings {
    /// Load settings from the default location
    ///
    /// A missing file yields the defaults.
    pub fn load() -> Result<Self> {
        let path = settings_path().ok_or_else(|| {
            PipelineError::Config("Could not determine settings path".to_string())
        })?;
        Self::load_from(&path)
    }

    /// Load settings from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("Failed to read settings: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| PipelineError::Config(format!("Failed to parse settings: {}", e)))
    }

    /// Load settings, returning defaults on any error
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_else(|e| {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save settings to the default location
    pub fn save(&self) -> Result<()> {
        let path = match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => ensure_app_config_dir()?.join(SETTINGS_FILE),
        };
        self.save_to(&path)
    }

    /// Save settings to an explicit path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    PipelineError::Config(format!("Failed to create settings directory: {}", e))
                })?;
            }
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| PipelineError::Config(format!("Failed to serialize settings: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| PipelineError::Config(format!("Failed to write settings: {}", e)))?;

        tracing::info!("Saved settings to {:?}", path);
        Ok(())
    }
}
