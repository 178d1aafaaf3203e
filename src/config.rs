//! Configuration module for imgstash

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::paths;

const MB: u64 = 1024 * 1024;

/// Cache budgets, mutable at runtime via [`CacheConfigUpdate`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Byte budget across all cached files
    #[serde(default = "default_max_cache_size_bytes")]
    pub max_cache_size_bytes: u64,

    /// Entries older than this (since first download) are stale
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: u64,

    /// Item budget
    #[serde(default = "default_max_items")]
    pub max_items: usize,

    /// Quality hint for callers that re-encode images (0.0 - 1.0).
    /// The cache itself never looks at it.
    #[serde(default = "default_compression_quality")]
    pub compression_quality: f32,
}

fn default_max_cache_size_bytes() -> u64 {
    100 * MB
}

fn default_max_age_hours() -> u64 {
    24 * 7
}

fn default_max_items() -> usize {
    1000
}

fn default_compression_quality() -> f32 {
    0.8
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cache_size_bytes: default_max_cache_size_bytes(),
            max_age_hours: default_max_age_hours(),
            max_items: default_max_items(),
            compression_quality: default_compression_quality(),
        }
    }
}

impl CacheConfig {
    /// Max age as a chrono duration
    pub fn max_age(&self) -> chrono::Duration {
        i64::try_from(self.max_age_hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .unwrap_or(chrono::Duration::MAX)
    }

    /// Shallow-merge the fields set in `update`
    pub fn apply(&mut self, update: &CacheConfigUpdate) {
        if let Some(v) = update.max_cache_size_bytes {
            self.max_cache_size_bytes = v;
        }
        if let Some(v) = update.max_age_hours {
            self.max_age_hours = v;
        }
        if let Some(v) = update.max_items {
            self.max_items = v;
        }
        if let Some(v) = update.compression_quality {
            self.compression_quality = v;
        }
    }
}

/// Partial config; `None` fields are left untouched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheConfigUpdate {
    /// New byte budget
    pub max_cache_size_bytes: Option<u64>,
    /// New age budget
    pub max_age_hours: Option<u64>,
    /// New item budget
    pub max_items: Option<usize>,
    /// New quality hint
    pub compression_quality: Option<f32>,
}

/// On-disk settings for the imgstash binary
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Cache budgets
    #[serde(default)]
    pub cache: CacheConfig,

    /// Override for the image directory
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

impl Settings {
    /// Get the default settings file path
    pub fn default_path() -> Result<PathBuf> {
        paths::config_path()
    }

    /// Load settings from the default path or create default
    pub fn load() -> Result<Self> {
        let path = Self::default_path()?;
        Self::load_from(&path)
    }

    /// Load settings from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            Ok(Self::default())
        }
    }

    /// Save settings to the default path
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path()?;
        self.save_to(&path)
    }

    /// Save settings to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content).context("Failed to write config file")?;

        Ok(())
    }

    /// Resolve the image directory (override or platform default)
    pub fn resolved_cache_dir(&self) -> Result<PathBuf> {
        match &self.cache_dir {
            Some(dir) => Ok(dir.clone()),
            None => paths::default_cache_dir(),
        }
    }
}
