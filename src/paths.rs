//! Common paths for imgstash data storage
//!
//! Settings and the durable store live under ~/.config/imgstash/:
//! - config.toml - Cache budgets and directory override
//! - store.sqlite - Persisted index and hit/miss counters
//!
//! Image files themselves go to the platform cache directory.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

/// Get the imgstash data directory (~/.config/imgstash/)
pub fn imgstash_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    let dir = home.join(".config").join("imgstash");
    fs::create_dir_all(&dir).context("Failed to create imgstash directory")?;
    Ok(dir)
}

/// Get the config file path (~/.config/imgstash/config.toml)
pub fn config_path() -> Result<PathBuf> {
    Ok(imgstash_dir()?.join("config.toml"))
}

/// Get the durable store path (~/.config/imgstash/store.sqlite)
pub fn store_path() -> Result<PathBuf> {
    Ok(imgstash_dir()?.join("store.sqlite"))
}

/// Get the default image directory (<cache dir>/imgstash/images)
///
/// Not created here; the cache creates it on initialize.
pub fn default_cache_dir() -> Result<PathBuf> {
    let base = dirs::cache_dir()
        .or_else(dirs::home_dir)
        .context("Could not determine cache directory")?;
    Ok(base.join("imgstash").join("images"))
}
