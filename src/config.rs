//! On-disk JSON configuration discovery.
//!
//! A `.pgfluent.json` file names one DSN per logical pool:
//!
//! ```json
//! {
//!     "databases": {
//!         "default": { "dsn": "postgres://app@db:5432/app", "max_size": 8 }
//!     }
//! }
//! ```
//!
//! Discovery walks from the working directory up to the filesystem root,
//! then falls back to the home directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::Result;

pub const CONFIG_FILE: &str = ".pgfluent.json";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub databases: HashMap<String, DatabaseSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    pub dsn: String,
    #[serde(default)]
    pub max_size: Option<usize>,
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

/// Locate the nearest config file starting from the working directory.
pub fn discover() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    discover_from(&cwd)
}

/// Locate the nearest config file starting from `start`, walking up to the
/// root and then trying the home directory.
pub fn discover_from(start: &Path) -> Option<PathBuf> {
    for dir in start.ancestors() {
        let candidate = dir.join(CONFIG_FILE);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    let home = dirs::home_dir()?;
    let candidate = home.join(CONFIG_FILE);
    candidate.is_file().then_some(candidate)
}

/// Parse a config file.
pub fn load(path: &Path) -> Result<Settings> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Discover and parse, `None` when no config file exists.
pub fn load_discovered() -> Result<Option<Settings>> {
    match discover() {
        Some(path) => Ok(Some(load(&path)?)),
        None => Ok(None),
    }
}
