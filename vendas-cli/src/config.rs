// CLI configuration loaded from TOML

use crate::output::Format;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "VENDAS_CONFIG";

/// Config file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "vendas.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Dump file or export directory
    pub data_path: PathBuf,
    pub collection: String,
    pub sort: bool,
    pub format: Format,
    /// Default `tracing` filter when RUST_LOG is unset
    pub log_level: String,
    pub extract: ExtractConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    pub markdown: PathBuf,
    pub output_dir: PathBuf,
    pub lang: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_path: PathBuf::from("vendas.json"),
            collection: vendas_core::SALES_COLLECTION.to_string(),
            sort: false,
            format: Format::Pretty,
            log_level: "warn".to_string(),
            extract: ExtractConfig::default(),
        }
    }
}

impl Default for ExtractConfig {
    fn default() -> Self {
        ExtractConfig {
            markdown: PathBuf::from("README.md"),
            output_dir: PathBuf::from("querys"),
            lang: "javascript".to_string(),
        }
    }
}

/// Where the config comes from: `--config`, then `$VENDAS_CONFIG`, then `vendas.toml`.
/// The flag is `required`: a missing explicit file is an error.
pub fn resolve_path(explicit: Option<&Path>, env: Option<String>) -> (PathBuf, bool) {
    match (explicit, env) {
        (Some(path), _) => (path.to_path_buf(), true),
        (None, Some(path)) if !path.is_empty() => (PathBuf::from(path), true),
        _ => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    }
}

impl Config {
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config")
    }

    /// Load the config; returns the file it was read from, if any
    pub fn load(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        let (path, required) = resolve_path(explicit, std::env::var(CONFIG_ENV).ok());

        if !path.exists() {
            if required {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            return Ok((Config::default(), None));
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok((config, Some(path)))
    }
}
