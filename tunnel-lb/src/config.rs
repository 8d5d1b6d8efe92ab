// Configuration file parser

//! Configuration loading and validation
//!
//! Configuration comes from an optional TOML file, then `SERVER_URL`,
//! `API_KEY` and `LOG_LEVEL` from the environment override the file values.

use crate::types::Config;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Environment variable overriding `server.url`
pub const ENV_SERVER_URL: &str = "SERVER_URL";
/// Environment variable overriding `server.api_key`
pub const ENV_API_KEY: &str = "API_KEY";
/// Environment variable overriding `general.log_level`
pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";

/// Load configuration from an optional TOML file plus the process environment
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => parse_config_file(path)?,
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    validate_config(&config)?;
    Ok(config)
}

fn parse_config_file(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path).context("Failed to read config file")?;
    toml::from_str(&contents).context("Failed to parse config file")
}

/// Override file values with environment values where present and non-empty
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

    if let Some(url) = get(ENV_SERVER_URL) {
        config.server.url = url;
    }
    if let Some(key) = get(ENV_API_KEY) {
        config.server.api_key = key;
    }
    if let Some(level) = get(ENV_LOG_LEVEL) {
        config.general.log_level = level;
    }
}

/// Validate configuration values
pub fn validate_config(config: &Config) -> Result<()> {
    if config.server.api_key.is_empty() {
        anyhow::bail!("API key is required (set server.api_key or {})", ENV_API_KEY);
    }

    let url = config.server.url.as_str();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        anyhow::bail!("server.url must be an http(s) URL, got '{}'", url);
    }

    if config.server.request_timeout == 0 {
        anyhow::bail!("server.request_timeout must be > 0");
    }

    if config.controller.workers == 0 {
        anyhow::bail!("controller.workers must be > 0");
    }

    if !config.controller.watch_ingresses && !config.controller.watch_services {
        anyhow::bail!("at least one of controller.watch_ingresses / watch_services must be enabled");
    }

    if config.tunnel.wg_quick.trim().is_empty() {
        anyhow::bail!("tunnel.wg_quick cannot be empty");
    }

    Ok(())
}
