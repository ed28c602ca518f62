//! Configuration loading for the CLI
//!
//! The engine's layered loader does the work; this module adds CLI context to
//! errors, applies per-run flags and renders the effective configuration.

use std::path::Path;

use anyhow::{Context, Result};
use locaited::AppConfig;

use crate::DiscoverArgs;

/// Load the engine configuration from `path` or `./locaited.toml`
pub fn load(path: Option<&Path>) -> Result<AppConfig> {
    AppConfig::load(path).with_context(|| match path {
        Some(path) => format!("Failed to load configuration from {}", path.display()),
        None => "Failed to load configuration".to_string(),
    })
}

/// Fold per-run flags into the loaded configuration
pub fn apply_flags(mut config: AppConfig, args: &DiscoverArgs) -> AppConfig {
    if args.no_verify {
        config.workflow.verification_enabled = false;
    }
    config
}

/// Effective configuration as TOML
pub fn render(config: &AppConfig) -> Result<String> {
    toml::to_string_pretty(config).context("Failed to render configuration")
}
