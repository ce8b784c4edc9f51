mod types;

pub use types::*;

use anyhow::{Context, Result};
use std::path::Path;

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    validate_config(&config)?;

    Ok(config)
}

/// Load config from default locations or return default config
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<Config> {
    if let Some(path) = custom_path {
        return load_config(path);
    }

    // Try default locations
    let default_paths = [
        "./previewly.toml",
        "./config.toml",
        "~/.config/previewly/config.toml",
        "/etc/previewly/config.toml",
    ];

    for path_str in default_paths {
        let path = shellexpand::tilde(path_str);
        let path = Path::new(path.as_ref());
        if path.exists() {
            return load_config(path);
        }
    }

    Ok(Config::default())
}

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    if config.server.port == 0 {
        anyhow::bail!("Server port cannot be 0");
    }

    if let Some(dir) = &config.server.static_dir {
        if !dir.exists() {
            tracing::warn!("Static directory does not exist: {:?}", dir);
        }
    }

    config
        .buffer
        .validate()
        .context("Invalid [buffer] section")?;

    if config.fetch.timeout_secs == 0 {
        anyhow::bail!("fetch.timeout_secs must be positive");
    }
    if config.fetch.initial_backoff_ms > config.fetch.max_backoff_ms {
        anyhow::bail!(
            "fetch.initial_backoff_ms ({}) exceeds fetch.max_backoff_ms ({})",
            config.fetch.initial_backoff_ms,
            config.fetch.max_backoff_ms
        );
    }

    if config.sessions.max_concurrent == 0 {
        anyhow::bail!("sessions.max_concurrent must be at least 1");
    }
    if config.sessions.cleanup_interval_secs == 0 {
        anyhow::bail!("sessions.cleanup_interval_secs must be positive");
    }

    Ok(())
}
