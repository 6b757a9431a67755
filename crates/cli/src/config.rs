// Shadowlink - CLI Configuration
// Where to find the daemon's REST API

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

fn default_daemon_url() -> String {
    "http://127.0.0.1:3480".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    /// Base URL of the daemon's REST API
    #[serde(default = "default_daemon_url")]
    pub daemon_url: String,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            daemon_url: default_daemon_url(),
        }
    }
}

impl CliConfig {
    /// Load the CLI configuration, falling back to defaults when the
    /// file does not exist.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;
        Ok(config)
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("shadowlink").join("cli.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_points_at_loopback() {
        let config = CliConfig::default();
        assert_eq!(config.daemon_url, "http://127.0.0.1:3480");
    }

    #[test]
    fn empty_toml_falls_back_to_default_url() {
        let config: CliConfig = toml::from_str("").unwrap();
        assert_eq!(config.daemon_url, "http://127.0.0.1:3480");
    }

    #[test]
    fn explicit_url_is_kept() {
        let config: CliConfig = toml::from_str("daemon_url = \"http://127.0.0.1:9999\"").unwrap();
        assert_eq!(config.daemon_url, "http://127.0.0.1:9999");
    }
}
