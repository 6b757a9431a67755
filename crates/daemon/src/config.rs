// Shadowlink - Daemon Configuration

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use shadowlink_common::is_loopback_address;

const CONFIG_DIR: &str = "shadowlink";
const CONFIG_FILE: &str = "daemon.toml";

fn default_bind_address() -> String {
    "127.0.0.1:3480".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Address the REST API listens on. Must stay on loopback since
    /// the transport is plain HTTP.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Override for the PID file location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid_file: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            pid_file: None,
        }
    }
}

impl DaemonConfig {
    /// Load the configuration. On first run the defaults are persisted
    /// so the file is there to edit.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "no configuration found, writing defaults");
            let config = Self::default();
            config.save_to(path)?;
            return Ok(config);
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self =
            toml::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let raw = toml::to_string_pretty(self).context("failed to serialize configuration")?;
        std::fs::write(path, raw)
            .with_context(|| format!("failed to write {}", path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("failed to set permissions on {}", path.display()))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let addr: SocketAddr = self
            .bind_address
            .parse()
            .with_context(|| format!("invalid bind address {:?}", self.bind_address))?;
        if !is_loopback_address(&addr.ip().to_string()) {
            bail!("bind address {addr} is not loopback; refusing to expose the plain-HTTP API");
        }
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let base = dirs::config_dir().context("could not determine the config directory")?;
        Ok(base.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    pub fn pid_file_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.pid_file {
            return Ok(path.clone());
        }
        let base = dirs::runtime_dir()
            .or_else(dirs::cache_dir)
            .context("could not determine a runtime directory for the PID file")?;
        Ok(base.join(CONFIG_DIR).join("daemon.pid"))
    }
}
