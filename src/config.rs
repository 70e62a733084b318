//! Client configuration for sealchat.
//!
//! Stored in `~/.sealchat/config.toml`. Every field has a default, so a
//! missing file or a partial one is fine.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chat::{SessionConfig, TcpTransport};

/// Errors that can occur when loading or saving configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config directory not found. Unable to determine home directory.")]
    NoConfigDir,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

/// Default relay address.
pub const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:7410";

/// Settings for a chat client.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    /// Relay address for the TCP transport.
    pub server_addr: String,

    /// Base URL of the public key directory, if one is used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory_url: Option<String>,

    /// Where local identity keys live. Defaults to `~/.sealchat/keys.json`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_store_path: Option<PathBuf>,

    pub session: SessionConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: DEFAULT_SERVER_ADDR.to_string(),
            directory_url: None,
            key_store_path: None,
            session: SessionConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load from the default location, or defaults if there is no file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Save to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(path, perms)?;
        }

        Ok(())
    }

    /// TCP transport for `server_addr`, capped at `session.max_frame_len`.
    pub fn tcp_transport(&self) -> TcpTransport {
        TcpTransport::new(self.server_addr.clone()).with_max_frame_len(self.session.max_frame_len)
    }

    pub fn config_path() -> Result<PathBuf, ConfigError> {
        Ok(get_config_dir()?.join("config.toml"))
    }

    /// The configured key store path, or `~/.sealchat/keys.json`.
    pub fn resolved_key_store_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.key_store_path {
            Some(path) => Ok(path.clone()),
            None => Ok(get_config_dir()?.join("keys.json")),
        }
    }
}

/// Get the sealchat configuration directory (`~/.sealchat`).
pub fn get_config_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|home| home.join(".sealchat"))
        .ok_or(ConfigError::NoConfigDir)
}
