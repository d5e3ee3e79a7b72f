//! Configuration and credentials management

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.toml";
const CREDENTIALS_FILE: &str = "credentials.toml";

/// User-level CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Control plane API base URL
    pub api_url: String,
    /// Local hostname forwarded to when none is given
    pub default_local_host: String,
    /// Re-dial the relay automatically after a connection loss
    pub auto_reconnect: bool,
    /// Log each forwarded HTTP request
    pub inspect: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: crate::api::DEFAULT_API_URL.to_string(),
            default_local_host: "127.0.0.1".to_string(),
            auto_reconnect: true,
            inspect: false,
        }
    }
}

impl Config {
    /// Load configuration from file. Returns defaults if the file does
    /// not exist.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(crate::Error::Config(format!("reading config: {e}"))),
        };

        let mut config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("parsing config: {e}")))?;

        // Re-apply defaults for fields left empty in the file.
        if config.api_url.is_empty() {
            config.api_url = crate::api::DEFAULT_API_URL.to_string();
        }
        if config.default_local_host.is_empty() {
            config.default_local_host = "127.0.0.1".to_string();
        }
        Ok(config)
    }

    /// Save configuration to file, creating the parent directory.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("serializing config: {e}")))?;
        write_private(path.as_ref(), content.as_bytes(), false)
    }
}

/// Stored authentication data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub api_key: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub api_url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub email: String,
}

impl Credentials {
    /// Load credentials from the default location. Returns `None` when no
    /// credentials file exists.
    pub fn load() -> Result<Option<Self>, crate::Error> {
        let path = credentials_path()?;
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(crate::Error::Config(format!("reading credentials: {e}"))),
        };
        let creds = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("parsing credentials: {e}")))?;
        Ok(Some(creds))
    }

    /// Save credentials to the default location with owner-only
    /// permissions.
    pub fn save(&self) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("serializing credentials: {e}")))?;
        write_private(&credentials_path()?, content.as_bytes(), true)
    }

    /// Delete the credentials file if present.
    pub fn remove() -> Result<(), crate::Error> {
        match std::fs::remove_file(credentials_path()?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(crate::Error::Config(format!("removing credentials: {e}"))),
        }
    }
}

/// Default config file path (`<user config dir>/skyhook/config.toml`).
pub fn config_path(override_path: &str) -> Result<PathBuf, crate::Error> {
    if !override_path.is_empty() {
        return Ok(PathBuf::from(override_path));
    }
    Ok(app_dir()?.join(CONFIG_FILE))
}

fn credentials_path() -> Result<PathBuf, crate::Error> {
    Ok(app_dir()?.join(CREDENTIALS_FILE))
}

fn app_dir() -> Result<PathBuf, crate::Error> {
    let dirs = directories::ProjectDirs::from("dev", "skyhook", "skyhook")
        .ok_or_else(|| crate::Error::Config("determining config directory".to_string()))?;
    Ok(dirs.config_dir().to_path_buf())
}

fn write_private(path: &Path, content: &[u8], owner_only: bool) -> Result<(), crate::Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| crate::Error::Config(format!("creating config directory: {e}")))?;
    }
    std::fs::write(path, content)
        .map_err(|e| crate::Error::Config(format!("writing {}: {e}", path.display())))?;

    #[cfg(unix)]
    if owner_only {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| crate::Error::Config(format!("setting permissions: {e}")))?;
    }
    #[cfg(not(unix))]
    let _ = owner_only;

    Ok(())
}
