//! Coordinator runtime configuration.
//!
//! Loaded from an optional TOML file; every field has a default so a missing
//! file (or a partial one) yields a working coordinator. Command line flags
//! are applied on top by the binary.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 31013;
const CONFIG_FILE_NAME: &str = "coordinator.toml";
const DB_FILE_NAME: &str = "coordinator.db";
const ADDR_FILE_NAME: &str = "coordinator.addr";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Defaults to `~/.tandem/coordinator`.
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Also write a daily-rotated log file under the data directory.
    pub file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: true,
        }
    }
}

impl CoordinatorConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn data_dir(&self) -> Result<PathBuf, String> {
        match &self.storage.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(tandem_home()?.join("coordinator")),
        }
    }

    pub fn db_path(&self) -> Result<PathBuf, String> {
        Ok(self.data_dir()?.join(DB_FILE_NAME))
    }

    /// File the coordinator writes its bound address into once listening.
    pub fn addr_file_path(&self) -> Result<PathBuf, String> {
        Ok(self.data_dir()?.join(ADDR_FILE_NAME))
    }
}

pub fn default_config_path() -> Result<PathBuf, String> {
    Ok(tandem_home()?.join(CONFIG_FILE_NAME))
}

pub fn load_config(path: Option<PathBuf>) -> Result<CoordinatorConfig, String> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(CoordinatorConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|err| {
        format!(
            "Failed to read coordinator config {}: {}",
            config_path.display(),
            err
        )
    })?;
    toml::from_str::<CoordinatorConfig>(&content).map_err(|err| {
        format!(
            "Failed to parse coordinator config {}: {}",
            config_path.display(),
            err
        )
    })
}

fn tandem_home() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".tandem"))
}
