//! Client configuration: who the local user is and which coordinators to
//! offer.
//!
//! ```toml
//! [user]
//! name = "alice"
//! color = 0x00ff00
//!
//! [[servers]]
//! host = "127.0.0.1"
//! port = 31013
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tandem_protocol::User;

use crate::error::{Result, SessionError};

const CONFIG_FILE_NAME: &str = "client.toml";
pub const DEFAULT_USER_NAME: &str = "unnamed";
pub const DEFAULT_COLOR: u32 = 0x808080;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    pub user: UserConfig,
    pub servers: Vec<ServerEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UserConfig {
    pub name: String,
    /// 0xBBGGRR
    pub color: u32,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_USER_NAME.to_string(),
            color: DEFAULT_COLOR,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerEntry {
    pub host: String,
    pub port: u16,
}

impl ServerEntry {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl ClientConfig {
    pub fn user(&self) -> User {
        User {
            name: self.user.name.clone(),
            color: self.user.color,
        }
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or(SessionError::NoHomeDir)?;
    Ok(home.join(".tandem").join(CONFIG_FILE_NAME))
}

/// Missing file yields defaults; a malformed one is an error.
pub fn load_config(path: &Path) -> Result<ClientConfig> {
    if !path.exists() {
        return Ok(ClientConfig::default());
    }
    let content = fs_err::read_to_string(path).map_err(|source| SessionError::Io {
        context: format!("read client config {}", path.display()),
        source,
    })?;
    toml::from_str(&content).map_err(|err| SessionError::ConfigMalformed {
        path: path.to_path_buf(),
        details: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = load_config(&temp_dir.path().join("client.toml")).unwrap();
        assert_eq!(config.user.name, DEFAULT_USER_NAME);
        assert!(config.servers.is_empty());
    }

    #[test]
    fn parses_user_and_servers() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("client.toml");
        fs_err::write(
            &path,
            r#"
[user]
name = "alice"
color = 255

[[servers]]
host = "10.0.0.5"
port = 31013

[[servers]]
host = "localhost"
port = 4000
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(
            config.user(),
            User {
                name: "alice".to_string(),
                color: 255
            }
        );
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[1].addr(), "localhost:4000");
    }

    #[test]
    fn malformed_file_is_reported() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("client.toml");
        fs_err::write(&path, "[user\nname =").unwrap();
        assert!(matches!(
            load_config(&path),
            Err(SessionError::ConfigMalformed { .. })
        ));
    }
}
