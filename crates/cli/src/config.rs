use std::{fs, path::Path};

use roost_stream::{StaticAuthenticator, types::ServerOptions};
use roost_types::{User, UserId};
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Duplicate token for user {0}")]
    DuplicateToken(UserId),
}

/// A user allowed to connect, and the token they authenticate with.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserEntry {
    pub id: UserId,
    pub display_name: String,
    pub token: String,
}

/// Contents of `roost.toml`.
///
/// ```toml
/// [server]
/// port = 8080
/// cursor_secret = "change me"
///
/// [[users]]
/// id = 1
/// display_name = "alice"
/// token = "alice-token"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerOptions,
    pub users: Vec<UserEntry>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Build the token table. Two users may not share a token.
    pub fn authenticator(&self) -> Result<StaticAuthenticator, ConfigError> {
        let mut auth = StaticAuthenticator::new();
        for entry in &self.users {
            if self.users.iter().filter(|u| u.token == entry.token).count() > 1 {
                return Err(ConfigError::DuplicateToken(entry.id));
            }
            auth.insert(
                entry.token.clone(),
                User {
                    id: entry.id,
                    display_name: entry.display_name.clone(),
                },
            );
        }
        Ok(auth)
    }
}
