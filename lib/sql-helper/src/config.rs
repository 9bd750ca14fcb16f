//! Connection configuration.

use crate::SqlHelperError;

/// Environment variable conventionally holding the default connection string.
pub const DEFAULT_DATA_SOURCE_ENV: &str = "DATABASE_URL";

/// Connection configuration for a data source.
///
/// The connection string doubles as the data source identity used to key
/// cached parameter templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionConfig {
    /// Connect using a database URL string.
    Url(String),
}

impl ConnectionConfig {
    /// Read the connection string from an environment variable.
    pub fn from_env(var: &str) -> Result<Self, SqlHelperError> {
        match std::env::var(var) {
            Ok(url) if !url.trim().is_empty() => Ok(ConnectionConfig::Url(url)),
            Ok(_) => Err(SqlHelperError::Connection(format!(
                "environment variable {} is empty",
                var
            ))),
            Err(e) => Err(SqlHelperError::Connection(format!("{}: {}", var, e))),
        }
    }

    /// Read the connection string from `DATABASE_URL`.
    pub fn from_default_env() -> Result<Self, SqlHelperError> {
        Self::from_env(DEFAULT_DATA_SOURCE_ENV)
    }

    pub fn data_source(&self) -> &str {
        match self {
            ConnectionConfig::Url(url) => url,
        }
    }
}

impl From<&str> for ConnectionConfig {
    fn from(url: &str) -> Self {
        ConnectionConfig::Url(url.to_string())
    }
}

impl From<String> for ConnectionConfig {
    fn from(url: String) -> Self {
        ConnectionConfig::Url(url)
    }
}

impl From<&String> for ConnectionConfig {
    fn from(url: &String) -> Self {
        ConnectionConfig::Url(url.clone())
    }
}
