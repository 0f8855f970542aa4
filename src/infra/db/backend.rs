use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

/// Relational backend behind a [`super::DbHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbBackend {
    Sqlite,
    #[serde(alias = "mariadb")]
    MySql,
    #[serde(alias = "postgresql")]
    Postgres,
}

impl DbBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            DbBackend::Sqlite => "sqlite",
            DbBackend::MySql => "mysql",
            DbBackend::Postgres => "postgres",
        }
    }

    /// Backend named by a connection URL's scheme.
    pub fn detect(url: &str) -> Option<Self> {
        // Tolerate leading whitespace from env files.
        let url = url.trim_start();
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Some(DbBackend::Postgres)
        } else if url.starts_with("mysql://") || url.starts_with("mariadb://") {
            Some(DbBackend::MySql)
        } else if url.starts_with("sqlite:") {
            Some(DbBackend::Sqlite)
        } else {
            None
        }
    }
}

impl fmt::Display for DbBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown database backend `{0}` (expected sqlite, mysql or postgres)")]
pub struct UnknownBackend(String);

impl FromStr for DbBackend {
    type Err = UnknownBackend;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(DbBackend::Sqlite),
            "mysql" | "mariadb" => Ok(DbBackend::MySql),
            "postgres" | "postgresql" => Ok(DbBackend::Postgres),
            other => Err(UnknownBackend(other.to_string())),
        }
    }
}
