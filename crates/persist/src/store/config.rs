use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(rename = "type")]
    pub db_type: DatabaseType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sqlite_path: Option<PathBuf>,

    /// Pool size. Derived from dispatcher concurrency when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    Sqlite,
}

impl std::str::FromStr for DatabaseType {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_lowercase().as_str() {
            "sqlite" => Ok(DatabaseType::Sqlite),
            _ => Err(crate::Error::Config(format!("Invalid database type: {}", s))),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            db_type: DatabaseType::Sqlite,
            sqlite_path: Some(PathBuf::from("data/devconsole.db")),
            max_connections: None,
        }
    }
}

impl DatabaseConfig {
    /// In-memory SQLite, used by tests.
    pub fn in_memory() -> Self {
        Self {
            db_type: DatabaseType::Sqlite,
            sqlite_path: Some(PathBuf::from(":memory:")),
            max_connections: Some(1),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self.db_type {
            DatabaseType::Sqlite => {
                if self.sqlite_path.is_none() {
                    return Err("SQLite path is required for SQLite database type".to_string());
                }
            }
        }
        if self.max_connections == Some(0) {
            return Err("Database pool needs at least one connection".to_string());
        }
        Ok(())
    }
}
