pub mod backends;
pub mod codec;
pub mod config;
pub mod controllers;
pub mod convert;
pub mod crd;
pub mod metrics;
pub mod migration;
pub mod server;
pub mod store;
pub mod tenant;
pub mod upsert;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes error: {0}")]
    Kubernetes(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Database migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("YAML error: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    #[error("Malformed request key: {0}")]
    MalformedKey(String),
    #[error("Invalid resource version: {0}")]
    VersionParse(String),
    #[error("Conversion error: {0}")]
    Conversion(String),
    #[error("Write conflict: {0}")]
    Conflict(String),
    #[error("Backend not registered: {0}")]
    BackendNotRegistered(String),
    #[error("User not provisioned: {0}")]
    UserNotProvisioned(String),
    #[error("Internal error: {0}")]
    Internal(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Whether retrying the failed operation can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Kubernetes(_)
                | Error::Io(_)
                | Error::Migrate(_)
                | Error::Sqlx(_)
                | Error::Conflict(_)
                | Error::Internal(_)
        )
    }
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        Error::Kubernetes(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
