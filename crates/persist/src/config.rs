use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::store::{DatabaseConfig, DatabaseType};

/// Pods are watched with at least this many workers.
pub const MIN_POD_WORKERS: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub backends: BackendConfig,
    pub controller: ControllerConfig,
    pub tenant: TenantConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub addr: String,
}

/// Backend names looked up in the registry. An empty object storage name
/// turns persistence off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub object_storage: String,
    pub event_storage: String,
    pub action: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub region: String,
    pub max_concurrent_reconciles: usize,
    pub requeue_base_seconds: u64,
    pub requeue_max_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantConfig {
    pub kubeconfig_dir: PathBuf,
}

impl ControllerConfig {
    pub fn pod_workers(&self) -> usize {
        self.max_concurrent_reconciles.max(MIN_POD_WORKERS)
    }

    /// Total workers across every dispatcher, used to size the database pool.
    pub fn total_workers(&self, job_kinds: usize) -> usize {
        // jobs, cron, notebook, evaluate and pods
        self.max_concurrent_reconciles * (job_kinds + 3) + self.pod_workers()
    }

    pub fn requeue_base(&self) -> Duration {
        Duration::from_secs(self.requeue_base_seconds)
    }

    pub fn requeue_max(&self) -> Duration {
        Duration::from_secs(self.requeue_max_seconds)
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> crate::Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| crate::Error::Config(format!("Invalid value for {}: {}", key, raw))),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn load() -> crate::Result<Self> {
        // Load environment variables from .env file if it exists
        let _ = dotenvy::dotenv();

        let defaults = Config::default();
        let config = Config {
            server: ServerConfig {
                addr: env_or("SERVER_ADDR", &defaults.server.addr),
            },
            database: DatabaseConfig {
                db_type: DatabaseType::from_str(&env_or("DATABASE_TYPE", "sqlite"))?,
                sqlite_path: std::env::var("SQLITE_PATH")
                    .map(PathBuf::from)
                    .ok()
                    .or(defaults.database.sqlite_path),
                max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .map(|s| {
                        s.trim().parse().map_err(|_| {
                            crate::Error::Config(format!(
                                "Invalid value for DATABASE_MAX_CONNECTIONS: {}",
                                s
                            ))
                        })
                    })
                    .transpose()?,
            },
            backends: BackendConfig {
                object_storage: env_or("OBJECT_STORAGE", &defaults.backends.object_storage),
                event_storage: env_or("EVENT_STORAGE", &defaults.backends.event_storage),
                action: env_or("ACTION_BACKEND", &defaults.backends.action),
            },
            controller: ControllerConfig {
                region: env_or("REGION", ""),
                max_concurrent_reconciles: env_parse("MAX_CONCURRENT_RECONCILES", 1)?,
                requeue_base_seconds: env_parse("REQUEUE_BASE_SECONDS", 5)?,
                requeue_max_seconds: env_parse("REQUEUE_MAX_SECONDS", 300)?,
            },
            tenant: TenantConfig {
                kubeconfig_dir: std::env::var("KUBECONFIG_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.tenant.kubeconfig_dir),
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        self.database.validate().map_err(crate::Error::Config)?;

        if self.controller.max_concurrent_reconciles == 0 {
            return Err(crate::Error::Config(
                "MAX_CONCURRENT_RECONCILES must be at least 1".to_string(),
            ));
        }
        if self.controller.requeue_base_seconds == 0 {
            return Err(crate::Error::Config(
                "REQUEUE_BASE_SECONDS must be at least 1".to_string(),
            ));
        }
        if self.controller.requeue_base_seconds > self.controller.requeue_max_seconds {
            return Err(crate::Error::Config(
                "REQUEUE_BASE_SECONDS must not exceed REQUEUE_MAX_SECONDS".to_string(),
            ));
        }
        if self.backends.object_storage.is_empty() {
            tracing::warn!("OBJECT_STORAGE is empty, persistence is disabled");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                addr: "0.0.0.0:8080".to_string(),
            },
            database: DatabaseConfig::default(),
            backends: BackendConfig {
                object_storage: "sqlite".to_string(),
                event_storage: "apiserver".to_string(),
                action: "apiserver".to_string(),
            },
            controller: ControllerConfig {
                region: String::new(),
                max_concurrent_reconciles: 1,
                requeue_base_seconds: 5,
                requeue_max_seconds: 300,
            },
            tenant: TenantConfig {
                kubeconfig_dir: PathBuf::from("/var/kube"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.controller.pod_workers(), MIN_POD_WORKERS);
        assert_eq!(config.backends.object_storage, "sqlite");
    }

    #[test]
    fn test_pod_workers_follow_larger_setting() {
        let mut config = Config::default();
        config.controller.max_concurrent_reconciles = 16;
        assert_eq!(config.controller.pod_workers(), 16);
        assert_eq!(config.controller.total_workers(5), 16 * 8 + 16);
    }

    #[test]
    fn test_invalid_backoff_rejected() {
        let mut config = Config::default();
        config.controller.requeue_base_seconds = 600;
        assert!(matches!(config.validate(), Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_zero_requeue_base_rejected() {
        let mut config = Config::default();
        config.controller.requeue_base_seconds = 0;
        assert!(matches!(config.validate(), Err(crate::Error::Config(_))));

        config.controller.requeue_base_seconds = 1;
        config.validate().unwrap();
    }
}
