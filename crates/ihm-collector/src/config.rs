//! Collector configuration
//!
//! Read from the environment (and `.env`), with defaults for every setting.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigurationError;
use crate::ingest::ftp::Credentials;
use crate::ingest::orchestrator::OrchestratorSettings;
use crate::ingest::storage::RetryPolicy;

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_IHM_HOST: &str = "127.0.0.1";
pub const DEFAULT_IHM_PORT: u16 = 21;
pub const DEFAULT_IHM_USER: &str = "anonymous";
pub const DEFAULT_REMOTE_DIR: &str = "/InternalStorage/data/";
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_WORK_DIR: &str = "tmp";
pub const DEFAULT_MIN_GAP_SECS: u64 = 0;

pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/ihm";
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

pub const DEFAULT_PERSIST_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_PERSIST_BACKOFF_MS: u64 = 1000;

pub const DEFAULT_BACKUP_DIR: &str = "backups";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    pub controller: ControllerConfig,
    pub polling: PollingConfig,
    pub database: DatabaseConfig,
    pub persistence: PersistenceConfig,
    pub backup: BackupConfig,
}

/// FTP endpoint of the controller
#[derive(Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub remote_dir: String,
    pub connect_timeout_secs: u64,
    /// Comma-separated exclusion regexes
    pub exclude_patterns: Option<String>,
}

impl std::fmt::Debug for ControllerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("remote_dir", &self.remote_dir)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("exclude_patterns", &self.exclude_patterns)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    pub interval_ms: u64,
    pub work_dir: PathBuf,
    pub max_candidates: Option<usize>,
    pub min_gap_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    pub dir: PathBuf,
    pub enabled: bool,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl CollectorConfig {
    /// Load `.env`, read the environment and validate
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_env();
        config.validate()?;

        Ok(config)
    }

    /// Read the environment without validating
    pub fn from_env() -> Self {
        Self {
            controller: ControllerConfig {
                host: env_string("IHM_HOST", DEFAULT_IHM_HOST),
                port: env_or("IHM_PORT", DEFAULT_IHM_PORT),
                username: env_string("IHM_USER", DEFAULT_IHM_USER),
                password: env_string("IHM_PASS", ""),
                remote_dir: env_string("IHM_REMOTE_DIR", DEFAULT_REMOTE_DIR),
                connect_timeout_secs: env_or(
                    "IHM_CONNECT_TIMEOUT_SECS",
                    DEFAULT_CONNECT_TIMEOUT_SECS,
                ),
                exclude_patterns: std::env::var("IHM_EXCLUDE_REGEX")
                    .ok()
                    .filter(|s| !s.trim().is_empty()),
            },
            polling: PollingConfig {
                interval_ms: env_or("POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS),
                work_dir: PathBuf::from(env_string("COLLECTOR_TMP", DEFAULT_WORK_DIR)),
                max_candidates: std::env::var("COLLECTOR_MAX_CANDIDATES")
                    .ok()
                    .and_then(|s| s.trim().parse().ok()),
                min_gap_secs: env_or("COLLECTOR_MIN_GAP_SECS", DEFAULT_MIN_GAP_SECS),
            },
            database: DatabaseConfig {
                url: env_string("DATABASE_URL", DEFAULT_DATABASE_URL),
                max_connections: env_or(
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                ),
                connect_timeout_secs: env_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
            },
            persistence: PersistenceConfig {
                max_attempts: env_or("PERSIST_MAX_ATTEMPTS", DEFAULT_PERSIST_MAX_ATTEMPTS),
                backoff_ms: env_or("PERSIST_BACKOFF_MS", DEFAULT_PERSIST_BACKOFF_MS),
            },
            backup: BackupConfig {
                dir: PathBuf::from(env_string("BACKUP_DIR", DEFAULT_BACKUP_DIR)),
                enabled: env_or("BACKUP_ENABLED", true),
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.controller.host.trim().is_empty() {
            return Err(ConfigurationError::Invalid {
                key: "IHM_HOST",
                reason: "controller host cannot be empty".into(),
            });
        }

        if self.controller.port == 0 {
            return Err(ConfigurationError::Invalid {
                key: "IHM_PORT",
                reason: "port must be greater than 0".into(),
            });
        }

        if self.polling.interval_ms == 0 {
            return Err(ConfigurationError::Invalid {
                key: "POLL_INTERVAL_MS",
                reason: "poll interval must be greater than 0".into(),
            });
        }

        if self.polling.max_candidates == Some(0) {
            return Err(ConfigurationError::Invalid {
                key: "COLLECTOR_MAX_CANDIDATES",
                reason: "must be unset or greater than 0".into(),
            });
        }

        if self.database.url.is_empty() {
            return Err(ConfigurationError::Invalid {
                key: "DATABASE_URL",
                reason: "database URL cannot be empty".into(),
            });
        }

        if self.database.max_connections == 0 {
            return Err(ConfigurationError::Invalid {
                key: "DATABASE_MAX_CONNECTIONS",
                reason: "must be greater than 0".into(),
            });
        }

        if self.persistence.max_attempts == 0 {
            return Err(ConfigurationError::Invalid {
                key: "PERSIST_MAX_ATTEMPTS",
                reason: "at least one attempt is required".into(),
            });
        }

        Ok(())
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            host: self.controller.host.clone(),
            port: self.controller.port,
            username: self.controller.username.clone(),
            password: self.controller.password.clone(),
            connect_timeout: Duration::from_secs(self.controller.connect_timeout_secs),
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            remote_dir: self.controller.remote_dir.clone(),
            work_dir: self.polling.work_dir.clone(),
            poll_interval: Duration::from_millis(self.polling.interval_ms),
            max_candidates_per_cycle: self.polling.max_candidates,
            min_candidate_gap: Duration::from_secs(self.polling.min_gap_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.persistence.max_attempts,
            backoff_unit: Duration::from_millis(self.persistence.backoff_ms),
        }
    }

    /// JSON lines file written by the process log hook
    pub fn process_log_path(&self) -> PathBuf {
        self.polling.work_dir.join("process_logs.jsonl")
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            controller: ControllerConfig {
                host: DEFAULT_IHM_HOST.to_string(),
                port: DEFAULT_IHM_PORT,
                username: DEFAULT_IHM_USER.to_string(),
                password: String::new(),
                remote_dir: DEFAULT_REMOTE_DIR.to_string(),
                connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
                exclude_patterns: None,
            },
            polling: PollingConfig {
                interval_ms: DEFAULT_POLL_INTERVAL_MS,
                work_dir: PathBuf::from(DEFAULT_WORK_DIR),
                max_candidates: None,
                min_gap_secs: DEFAULT_MIN_GAP_SECS,
            },
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            },
            persistence: PersistenceConfig {
                max_attempts: DEFAULT_PERSIST_MAX_ATTEMPTS,
                backoff_ms: DEFAULT_PERSIST_BACKOFF_MS,
            },
            backup: BackupConfig {
                dir: PathBuf::from(DEFAULT_BACKUP_DIR),
                enabled: true,
            },
        }
    }
}
