//! Configuration management
//!
//! Environment-driven configuration with `DEV_`/`TEST_`/`PROD_` prefix
//! namespacing selected by `ENV_STATE`. A prefixed variable wins over its
//! bare name, so one `.env` can carry several environments side by side.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Default insert batch size for staging and DLQ writers.
pub const DEFAULT_BATCH_SIZE: usize = 10_000;

/// Default maximum database connections in the pool.
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;

/// Default pool acquire timeout in seconds.
pub const DEFAULT_DB_ACQUIRE_TIMEOUT_SECS: u64 = 10;

/// Default per-statement timeout in seconds; expiry is classified transient.
pub const DEFAULT_DB_STATEMENT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnvState {
    #[default]
    Dev,
    Test,
    Prod,
}

impl EnvState {
    fn prefix(&self) -> &'static str {
        match self {
            EnvState::Dev => "DEV_",
            EnvState::Test => "TEST_",
            EnvState::Prod => "PROD_",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EnvState::Dev => "dev",
            EnvState::Test => "test",
            EnvState::Prod => "prod",
        }
    }
}

impl std::str::FromStr for EnvState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "dev" | "development" => Ok(EnvState::Dev),
            "test" => Ok(EnvState::Test),
            "prod" | "production" => Ok(EnvState::Prod),
            other => bail!("Invalid ENV_STATE '{other}', expected dev, test, or prod"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub statement_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PathsConfig {
    /// Directory polled for incoming files.
    pub watch_dir: PathBuf,
    /// Pre-processing copies, kept for recovery and reprocessing.
    pub archive_dir: PathBuf,
    /// Where short-circuited duplicate files are moved.
    pub duplicates_dir: PathBuf,
    /// Declarative source definitions (JSON).
    pub sources_path: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
    pub data_team_address: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub env_state: EnvState,
    pub database: DatabaseConfig,
    pub paths: PathsConfig,
    pub batch_size: usize,
    pub workers: usize,
    pub notify: NotifyConfig,
}

impl Config {
    /// Load configuration from the environment (and `.env` when present).
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let env_state: EnvState = match std::env::var("ENV_STATE") {
            Ok(value) => value.parse()?,
            Err(_) => EnvState::default(),
        };

        let var = |name: &str| -> Option<String> {
            std::env::var(format!("{}{}", env_state.prefix(), name))
                .or_else(|_| std::env::var(name))
                .ok()
        };
        let required = |name: &str| -> Result<String> {
            var(name).with_context(|| {
                format!(
                    "{name} is not set (checked {}{name} and {name})",
                    env_state.prefix()
                )
            })
        };

        let workers = var("WORKERS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(4)
            });

        let config = Config {
            env_state,
            database: DatabaseConfig {
                url: required("DATABASE_URL")?,
                max_connections: var("DB_MAX_CONNECTIONS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS),
                acquire_timeout: Duration::from_secs(
                    var("DB_ACQUIRE_TIMEOUT_SECS")
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(DEFAULT_DB_ACQUIRE_TIMEOUT_SECS),
                ),
                statement_timeout: Duration::from_secs(
                    var("DB_STATEMENT_TIMEOUT_SECS")
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(DEFAULT_DB_STATEMENT_TIMEOUT_SECS),
                ),
            },
            paths: PathsConfig {
                watch_dir: PathBuf::from(required("DIRECTORY_PATH")?),
                archive_dir: PathBuf::from(required("ARCHIVE_PATH")?),
                duplicates_dir: PathBuf::from(required("DUPLICATE_FILES_PATH")?),
                sources_path: PathBuf::from(required("SOURCES_PATH")?),
            },
            batch_size: var("BATCH_SIZE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_BATCH_SIZE),
            workers,
            notify: NotifyConfig {
                webhook_url: var("WEBHOOK_URL"),
                data_team_address: var("DATA_TEAM_EMAIL"),
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            bail!("BATCH_SIZE must be greater than zero");
        }
        if self.workers == 0 {
            bail!("WORKERS must be greater than zero");
        }
        Ok(())
    }
}
