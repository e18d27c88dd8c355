//! Typed configuration from environment variables and an optional TOML file.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! Sensitive values wrapped in secrecy::SecretString to prevent log leaks.

pub mod secrets;

use std::path::Path;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::scheduler::{DEFAULT_DATABASE, DEFAULT_LEASE_EXPIRATION, ReschedulePolicy};

/// Collection used when none is configured.
pub const DEFAULT_COLLECTION: &str = "okra_items";

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub scheduler: SchedulerSettings,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

/// Scheduler construction settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Logical database (a Postgres schema).
    pub database: String,
    /// Collection (table) holding the items.
    pub collection: String,
    pub lease_expiration_secs: u64,
    pub reschedule: ReschedulePolicy,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            database: DEFAULT_DATABASE.to_string(),
            collection: DEFAULT_COLLECTION.to_string(),
            lease_expiration_secs: DEFAULT_LEASE_EXPIRATION.as_secs(),
            reschedule: ReschedulePolicy::default(),
        }
    }
}

/// Top-level TOML wrapper.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    scheduler: SchedulerSettings,
}

impl SchedulerSettings {
    /// Read the `[scheduler]` table of a TOML file. Missing keys keep their
    /// defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let file: FileConfig = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        Ok(file.scheduler)
    }

    /// Override settings with `OKRA_DATABASE`, `OKRA_COLLECTION` and
    /// `OKRA_LEASE_EXPIRATION_SECS` when they are set.
    pub fn apply_env(mut self) -> Result<Self> {
        if let Ok(database) = std::env::var("OKRA_DATABASE") {
            self.database = database;
        }
        if let Ok(collection) = std::env::var("OKRA_COLLECTION") {
            self.collection = collection;
        }
        if let Ok(secs) = std::env::var("OKRA_LEASE_EXPIRATION_SECS") {
            self.lease_expiration_secs = secs.parse().map_err(|e| {
                Error::Config(format!("OKRA_LEASE_EXPIRATION_SECS={secs:?} is not a number: {e}"))
            })?;
        }
        Ok(self)
    }

    pub fn lease_expiration(&self) -> Duration {
        Duration::from_secs(self.lease_expiration_secs)
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::with_settings(SchedulerSettings::default())
    }

    /// Load scheduler settings from a TOML file, then apply the environment
    /// on top of it.
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::with_settings(SchedulerSettings::from_file(path)?)
    }

    fn with_settings(settings: SchedulerSettings) -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            scheduler: settings.apply_env()?,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}
