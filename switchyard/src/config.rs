//! Application configuration loaded from the environment.

use std::path::PathBuf;
use std::str::FromStr;

use device_fanout::FanoutConfig;
use serde::{Deserialize, Serialize};

use crate::database::{DatabaseConfig, default_pool_size};
use crate::scheduler::SchedulerConfig;
use crate::{Error, Result};

pub const DEFAULT_DATABASE_URL: &str = "sqlite:switchyard.db?mode=rwc";
pub const DEFAULT_FIRMWARE_URL: &str = "http://firmware.local/firmware";

/// Runtime configuration for the switchyard binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub db_pool_size: u32,
    pub max_concurrent_jobs: usize,
    pub fanout_parallelism: usize,
    pub device_timeout_secs: u64,
    pub log_dir: Option<PathBuf>,
    pub firmware_url: String,
    /// JSON file with the device inventory served by the binary.
    pub inventory_file: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            db_pool_size: default_pool_size(),
            max_concurrent_jobs: SchedulerConfig::default().max_concurrent_jobs,
            fanout_parallelism: FanoutConfig::default().parallelism,
            device_timeout_secs: FanoutConfig::default().device_timeout_secs,
            log_dir: None,
            firmware_url: DEFAULT_FIRMWARE_URL.to_string(),
            inventory_file: None,
        }
    }
}

impl AppConfig {
    /// Load from the process environment, after reading `.env` if present.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` to resolve variable names.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let value = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let config = Self {
            database_url: value("DATABASE_URL").unwrap_or(defaults.database_url),
            db_pool_size: parse_or(
                "SWITCHYARD_DB_POOL_SIZE",
                value("SWITCHYARD_DB_POOL_SIZE"),
                defaults.db_pool_size,
            )?,
            max_concurrent_jobs: parse_or(
                "SWITCHYARD_MAX_JOBS",
                value("SWITCHYARD_MAX_JOBS"),
                defaults.max_concurrent_jobs,
            )?,
            fanout_parallelism: parse_or(
                "SWITCHYARD_FANOUT_PARALLELISM",
                value("SWITCHYARD_FANOUT_PARALLELISM"),
                defaults.fanout_parallelism,
            )?,
            device_timeout_secs: parse_or(
                "SWITCHYARD_DEVICE_TIMEOUT_SECS",
                value("SWITCHYARD_DEVICE_TIMEOUT_SECS"),
                defaults.device_timeout_secs,
            )?,
            log_dir: value("SWITCHYARD_LOG_DIR").map(PathBuf::from),
            firmware_url: value("SWITCHYARD_FIRMWARE_URL").unwrap_or(defaults.firmware_url),
            inventory_file: value("SWITCHYARD_INVENTORY_FILE").map(PathBuf::from),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.db_pool_size == 0 {
            return Err(Error::config("SWITCHYARD_DB_POOL_SIZE must be at least 1"));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(Error::config("SWITCHYARD_MAX_JOBS must be at least 1"));
        }
        if self.fanout_parallelism == 0 {
            return Err(Error::config("SWITCHYARD_FANOUT_PARALLELISM must be at least 1"));
        }
        if self.device_timeout_secs == 0 {
            return Err(Error::config("SWITCHYARD_DEVICE_TIMEOUT_SECS must be at least 1"));
        }
        Ok(())
    }

    pub fn database(&self) -> DatabaseConfig {
        DatabaseConfig::new(&self.database_url).with_max_connections(self.db_pool_size)
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent_jobs: self.max_concurrent_jobs,
        }
    }

    pub fn fanout(&self) -> FanoutConfig {
        FanoutConfig {
            parallelism: self.fanout_parallelism,
            device_timeout_secs: self.device_timeout_secs,
        }
    }
}

fn parse_or<T: FromStr>(key: &str, raw: Option<String>, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::config(format!("invalid {key} '{raw}': {e}"))),
    }
}
