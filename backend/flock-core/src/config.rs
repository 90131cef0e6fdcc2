// src/config.rs
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

use crate::department::DepartmentAliases;

pub const ENV_PREFIX: &str = "FLOCK_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Environment configuration error: {0}")]
    Env(#[from] envy::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from("flock_snapshot.json")
}

fn default_sync_interval_secs() -> u64 {
    5 * 60
}

/// Server configuration, read from `FLOCK_*` environment variables
/// (`FLOCK_PORT`, `FLOCK_BACKEND_URL`, ...).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,
    #[serde(default)]
    pub backend_url: Option<String>,
    #[serde(default)]
    pub backend_api_key: Option<String>,
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    /// Extra `legacy=display` department aliases, `;`-separated.
    #[serde(default)]
    pub department_aliases: String,
}

fn non_empty(value: &Option<PathBuf>) -> Option<&Path> {
    value.as_deref().filter(|p| !p.as_os_str().is_empty())
}

impl Config {
    /// Loads `.env` if present, then the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenv::dotenv() {
            info!("Loaded environment from {:?}", path);
        }
        Self::from_iter(std::env::vars())
    }

    pub fn from_iter<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config: Config = envy::prefixed(ENV_PREFIX).from_iter(vars)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if non_empty(&self.cert_path).is_some() != non_empty(&self.key_path).is_some() {
            return Err(ConfigError::Invalid(
                "FLOCK_CERT_PATH and FLOCK_KEY_PATH must be set together".to_string(),
            ));
        }
        let has_url = self.backend_url.as_deref().is_some_and(|u| !u.trim().is_empty());
        let has_key = self.backend_api_key.as_deref().is_some_and(|k| !k.trim().is_empty());
        if has_url != has_key {
            return Err(ConfigError::Invalid(
                "FLOCK_BACKEND_URL and FLOCK_BACKEND_API_KEY must be set together".to_string(),
            ));
        }
        if self.sync_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "FLOCK_SYNC_INTERVAL_SECS must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn tls_paths(&self) -> Option<(&Path, &Path)> {
        non_empty(&self.cert_path).zip(non_empty(&self.key_path))
    }

    /// Backend URL and API key, when both are configured.
    pub fn backend(&self) -> Option<(&str, &str)> {
        let url = self.backend_url.as_deref().map(str::trim).filter(|u| !u.is_empty());
        let key = self.backend_api_key.as_deref().map(str::trim).filter(|k| !k.is_empty());
        url.zip(key)
    }

    pub fn aliases(&self) -> DepartmentAliases {
        DepartmentAliases::with_extra(&self.department_aliases)
    }
}
