//! Store configuration: optional TOML file, then environment overrides.
//!
//! The secret is read from the environment only and never from the file.

use crate::error::StoreError;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;
use zeroize::Zeroizing;

/// Environment variable holding the raw secret for key derivation
pub const SECRET_ENV: &str = "SESSION_DB_KEY";

/// Complete store configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthStoreConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
}

/// Where and how the database is opened
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Database file; empty means SQLite's private temporary database
    #[serde(default)]
    pub path: String,
    /// How long a write waits on a locked database before failing
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

fn default_lock_timeout_ms() -> u64 {
    5000
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

impl StorageConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// Purging of abandoned authorization requests
#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    #[serde(default = "default_cleanup_enabled")]
    pub enabled: bool,
    /// Auth requests older than this are deleted
    #[serde(default = "default_auth_request_ttl")]
    pub auth_request_ttl_seconds: u64,
    #[serde(default = "default_cleanup_interval")]
    pub interval_seconds: u64,
}

fn default_cleanup_enabled() -> bool {
    true
}

fn default_auth_request_ttl() -> u64 {
    600
}

fn default_cleanup_interval() -> u64 {
    300
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: default_cleanup_enabled(),
            auth_request_ttl_seconds: default_auth_request_ttl(),
            interval_seconds: default_cleanup_interval(),
        }
    }
}

impl CleanupConfig {
    pub fn auth_request_ttl(&self) -> Duration {
        Duration::from_secs(self.auth_request_ttl_seconds)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds.max(1))
    }
}

impl AuthStoreConfig {
    /// Applies overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Applies overrides from `lookup`. Unparseable values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SESSION_DB_PATH") {
            if !v.is_empty() {
                self.storage.path = v;
            }
        }
        if let Some(v) = lookup("SESSION_DB_LOCK_TIMEOUT_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                self.storage.lock_timeout_ms = ms;
            }
        }
        if let Some(v) = lookup("AUTH_REQUEST_TTL_SECONDS") {
            if let Ok(secs) = v.parse::<u64>() {
                self.cleanup.auth_request_ttl_seconds = secs;
            }
        }
        if let Some(v) = lookup("AUTH_REQUEST_CLEANUP_INTERVAL_SECONDS") {
            if let Ok(secs) = v.parse::<u64>() {
                self.cleanup.interval_seconds = secs;
            }
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<AuthStoreConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path))?;
    let config: AuthStoreConfig =
        toml::from_str(&contents).with_context(|| format!("Failed to parse config file {}", path))?;
    Ok(config)
}

/// Reads the raw secret; a missing or empty value is a key derivation error.
pub fn secret_from<F>(lookup: F) -> Result<Zeroizing<String>, StoreError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(SECRET_ENV) {
        Some(secret) if !secret.is_empty() => Ok(Zeroizing::new(secret)),
        _ => Err(StoreError::KeyDerivation(format!(
            "{} environment variable not set",
            SECRET_ENV
        ))),
    }
}

pub fn secret_from_env() -> Result<Zeroizing<String>, StoreError> {
    secret_from(|name| std::env::var(name).ok())
}
