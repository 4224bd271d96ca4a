//! Configuration for the storage layer
//!
//! Connection settings come from an optional TOML file layered under the
//! process environment. The well-known deployment variables are read by name:
//! - `DATABASE_URL`, `DATABASE_AUTH_TOKEN` for the structured store
//! - `SUPABASE_URL`, `SUPABASE_SERVICE_KEY` for the REST store
//! - `REST_UPSERT_MODE` (`read_then_write` or `merge_duplicates`)
//!
//! Tunables can also be overridden with `TABSYNC_` prefixed variables using
//! `__` as the nesting separator, e.g. `TABSYNC_POOL__MAX_OPEN=8`.

use crate::error::{Result, StoreError};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::env;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Env markers set by serverless platforms
pub const EPHEMERAL_ENV_MARKERS: [&str; 3] = ["VERCEL_ENV", "VERCEL_URL", "AWS_LAMBDA_FUNCTION_NAME"];

/// How the REST store emulates upserts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertMode {
    /// Filtered PATCH, then POST when nothing matched. Not atomic.
    #[default]
    ReadThenWrite,
    /// Single POST with `on_conflict` and `resolution=merge-duplicates`
    MergeDuplicates,
}

impl UpsertMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpsertMode::ReadThenWrite => "read_then_write",
            UpsertMode::MergeDuplicates => "merge_duplicates",
        }
    }
}

impl std::str::FromStr for UpsertMode {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "read_then_write" => Ok(UpsertMode::ReadThenWrite),
            "merge_duplicates" => Ok(UpsertMode::MergeDuplicates),
            other => Err(StoreError::Configuration(format!(
                "unknown upsert mode '{}'",
                other
            ))),
        }
    }
}

/// Kind of compute the process is running on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeploymentMode {
    /// Long-running server: one cached backend
    LongLived,
    /// Serverless function: per-config cache with idle eviction
    Ephemeral,
}

impl DeploymentMode {
    /// Detect from the process environment
    pub fn detect() -> Self {
        Self::detect_with(|key| env::var(key).ok())
    }

    /// Detect using a custom variable lookup
    pub fn detect_with<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let ephemeral = EPHEMERAL_ENV_MARKERS
            .iter()
            .any(|key| lookup(key).map(|v| !v.trim().is_empty()).unwrap_or(false));
        if ephemeral {
            DeploymentMode::Ephemeral
        } else {
            DeploymentMode::LongLived
        }
    }

    pub fn is_ephemeral(&self) -> bool {
        matches!(self, DeploymentMode::Ephemeral)
    }
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeploymentMode::LongLived => write!(f, "long-lived"),
            DeploymentMode::Ephemeral => write!(f, "ephemeral"),
        }
    }
}

/// Structured-store connection pool tunables
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_open: usize,
    pub max_idle: usize,
    pub max_lifetime_secs: u64,
    pub wait_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_open: 5,
            max_idle: 2,
            max_lifetime_secs: 300,
            wait_timeout_secs: 5,
            connect_timeout_secs: 10,
        }
    }
}

impl PoolSettings {
    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Cached-instance lifecycle tunables
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSettings {
    /// Long-lived cache recreates its instance after this much idle time
    pub recreate_after_idle_secs: u64,
    /// `cleanup_idle` drops the long-lived instance after this much idle time
    pub cleanup_idle_secs: u64,
    /// Ephemeral entries older than this are stale
    pub ephemeral_idle_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            recreate_after_idle_secs: 30 * 60,
            cleanup_idle_secs: 10 * 60,
            ephemeral_idle_secs: 10 * 60,
            sweep_interval_secs: 5 * 60,
        }
    }
}

impl LifecycleSettings {
    pub fn recreate_after_idle(&self) -> Duration {
        Duration::from_secs(self.recreate_after_idle_secs)
    }

    pub fn cleanup_idle(&self) -> Duration {
        Duration::from_secs(self.cleanup_idle_secs)
    }

    pub fn ephemeral_idle(&self) -> Duration {
        Duration::from_secs(self.ephemeral_idle_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Connection configuration for every backend
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub database_url: Option<String>,
    pub database_auth_token: Option<String>,
    pub rest_url: Option<String>,
    pub rest_key: Option<String>,
    pub upsert_mode: UpsertMode,
    pub rest_timeout_secs: u64,
    pub pool: PoolSettings,
    pub lifecycle: LifecycleSettings,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            database_auth_token: None,
            rest_url: None,
            rest_key: None,
            upsert_mode: UpsertMode::default(),
            rest_timeout_secs: 30,
            pool: PoolSettings::default(),
            lifecycle: LifecycleSettings::default(),
        }
    }
}

// Secrets stay out of logs and panics
impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("database_url", &self.database_url.as_deref().map(redact_dsn))
            .field("database_auth_token", &self.database_auth_token.as_ref().map(|_| "***"))
            .field("rest_url", &self.rest_url)
            .field("rest_key", &self.rest_key.as_ref().map(|_| "***"))
            .field("upsert_mode", &self.upsert_mode)
            .field("rest_timeout_secs", &self.rest_timeout_secs)
            .field("pool", &self.pool)
            .field("lifecycle", &self.lifecycle)
            .finish()
    }
}

/// Strip the query string (which may carry `authToken`) from a DSN
pub fn redact_dsn(dsn: &str) -> String {
    match dsn.split_once('?') {
        Some((base, _)) => format!("{}?***", base),
        None => dsn.to_string(),
    }
}

impl StoreConfig {
    /// Structured store only
    pub fn sql(database_url: impl Into<String>) -> Self {
        Self {
            database_url: Some(database_url.into()),
            ..Default::default()
        }
    }

    /// REST store only
    pub fn rest(rest_url: impl Into<String>, rest_key: impl Into<String>) -> Self {
        Self {
            rest_url: Some(rest_url.into()),
            rest_key: Some(rest_key.into()),
            ..Default::default()
        }
    }

    /// Load from an optional TOML file plus the process environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            debug!("Loading store configuration from {}", path.display());
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("TABSYNC")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        for (var, key) in [
            ("DATABASE_URL", "database_url"),
            ("DATABASE_AUTH_TOKEN", "database_auth_token"),
            ("SUPABASE_URL", "rest_url"),
            ("SUPABASE_SERVICE_KEY", "rest_key"),
            ("REST_UPSERT_MODE", "upsert_mode"),
        ] {
            if let Ok(value) = env::var(var) {
                let value = value.trim();
                if value.is_empty() {
                    continue;
                }
                let value = if key == "upsert_mode" {
                    value.to_lowercase()
                } else {
                    value.to_string()
                };
                builder = builder.set_override(key, value)?;
            }
        }

        let config: StoreConfig = builder.build()?.try_deserialize()?;
        Ok(config.normalized())
    }

    /// Trim whitespace and turn empty strings into `None`
    pub fn normalized(mut self) -> Self {
        fn clean(value: Option<String>) -> Option<String> {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        }
        self.database_url = clean(self.database_url);
        self.database_auth_token = clean(self.database_auth_token);
        self.rest_url = clean(self.rest_url);
        self.rest_key = clean(self.rest_key);
        self
    }

    pub fn has_sql(&self) -> bool {
        self.database_url
            .as_deref()
            .map(|v| !v.trim().is_empty())
            .unwrap_or(false)
    }

    /// The REST store needs both a base URL and a service key
    pub fn has_rest(&self) -> bool {
        let set = |v: &Option<String>| v.as_deref().map(|s| !s.trim().is_empty()).unwrap_or(false);
        set(&self.rest_url) && set(&self.rest_key)
    }

    pub fn rest_timeout(&self) -> Duration {
        Duration::from_secs(self.rest_timeout_secs)
    }

    /// SHA-256 over the connection-relevant fields, hex encoded
    ///
    /// Used as the cache key for backend instances; changes whenever a
    /// reconnect would be needed.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [
            self.database_url.as_deref().unwrap_or(""),
            self.database_auth_token.as_deref().unwrap_or(""),
            self.rest_url.as_deref().unwrap_or(""),
            self.rest_key.as_deref().unwrap_or(""),
            self.upsert_mode.as_str(),
        ] {
            hasher.update(part.trim().as_bytes());
            hasher.update([0u8]);
        }
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

/// Short prefix of a fingerprint for log lines
pub fn short_fingerprint(fingerprint: &str) -> &str {
    &fingerprint[..fingerprint.len().min(16)]
}
