//! Configuration for the margin ingester.
//!
//! Values come from a TOML file (explicit path or the platform config directory),
//! then environment overrides, then validation. Every section has defaults, so an
//! empty or missing file yields a runnable configuration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const CONFIG_FILE_NAME: &str = "margin.toml";
pub const DEFAULT_FIREHOSE_URL: &str = "wss://jetstream2.us-east.bsky.network/subscribe";
pub const DEFAULT_PDS_URL: &str = "https://bsky.social";
pub const DEFAULT_SUBSCRIPTION: &str = "margin-firehose";
/// `com.atproto.repo.listRecords` caps pages at 100 records.
pub const MAX_PAGE_LIMIT: u32 = 100;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub firehose: FirehoseConfig,
    pub sync: SyncConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let path = ProjectDirs::from("at", "margin", "margin")
            .map(|dirs| dirs.data_dir().join("index.duckdb"))
            .unwrap_or_else(|| PathBuf::from("margin.duckdb"));
        Self { path }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirehoseConfig {
    /// Jetstream subscribe endpoint (`ws://` or `wss://`).
    pub url: String,
    /// Name under which the stream cursor is persisted.
    pub subscription: String,
    pub reconnect_delay_secs: u64,
    /// Add up to this many milliseconds of random delay to each reconnect.
    pub reconnect_jitter_ms: u64,
    /// Minimum time between firehose-triggered syncs of one identity.
    pub sync_cooldown_secs: u64,
}

impl Default for FirehoseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_FIREHOSE_URL.to_string(),
            subscription: DEFAULT_SUBSCRIPTION.to_string(),
            reconnect_delay_secs: 5,
            reconnect_jitter_ms: 0,
            sync_cooldown_secs: 300,
        }
    }
}

/// What a reconciliation pass does with records it fetched but could not verify
/// or decode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnverifiedPolicy {
    /// Treat them as absent: a stale local copy is deleted (fail-closed).
    #[default]
    Exclude,
    /// Keep whatever local copy exists, without indexing the untrusted content.
    Retain,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// PDS base URL used for `com.atproto.repo.listRecords`.
    pub pds_url: String,
    /// Bearer token for the PDS, when the deployment requires one.
    pub auth_token: Option<String>,
    pub page_limit: u32,
    pub request_timeout_secs: u64,
    pub max_concurrent_syncs: usize,
    pub unverified_policy: UnverifiedPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            pds_url: DEFAULT_PDS_URL.to_string(),
            auth_token: None,
            page_limit: MAX_PAGE_LIMIT,
            request_timeout_secs: 30,
            max_concurrent_syncs: 3,
            unverified_policy: UnverifiedPolicy::Exclude,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `tracing` filter when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("sync.page_limit must be between 1 and {MAX_PAGE_LIMIT}, got {0}")]
    PageLimit(u32),

    #[error("sync.max_concurrent_syncs must be at least 1")]
    Concurrency,

    #[error("firehose.url must be a ws:// or wss:// URL, got `{0}`")]
    FirehoseUrl(String),

    #[error("firehose.subscription must not be empty")]
    Subscription,
}

impl AppConfig {
    /// Load configuration from `path`, or from the default location when `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => {
                    debug!("no config file found, using defaults");
                    Self::default()
                }
            },
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Platform config location, e.g. `~/.config/margin/margin.toml` on Linux.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("at", "margin", "margin")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Parse a TOML config file without applying env overrides.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `MARGIN_*` overrides. `lookup` is `std::env::var` outside of tests.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("MARGIN_DB_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(url) = lookup("MARGIN_FIREHOSE_URL") {
            self.firehose.url = url;
        }
        if let Some(url) = lookup("MARGIN_PDS_URL") {
            self.sync.pds_url = url;
        }
        if let Some(token) = lookup("MARGIN_AUTH_TOKEN").filter(|t| !t.is_empty()) {
            self.sync.auth_token = Some(token);
        }
        if let Some(level) = lookup("MARGIN_LOG") {
            self.logging.level = level;
        }
    }

    /// Reject settings the sync engine cannot run with.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.sync.page_limit == 0 || self.sync.page_limit > MAX_PAGE_LIMIT {
            return Err(ConfigError::PageLimit(self.sync.page_limit));
        }
        if self.sync.max_concurrent_syncs == 0 {
            return Err(ConfigError::Concurrency);
        }
        if !(self.firehose.url.starts_with("ws://") || self.firehose.url.starts_with("wss://")) {
            return Err(ConfigError::FirehoseUrl(self.firehose.url.clone()));
        }
        if self.firehose.subscription.trim().is_empty() {
            return Err(ConfigError::Subscription);
        }
        Ok(())
    }
}
