//! Configuration system for Hubstat.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $HUBSTAT_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/hubstat/config.toml
//!   3. ~/.config/hubstat/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::{ContentEncoding, MAX_FRAGMENT_PAYLOAD};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HubstatConfig {
    pub transport: TransportConfig,
    pub conflation: ConflationConfig,
    pub assembler: AssemblerConfig,
    pub api: ApiConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// UDP address the receiver binds.
    pub bind_addr: String,
    /// Logical topic name recorded in resumption metadata.
    pub topic: String,
    /// This hub's name. Fragments addressed to another hub are dropped.
    pub hub_name: String,
    /// Producer-side ceiling for one fragment's payload.
    pub max_fragment_bytes: usize,
    /// Producer-side content encoding.
    pub encoding: ContentEncoding,
    /// Where committed offsets are persisted.
    pub offsets_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflationConfig {
    /// Worker pool size. 0 = number of CPUs.
    pub workers: usize,
    /// Seconds between offset commits.
    pub commit_interval_secs: u64,
    /// Handler attempts per claimed bundle, including the first.
    pub retry_max_attempts: u32,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblerConfig {
    /// Partial assemblies older than this are evicted.
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
    /// Recently completed messages remembered for duplicate suppression.
    pub dedup_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory where the default sink writes the latest bundle per
    /// (source, bundle-type).
    pub sink_path: PathBuf,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9440".to_string(),
            topic: "status".to_string(),
            hub_name: String::new(),
            max_fragment_bytes: 60_000,
            encoding: ContentEncoding::Zstd,
            offsets_path: data_dir().join("offsets.json"),
        }
    }
}

impl Default for ConflationConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            commit_interval_secs: 5,
            retry_max_attempts: 5,
            retry_initial_backoff_ms: 200,
            retry_max_backoff_ms: 10_000,
        }
    }
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 120,
            sweep_interval_secs: 10,
            dedup_capacity: 4096,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 9441,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sink_path: data_dir().join("bundles"),
        }
    }
}

impl ConflationConfig {
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.workers
        }
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_secs(self.commit_interval_secs.max(1))
    }
}

impl AssemblerConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("hubstat")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("hubstat")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl HubstatConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            HubstatConfig::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the wire format cannot carry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let max = self.transport.max_fragment_bytes;
        if max == 0 || max > MAX_FRAGMENT_PAYLOAD {
            return Err(ConfigError::Invalid {
                field: "transport.max_fragment_bytes",
                reason: format!("{max} is outside 1..={MAX_FRAGMENT_PAYLOAD}"),
            });
        }
        Ok(())
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("HUBSTAT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&HubstatConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply HUBSTAT_* overrides. `lookup` is `std::env::var` in production.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("HUBSTAT_TRANSPORT__BIND_ADDR") {
            self.transport.bind_addr = v;
        }
        if let Some(v) = lookup("HUBSTAT_TRANSPORT__TOPIC") {
            self.transport.topic = v;
        }
        if let Some(v) = lookup("HUBSTAT_TRANSPORT__HUB_NAME") {
            self.transport.hub_name = v;
        }
        if let Some(Ok(n)) = lookup("HUBSTAT_TRANSPORT__MAX_FRAGMENT_BYTES").map(|v| v.parse()) {
            self.transport.max_fragment_bytes = n;
        }
        if let Some(v) = lookup("HUBSTAT_TRANSPORT__OFFSETS_PATH") {
            self.transport.offsets_path = PathBuf::from(v);
        }
        if let Some(Ok(n)) = lookup("HUBSTAT_CONFLATION__WORKERS").map(|v| v.parse()) {
            self.conflation.workers = n;
        }
        if let Some(Ok(n)) = lookup("HUBSTAT_CONFLATION__COMMIT_INTERVAL_SECS").map(|v| v.parse()) {
            self.conflation.commit_interval_secs = n;
        }
        if let Some(Ok(n)) = lookup("HUBSTAT_CONFLATION__RETRY_MAX_ATTEMPTS").map(|v| v.parse()) {
            self.conflation.retry_max_attempts = n;
        }
        if let Some(Ok(n)) = lookup("HUBSTAT_ASSEMBLER__TTL_SECS").map(|v| v.parse()) {
            self.assembler.ttl_secs = n;
        }
        if let Some(v) = lookup("HUBSTAT_API__ENABLED") {
            self.api.enabled = v == "true" || v == "1";
        }
        if let Some(Ok(p)) = lookup("HUBSTAT_API__PORT").map(|v| v.parse()) {
            self.api.port = p;
        }
        if let Some(v) = lookup("HUBSTAT_STORAGE__SINK_PATH") {
            self.storage.sink_path = PathBuf::from(v);
        }
    }
}
