//! Server configuration.
//!
//! A `Config` struct deserialized from TOML, with a nested
//! `*Config`-per-concern layout and XDG-based discovery order
//! (explicit `--config` path, then `$XDG_CONFIG_HOME/ncpsd`, then
//! `/etc/ncpsd`).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use xdg::BaseDirectories;

use crate::storage::LocalStorageConfig;

/// Application prefix in XDG base directories.
const XDG_PREFIX: &str = "ncpsd";

/// Top-level configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Hostname this instance is known as, used only for log/error
    /// context; not bound to a socket here since HTTP routing is out of
    /// scope for this crate.
    #[serde(default = "default_hostname")]
    pub hostname: String,

    pub database: DatabaseConfig,

    pub storage: LocalStorageConfig,

    #[serde(default)]
    pub chunking: ChunkingConfig,

    #[serde(default)]
    pub locking: LockingConfig,

    #[serde(default)]
    pub compat: CompatConfig,

    /// Total on-disk budget across all stored nars, past which the LRU
    /// evictor reclaims space.
    #[serde(default = "default_max_size")]
    pub max_size: u64,

    /// Scratch directory for in-progress downloads.
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// Path to an Ed25519 keypair file (as produced by `nix-store
    /// --generate-binary-cache-key`). Generated and persisted on first
    /// start if it doesn't exist yet.
    pub secret_key_path: Option<PathBuf>,

    /// Whether narinfos we serve get (re-)signed with our keypair.
    #[serde(default = "default_true")]
    pub should_sign_narinfo: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// A `sea-orm`-compatible connection URL
    /// (`sqlite://path/to/db.sqlite?mode=rwc` or `postgres://...`).
    pub url: String,
}

/// Content-defined chunking tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub cdc_enabled: bool,
    pub min_size: usize,
    pub avg_size: usize,
    pub max_size: usize,

    /// How stale a `chunking_started_at` claim must be before another
    /// worker may re-claim an apparently-abandoned chunking job.
    #[serde(with = "humantime_serde")]
    pub claim_stale_after: Duration,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            cdc_enabled: true,
            min_size: 16 * 1024,
            avg_size: 64 * 1024,
            max_size: 256 * 1024,
            claim_stale_after: Duration::from_secs(600),
        }
    }
}

/// Single-flight and cache-wide lock tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockingConfig {
    /// TTL of a download job's distributed lock lease.
    #[serde(with = "humantime_serde")]
    pub download_lock_ttl: Duration,

    /// TTL of the shared read lease taken on the cache around every
    /// public entry point, and of the exclusive lease the LRU evictor
    /// takes on the same key.
    #[serde(with = "humantime_serde")]
    pub cache_lock_ttl: Duration,

    /// How long a caller polls for another instance's in-flight
    /// download before giving up.
    #[serde(with = "humantime_serde")]
    pub download_poll_timeout: Duration,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            download_lock_ttl: Duration::from_secs(300),
            cache_lock_ttl: Duration::from_secs(30),
            download_poll_timeout: Duration::from_secs(120),
        }
    }
}

/// Legacy-store and touch-write-amplification tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompatConfig {
    /// Skip `touch_narinfo` within this long of the last touch, so a
    /// hot path doesn't write on every single request.
    #[serde(with = "humantime_serde")]
    pub record_age_ignore_touch: Duration,
}

impl Default for CompatConfig {
    fn default() -> Self {
        Self {
            record_age_ignore_touch: Duration::from_secs(300),
        }
    }
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_max_size() -> u64 {
    100 * 1024 * 1024 * 1024
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir().join("ncpsd")
}

fn default_true() -> bool {
    true
}

/// Loads configuration from an explicit path, or from the XDG config
/// search path (`$XDG_CONFIG_HOME/ncpsd/config.toml`, falling back
/// through `/etc/xdg/ncpsd/config.toml`) if none is given.
pub async fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    let resolved = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let xdg = BaseDirectories::with_prefix(XDG_PREFIX)
                .context("failed to resolve XDG base directories")?;
            xdg.find_config_file("config.toml")
                .context("no config file found; pass --config explicitly")?
        }
    };

    let text = tokio::fs::read_to_string(&resolved)
        .await
        .with_context(|| format!("failed to read config file {:?}", resolved))?;

    let config: Config =
        toml::from_str(&text).with_context(|| format!("failed to parse {:?}", resolved))?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_parses() {
        let text = r#"
            [database]
            url = "sqlite://test.db?mode=rwc"

            [storage]
            path = "/var/lib/ncpsd/storage"
        "#;

        let config: Config = toml::from_str(text).unwrap();
        assert_eq!(config.hostname, "localhost");
        assert!(config.chunking.cdc_enabled);
        assert_eq!(config.max_size, 100 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_chunking_overrides_apply() {
        let text = r#"
            [database]
            url = "sqlite://test.db?mode=rwc"

            [storage]
            path = "/var/lib/ncpsd/storage"

            [chunking]
            cdc_enabled = false
            min_size = 1024
        "#;

        let config: Config = toml::from_str(text).unwrap();
        assert!(!config.chunking.cdc_enabled);
        assert_eq!(config.chunking.min_size, 1024);
        // Unspecified fields still pick up their defaults.
        assert_eq!(config.chunking.avg_size, 64 * 1024);
    }
}
