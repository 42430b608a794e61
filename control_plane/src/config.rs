//! Configuration for the control plane.
//!
//! Every section has a `Default`; `ControlPlaneConfig::from_env` overlays
//! `FLIGHTDECK_*` environment variables on top of the defaults.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Error raised when an environment variable holds a malformed value.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} must be {expected}, was \"{value}\"")]
    Malformed {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
}

// ================================================================================================
// CONNECTION POOL
// ================================================================================================

/// Configuration for the connection manager.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Maximum number of open (or opening) connections
    pub max_open: usize,
    /// Connections unused for longer than this are closed
    pub idle_ttl: Duration,
    /// How often the reaper looks for idle connections
    pub reap_interval: Duration,
    /// Timeout for a single open attempt
    pub open_timeout: Duration,
    /// Total open attempts before giving up
    pub open_attempts: u32,
    /// Base delay between open attempts, doubled each retry
    pub open_backoff: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_open: 32,
            idle_ttl: Duration::from_secs(10 * 60),
            reap_interval: Duration::from_secs(30),
            open_timeout: Duration::from_secs(10),
            open_attempts: 3,
            open_backoff: Duration::from_millis(500),
        }
    }
}

// ================================================================================================
// STORAGE
// ================================================================================================

/// Where rules and archived recordings live.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the SQLite rule database
    pub rules_db_path: PathBuf,
    /// Root directory of the filesystem archive store
    pub archive_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            rules_db_path: PathBuf::from("./var/data/rules.db"),
            archive_dir: PathBuf::from("./var/archive"),
        }
    }
}

// ================================================================================================
// DISCOVERY
// ================================================================================================

/// A target announced by configuration rather than a discovery platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticTarget {
    pub connect_url: String,
    pub alias: String,
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub static_targets: Vec<StaticTarget>,
    /// How often the discovery strategy is re-listed
    pub poll_interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            static_targets: Vec::new(),
            poll_interval: Duration::from_secs(10),
        }
    }
}

// ================================================================================================
// TOP LEVEL
// ================================================================================================

#[derive(Debug, Clone, Default)]
pub struct ControlPlaneConfig {
    pub connection: ConnectionConfig,
    pub storage: StorageConfig,
    pub discovery: DiscoveryConfig,
}

impl ControlPlaneConfig {
    /// Builds a configuration from the process environment.
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `FLIGHTDECK_MAX_CONNECTIONS` | `connection.max_open` |
    /// | `FLIGHTDECK_IDLE_TTL_SECS` | `connection.idle_ttl` |
    /// | `FLIGHTDECK_REAP_INTERVAL_SECS` | `connection.reap_interval` |
    /// | `FLIGHTDECK_OPEN_TIMEOUT_MS` | `connection.open_timeout` |
    /// | `FLIGHTDECK_OPEN_ATTEMPTS` | `connection.open_attempts` |
    /// | `FLIGHTDECK_OPEN_BACKOFF_MS` | `connection.open_backoff` |
    /// | `FLIGHTDECK_RULES_DB` | `storage.rules_db_path` |
    /// | `FLIGHTDECK_ARCHIVE_DIR` | `storage.archive_dir` |
    /// | `FLIGHTDECK_TARGETS` | `discovery.static_targets` (`alias=url,alias=url`) |
    /// | `FLIGHTDECK_DISCOVERY_POLL_SECS` | `discovery.poll_interval` |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = ControlPlaneConfig::default();
        let conn = &mut config.connection;

        if let Some(v) = parse(&lookup, "FLIGHTDECK_MAX_CONNECTIONS", "a positive integer")? {
            conn.max_open = v;
        }
        if let Some(v) = parse(&lookup, "FLIGHTDECK_IDLE_TTL_SECS", "an integer")? {
            conn.idle_ttl = Duration::from_secs(v);
        }
        if let Some(v) = parse(&lookup, "FLIGHTDECK_REAP_INTERVAL_SECS", "an integer")? {
            conn.reap_interval = Duration::from_secs(v);
        }
        if let Some(v) = parse(&lookup, "FLIGHTDECK_OPEN_TIMEOUT_MS", "an integer")? {
            conn.open_timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse(&lookup, "FLIGHTDECK_OPEN_ATTEMPTS", "a positive integer")? {
            conn.open_attempts = v;
        }
        if let Some(v) = parse(&lookup, "FLIGHTDECK_OPEN_BACKOFF_MS", "an integer")? {
            conn.open_backoff = Duration::from_millis(v);
        }

        if conn.max_open == 0 {
            return Err(ConfigError::Malformed {
                var: "FLIGHTDECK_MAX_CONNECTIONS",
                expected: "a positive integer",
                value: "0".to_string(),
            });
        }
        if conn.reap_interval.is_zero() {
            return Err(ConfigError::Malformed {
                var: "FLIGHTDECK_REAP_INTERVAL_SECS",
                expected: "a positive integer",
                value: "0".to_string(),
            });
        }
        if conn.open_attempts == 0 {
            return Err(ConfigError::Malformed {
                var: "FLIGHTDECK_OPEN_ATTEMPTS",
                expected: "a positive integer",
                value: "0".to_string(),
            });
        }

        if let Some(path) = lookup("FLIGHTDECK_RULES_DB") {
            config.storage.rules_db_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("FLIGHTDECK_ARCHIVE_DIR") {
            config.storage.archive_dir = PathBuf::from(path);
        }
        if let Some(raw) = lookup("FLIGHTDECK_TARGETS") {
            config.discovery.static_targets = parse_targets(&raw)?;
        }
        if let Some(v) = parse::<_, u64>(&lookup, "FLIGHTDECK_DISCOVERY_POLL_SECS", "a positive integer")? {
            if v == 0 {
                return Err(ConfigError::Malformed {
                    var: "FLIGHTDECK_DISCOVERY_POLL_SECS",
                    expected: "a positive integer",
                    value: "0".to_string(),
                });
            }
            config.discovery.poll_interval = Duration::from_secs(v);
        }

        Ok(config)
    }
}

fn parse<F, T>(lookup: &F, var: &'static str, expected: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Malformed {
                var,
                expected,
                value,
            }),
    }
}

fn parse_targets(raw: &str) -> Result<Vec<StaticTarget>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((alias, url)) if !alias.trim().is_empty() && !url.trim().is_empty() => {
                Ok(StaticTarget {
                    alias: alias.trim().to_string(),
                    connect_url: url.trim().to_string(),
                })
            }
            _ => Err(ConfigError::Malformed {
                var: "FLIGHTDECK_TARGETS",
                expected: "a comma separated list of alias=url",
                value: raw.to_string(),
            }),
        })
        .collect()
}
