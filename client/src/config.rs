//! Configuration management.

use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Which store is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Local store only; nothing is queued for a remote store.
    Local,
    /// Local store plus a remote store kept in sync in the background.
    Cloud,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Local => f.write_str("local"),
            Mode::Cloud => f.write_str("cloud"),
        }
    }
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Mode::Local),
            "cloud" => Ok(Mode::Cloud),
            _ => Err(ConfigError::InvalidMode(s.to_string())),
        }
    }
}

/// Knobs for the sync coordinator and the event bus.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Upper bound on every remote call.
    pub remote_timeout: Duration,
    /// Time between flush cycles while online.
    pub flush_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Failed attempts before a mutation is dead-lettered.
    pub retry_cap: u32,
    /// Entity groups flushed concurrently.
    pub flush_workers: usize,
    /// How long delivered event ids are remembered.
    pub dedup_retention: chrono::Duration,
    pub dedup_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            remote_timeout: Duration::from_millis(5000),
            flush_interval: Duration::from_millis(15000),
            backoff_base: Duration::from_millis(1000),
            backoff_max: Duration::from_millis(60000),
            retry_cap: 5,
            flush_workers: 4,
            dedup_retention: chrono::Duration::hours(24),
            dedup_capacity: 10_000,
        }
    }
}

/// Knobs for the kiosk attendance path.
#[derive(Debug, Clone)]
pub struct KioskConfig {
    /// Scans slower than this are logged.
    pub fast_path_budget: Duration,
    /// School local time, used to decide the school day and lateness.
    pub utc_offset: FixedOffset,
}

impl Default for KioskConfig {
    fn default() -> Self {
        Self {
            fast_path_budget: Duration::from_millis(300),
            utc_offset: offset_from_minutes(420).unwrap_or(Utc.fix()),
        }
    }
}

/// Runtime configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    /// Directory holding the local table logs.
    pub data_dir: PathBuf,
    /// PostgreSQL connection URL; required in cloud mode.
    pub database_url: Option<String>,
    /// Host for the local HTTP surface
    pub host: String,
    /// Port for the local HTTP surface
    pub port: u16,
    pub run_migrations: bool,
    pub sync: SyncConfig,
    pub kiosk: KioskConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mode = match lookup("ROLLCALL_MODE") {
            Some(v) => v.parse()?,
            None => Mode::Local,
        };

        let database_url = lookup("DATABASE_URL").filter(|v| !v.is_empty());
        if mode == Mode::Cloud && database_url.is_none() {
            return Err(ConfigError::MissingDatabaseUrl);
        }

        let data_dir = lookup("ROLLCALL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./rollcall-data"));

        let host = lookup("HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let port = lookup("PORT")
            .unwrap_or_else(|| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let defaults = SyncConfig::default();
        let sync = SyncConfig {
            remote_timeout: millis(&lookup, "ROLLCALL_REMOTE_TIMEOUT_MS", defaults.remote_timeout)?,
            flush_interval: millis(&lookup, "ROLLCALL_FLUSH_INTERVAL_MS", defaults.flush_interval)?,
            backoff_base: millis(&lookup, "ROLLCALL_BACKOFF_BASE_MS", defaults.backoff_base)?,
            backoff_max: millis(&lookup, "ROLLCALL_BACKOFF_MAX_MS", defaults.backoff_max)?,
            retry_cap: parsed(&lookup, "ROLLCALL_RETRY_CAP", defaults.retry_cap)?,
            flush_workers: parsed(&lookup, "ROLLCALL_FLUSH_WORKERS", defaults.flush_workers)?,
            ..defaults
        };
        if sync.retry_cap == 0 {
            return Err(invalid("ROLLCALL_RETRY_CAP", "0"));
        }
        if sync.flush_workers == 0 {
            return Err(invalid("ROLLCALL_FLUSH_WORKERS", "0"));
        }

        let kiosk_defaults = KioskConfig::default();
        let offset_minutes: i32 = parsed(&lookup, "ROLLCALL_UTC_OFFSET_MINUTES", 420)?;
        let kiosk = KioskConfig {
            fast_path_budget: millis(
                &lookup,
                "ROLLCALL_FAST_PATH_BUDGET_MS",
                kiosk_defaults.fast_path_budget,
            )?,
            utc_offset: offset_from_minutes(offset_minutes).ok_or_else(|| {
                invalid("ROLLCALL_UTC_OFFSET_MINUTES", &offset_minutes.to_string())
            })?,
        };

        let run_migrations = parsed(&lookup, "ROLLCALL_RUN_MIGRATIONS", false)?;

        Ok(Self {
            mode,
            data_dir,
            database_url,
            host,
            port,
            run_migrations,
            sync,
            kiosk,
        })
    }
}

fn offset_from_minutes(minutes: i32) -> Option<FixedOffset> {
    FixedOffset::east_opt(minutes.checked_mul(60)?)
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        Some(v) => v.trim().parse().map_err(|_| invalid(name, &v)),
        None => Ok(default),
    }
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    parsed(lookup, name, default.as_millis() as u64).map(Duration::from_millis)
}

fn invalid(name: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.to_string(),
        value: value.to_string(),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("DATABASE_URL environment variable is required in cloud mode")]
    MissingDatabaseUrl,

    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("Invalid ROLLCALL_MODE '{0}', expected local or cloud")]
    InvalidMode(String),

    #[error("Invalid value for {name}: '{value}'")]
    InvalidValue { name: String, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.mode, Mode::Local);
        assert_eq!(config.data_dir, PathBuf::from("./rollcall-data"));
        assert_eq!(config.port, 3000);
        assert_eq!(config.sync.retry_cap, 5);
        assert_eq!(config.sync.flush_workers, 4);
        assert_eq!(config.sync.remote_timeout, Duration::from_secs(5));
        assert_eq!(config.kiosk.fast_path_budget, Duration::from_millis(300));
        assert_eq!(config.kiosk.utc_offset.local_minus_utc(), 7 * 3600);
        assert!(!config.run_migrations);
    }

    #[test]
    fn cloud_mode_requires_database_url() {
        assert!(matches!(
            load(&[("ROLLCALL_MODE", "cloud")]),
            Err(ConfigError::MissingDatabaseUrl)
        ));

        let config = load(&[
            ("ROLLCALL_MODE", "Cloud"),
            ("DATABASE_URL", "postgres://localhost/rollcall"),
        ])
        .unwrap();
        assert_eq!(config.mode, Mode::Cloud);
    }

    #[test]
    fn invalid_values_are_reported() {
        assert!(matches!(
            load(&[("ROLLCALL_MODE", "hybrid")]),
            Err(ConfigError::InvalidMode(_))
        ));
        assert!(matches!(
            load(&[("PORT", "http")]),
            Err(ConfigError::InvalidPort)
        ));
        assert!(matches!(
            load(&[("ROLLCALL_RETRY_CAP", "many")]),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            load(&[("ROLLCALL_FLUSH_WORKERS", "0")]),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            load(&[("ROLLCALL_UTC_OFFSET_MINUTES", "99999")]),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn overrides() {
        let config = load(&[
            ("ROLLCALL_FLUSH_INTERVAL_MS", "250"),
            ("ROLLCALL_UTC_OFFSET_MINUTES", "-300"),
            ("ROLLCALL_RUN_MIGRATIONS", "true"),
        ])
        .unwrap();
        assert_eq!(config.sync.flush_interval, Duration::from_millis(250));
        assert_eq!(config.kiosk.utc_offset.local_minus_utc(), -5 * 3600);
        assert!(config.run_migrations);
    }
}
