use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::coordinator::{CoordinatorSettings, DEFAULT_LOCK_TTL, DEFAULT_RELEASE_TIMEOUT};
use crate::flow::FlowSettings;
use crate::gate::DEFAULT_ADMISSION_LIMIT;
use crate::limits::{MAX_SEARCH_RESULTS, MAX_SLOTS_PER_SCHEDULE};
use crate::token::{KEY_LEN, generate_key, parse_key};

/// Node settings, read from `SLOTD_*` environment variables.
#[derive(Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub admission_limit: usize,
    pub lock_ttl: Duration,
    pub lock_release_timeout: Duration,
    pub branch_timeout: Duration,
    pub slots_per_schedule: usize,
    pub max_search_results: usize,
    /// WAL appends after which the compactor rewrites the log.
    pub compact_threshold: u64,
    pub reaper_interval: Duration,
    pub metrics_port: Option<u16>,
    pub token_key: [u8; KEY_LEN],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Invalid { key: &'static str, value: String },
    OutOfRange { key: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Invalid { key, value } => write!(f, "{key}: cannot parse {value:?}"),
            ConfigError::OutOfRange { key, value } => write!(f, "{key}: {value} is out of range"),
        }
    }
}

impl std::error::Error for ConfigError {}

// The key is left out so it never ends up in logs.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("data_dir", &self.data_dir)
            .field("admission_limit", &self.admission_limit)
            .field("lock_ttl", &self.lock_ttl)
            .field("lock_release_timeout", &self.lock_release_timeout)
            .field("branch_timeout", &self.branch_timeout)
            .field("slots_per_schedule", &self.slots_per_schedule)
            .field("max_search_results", &self.max_search_results)
            .field("compact_threshold", &self.compact_threshold)
            .field("reaper_interval", &self.reaper_interval)
            .field("metrics_port", &self.metrics_port)
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Absent keys take their defaults; present
    /// but malformed values are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let ms = |key: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            match parsed::<u64>(&lookup, key)? {
                Some(0) => Err(ConfigError::OutOfRange { key, value: "0".into() }),
                Some(ms) => Ok(Duration::from_millis(ms)),
                None => Ok(default),
            }
        };

        let admission_limit = parsed(&lookup, "SLOTD_ADMISSION_LIMIT")?.unwrap_or(DEFAULT_ADMISSION_LIMIT);
        if admission_limit == 0 {
            return Err(ConfigError::OutOfRange {
                key: "SLOTD_ADMISSION_LIMIT",
                value: "0".into(),
            });
        }
        let slots_per_schedule = bounded(&lookup, "SLOTD_SLOTS_PER_SCHEDULE", 3, MAX_SLOTS_PER_SCHEDULE)?;
        let max_search_results = bounded(&lookup, "SLOTD_MAX_SEARCH_RESULTS", 100, MAX_SEARCH_RESULTS)?;

        let token_key = match lookup("SLOTD_TOKEN_KEY") {
            Some(encoded) => parse_key(encoded.trim()).ok_or(ConfigError::Invalid {
                key: "SLOTD_TOKEN_KEY",
                value: "<redacted>".into(),
            })?,
            None => {
                warn!("SLOTD_TOKEN_KEY not set; slot tokens will not survive a restart");
                generate_key()
            }
        };

        Ok(Self {
            data_dir: lookup("SLOTD_DATA_DIR").map_or_else(|| PathBuf::from("./data"), PathBuf::from),
            admission_limit,
            lock_ttl: ms("SLOTD_LOCK_TTL_MS", DEFAULT_LOCK_TTL)?,
            lock_release_timeout: ms("SLOTD_LOCK_RELEASE_TIMEOUT_MS", DEFAULT_RELEASE_TIMEOUT)?,
            branch_timeout: ms("SLOTD_BRANCH_TIMEOUT_MS", FlowSettings::default().branch_timeout)?,
            slots_per_schedule,
            max_search_results,
            compact_threshold: parsed(&lookup, "SLOTD_COMPACT_THRESHOLD")?.unwrap_or(1000),
            reaper_interval: ms("SLOTD_REAPER_INTERVAL_MS", Duration::from_secs(5))?,
            metrics_port: parsed(&lookup, "SLOTD_METRICS_PORT")?,
            token_key,
        })
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            lock_ttl: self.lock_ttl,
            release_timeout: self.lock_release_timeout,
        }
    }

    pub fn flow_settings(&self) -> FlowSettings {
        FlowSettings {
            branch_timeout: self.branch_timeout,
            ..FlowSettings::default()
        }
    }
}

fn parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}

fn bounded(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: usize,
    max: usize,
) -> Result<usize, ConfigError> {
    let value = parsed(lookup, key)?.unwrap_or(default);
    if value == 0 || value > max {
        return Err(ConfigError::OutOfRange {
            key,
            value: value.to_string(),
        });
    }
    Ok(value)
}
