//! Runtime configuration
//!
//! [`PersistenceConfig`] can be built from defaults, from `KEEL_*` environment variables or
//! from a YAML document, and is validated before a persistence unit is built from it.

use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for {field}: expected {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

/// How a persistence context interacts with the second-level cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    /// Read from and write to the cache
    #[default]
    Normal,
    /// Read from the cache, never write to it
    Get,
    /// Write to the cache, never read from it
    Put,
    /// Bypass the cache entirely
    Ignore,
    /// Never read; every load replaces older cached state
    Refresh,
}

impl CacheMode {
    pub fn is_get_enabled(&self) -> bool {
        matches!(self, CacheMode::Normal | CacheMode::Get)
    }

    pub fn is_put_enabled(&self) -> bool {
        matches!(self, CacheMode::Normal | CacheMode::Put | CacheMode::Refresh)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheMode::Normal => "normal",
            CacheMode::Get => "get",
            CacheMode::Put => "put",
            CacheMode::Ignore => "ignore",
            CacheMode::Refresh => "refresh",
        }
    }
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(CacheMode::Normal),
            "get" => Ok(CacheMode::Get),
            "put" => Ok(CacheMode::Put),
            "ignore" => Ok(CacheMode::Ignore),
            "refresh" => Ok(CacheMode::Refresh),
            _ => Err(ConfigError::InvalidValue {
                field: "default_cache_mode".to_string(),
                value: s.to_string(),
                expected: "normal, get, put, ignore or refresh".to_string(),
            }),
        }
    }
}

/// Persistence unit configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Build cache regions for loadables that request them
    pub second_level_cache_enabled: bool,
    /// Collections initialized per statement when the loadable sets no batch size
    pub default_batch_fetch_size: usize,
    /// Cache mode of newly opened contexts
    pub default_cache_mode: CacheMode,
    /// Record unit statistics
    pub statistics_enabled: bool,
    /// Soft lock timeout of read-write regions, in milliseconds
    pub lock_timeout_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            second_level_cache_enabled: true,
            default_batch_fetch_size: 1,
            default_cache_mode: CacheMode::Normal,
            statistics_enabled: true,
            lock_timeout_ms: 60_000,
        }
    }
}

impl PersistenceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let second_level_cache_enabled = parse_env(
            "KEEL_SECOND_LEVEL_CACHE",
            "second_level_cache_enabled",
            "true or false",
            defaults.second_level_cache_enabled,
        )?;
        let default_batch_fetch_size = parse_env(
            "KEEL_BATCH_FETCH_SIZE",
            "default_batch_fetch_size",
            "positive integer",
            defaults.default_batch_fetch_size,
        )?;
        let default_cache_mode = match env::var("KEEL_CACHE_MODE") {
            Ok(value) => value.parse::<CacheMode>()?,
            Err(_) => defaults.default_cache_mode,
        };
        let statistics_enabled = parse_env(
            "KEEL_STATISTICS",
            "statistics_enabled",
            "true or false",
            defaults.statistics_enabled,
        )?;
        let lock_timeout_ms = parse_env(
            "KEEL_LOCK_TIMEOUT_MS",
            "lock_timeout_ms",
            "number of milliseconds",
            defaults.lock_timeout_ms,
        )?;

        let config = PersistenceConfig {
            second_level_cache_enabled,
            default_batch_fetch_size,
            default_cache_mode,
            statistics_enabled,
            lock_timeout_ms,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: PersistenceConfig =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_batch_fetch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "default_batch_fetch_size".to_string(),
                value: "0".to_string(),
                expected: "positive integer".to_string(),
            });
        }

        if self.lock_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "lock_timeout_ms".to_string(),
                value: "0".to_string(),
                expected: "number of milliseconds greater than 0".to_string(),
            });
        }

        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

fn parse_env<T: FromStr>(
    key: &str,
    field: &str,
    expected: &str,
    default: T,
) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(value) => value.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
            field: field.to_string(),
            value,
            expected: expected.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PersistenceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.lock_timeout(), Duration::from_secs(60));
        assert_eq!(config.default_cache_mode, CacheMode::Normal);
    }

    #[test]
    fn test_from_yaml() {
        let config = PersistenceConfig::from_yaml_str(
            "second_level_cache_enabled: false\ndefault_batch_fetch_size: 8\ndefault_cache_mode: get\n",
        )
        .unwrap();
        assert!(!config.second_level_cache_enabled);
        assert_eq!(config.default_batch_fetch_size, 8);
        assert_eq!(config.default_cache_mode, CacheMode::Get);
        assert!(config.statistics_enabled);
    }

    #[test]
    fn test_validation_rejects_zero_values() {
        let err = PersistenceConfig::from_yaml_str("default_batch_fetch_size: 0").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "default_batch_fetch_size"));

        let config = PersistenceConfig {
            lock_timeout_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_env() {
        env::set_var("KEEL_BATCH_FETCH_SIZE", "16");
        env::set_var("KEEL_CACHE_MODE", "refresh");
        let config = PersistenceConfig::from_env().unwrap();
        assert_eq!(config.default_batch_fetch_size, 16);
        assert_eq!(config.default_cache_mode, CacheMode::Refresh);

        env::set_var("KEEL_BATCH_FETCH_SIZE", "many");
        assert!(matches!(
            PersistenceConfig::from_env(),
            Err(ConfigError::InvalidValue { .. })
        ));

        env::remove_var("KEEL_BATCH_FETCH_SIZE");
        env::remove_var("KEEL_CACHE_MODE");
    }

    #[test]
    fn test_cache_mode_flags() {
        assert!(CacheMode::Normal.is_get_enabled() && CacheMode::Normal.is_put_enabled());
        assert!(CacheMode::Get.is_get_enabled() && !CacheMode::Get.is_put_enabled());
        assert!(!CacheMode::Put.is_get_enabled() && CacheMode::Put.is_put_enabled());
        assert!(!CacheMode::Ignore.is_get_enabled() && !CacheMode::Ignore.is_put_enabled());
        assert!(!CacheMode::Refresh.is_get_enabled() && CacheMode::Refresh.is_put_enabled());
        assert_eq!("IGNORE".parse::<CacheMode>().unwrap(), CacheMode::Ignore);
        assert!("sometimes".parse::<CacheMode>().is_err());
    }
}
