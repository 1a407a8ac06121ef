//! Configuration management

use std::{path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Environment variable prefix; nested keys are separated by `__`
pub const ENV_PREFIX: &str = "FAILSAFE_";

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Endpoint selector configuration
    pub endpoints: MultiEndpointConfig,
    /// Keyed rate limiter configuration
    pub rate_limit: RateLimitConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or holds values the primitives cannot run with.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;

        tracing::debug!(
            endpoints = config.endpoints.endpoints.len(),
            tokens = config.rate_limit.tokens,
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Render the configuration as YAML, durations in their short form
    ///
    /// # Errors
    ///
    /// Returns [`Error::Yaml`] if serialization fails.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Check the values that would otherwise fail at construction time
    ///
    /// An empty endpoint list is allowed here; it only matters once a
    /// selector is built from it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        self.rate_limit.validate()
    }
}

/// Endpoint selector configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiEndpointConfig {
    /// Endpoint ids in priority order (first is preferred)
    pub endpoints: Vec<String>,
    /// Grace window during which an endpoint that went down stays current.
    /// Zero disables the recovering state.
    #[serde(with = "humantime_serde")]
    pub recovery_timeout: Duration,
    /// Dwell time before switching to a better endpoint. Zero switches immediately.
    #[serde(with = "humantime_serde")]
    pub switching_delay: Duration,
}

/// Keyed rate limiter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Tokens per bucket
    pub tokens: u32,
    /// Time for a full refill
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// How often the sweeper looks for idle buckets
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// Minimum idleness before a bucket is evicted
    #[serde(with = "humantime_serde")]
    pub sweep_min_ttl: Duration,
    /// Initial capacity of the bucket map
    pub initial_capacity: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            tokens: 1,
            interval: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(6 * 60 * 60),
            sweep_min_ttl: Duration::from_secs(12 * 60 * 60),
            initial_capacity: 4096,
        }
    }
}

impl RateLimitConfig {
    /// Reject values the limiter cannot run with
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for zero tokens, interval or sweep interval.
    pub fn validate(&self) -> Result<()> {
        if self.tokens == 0 {
            return Err(Error::Config("rate_limit.tokens must be > 0".to_string()));
        }
        if self.interval.is_zero() {
            return Err(Error::Config(
                "rate_limit.interval must be > 0".to_string(),
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(Error::Config(
                "rate_limit.sweep_interval must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_nanos() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "6h", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(s.trim()).map_err(serde::de::Error::custom)
    }

    /// Parse "100ms", "30s", "5m", "6h" or a bare number of seconds
    pub(crate) fn parse(s: &str) -> Result<Duration, String> {
        // "ms" must be checked before "m" and "s"
        if let Some(ms) = s.strip_suffix("ms") {
            return ms
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string());
        }

        let (digits, unit_secs) = if let Some(secs) = s.strip_suffix('s') {
            (secs, 1)
        } else if let Some(mins) = s.strip_suffix('m') {
            (mins, 60)
        } else if let Some(hours) = s.strip_suffix('h') {
            (hours, 60 * 60)
        } else {
            (s, 1)
        };

        digits
            .parse::<u64>()
            .map_err(|e| e.to_string())?
            .checked_mul(unit_secs)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration '{s}' is too large"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_rate_limit_defaults() {
        let config = RateLimitConfig::default();
        assert_eq!(config.tokens, 1);
        assert_eq!(config.interval, Duration::from_secs(1));
        assert_eq!(config.sweep_interval, Duration::from_secs(21_600));
        assert_eq!(config.sweep_min_ttl, Duration::from_secs(43_200));
        assert_eq!(config.initial_capacity, 4096);
    }

    #[test]
    fn test_deserialize_from_yaml() {
        let yaml = r#"
endpoints:
  endpoints: ["primary", "secondary"]
  recovery_timeout: 100ms
  switching_delay: 2s
rate_limit:
  tokens: 3
  interval: 1m
  sweep_min_ttl: 12h
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.endpoints.endpoints, vec!["primary", "secondary"]);
        assert_eq!(config.endpoints.recovery_timeout, Duration::from_millis(100));
        assert_eq!(config.endpoints.switching_delay, Duration::from_secs(2));
        assert_eq!(config.rate_limit.tokens, 3);
        assert_eq!(config.rate_limit.interval, Duration::from_secs(60));
        assert_eq!(config.rate_limit.sweep_min_ttl, Duration::from_secs(43_200));
        // Unset fields keep their defaults
        assert_eq!(config.rate_limit.sweep_interval, Duration::from_secs(21_600));
    }

    #[test]
    fn test_yaml_roundtrip_keeps_subsecond_durations() {
        let config = Config {
            endpoints: MultiEndpointConfig {
                endpoints: vec!["a".to_string()],
                recovery_timeout: Duration::from_millis(250),
                switching_delay: Duration::ZERO,
            },
            rate_limit: RateLimitConfig::default(),
        };
        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("recovery_timeout: 250ms"));

        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_parse_duration_suffixes() {
        assert_eq!(humantime_serde::parse("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(humantime_serde::parse("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(humantime_serde::parse("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(humantime_serde::parse("6h").unwrap(), Duration::from_secs(21_600));
        assert_eq!(humantime_serde::parse("7").unwrap(), Duration::from_secs(7));
        assert!(humantime_serde::parse("soon").is_err());
    }

    #[test]
    fn test_parse_duration_rejects_overflow() {
        let err = humantime_serde::parse("400000000000000000m").unwrap_err();
        assert!(err.contains("too large"), "{err}");
        assert!(humantime_serde::parse("18446744073709551615h").is_err());
        assert_eq!(
            humantime_serde::parse("18446744073709551615s").unwrap(),
            Duration::from_secs(u64::MAX)
        );
    }

    #[test]
    fn test_load_rejects_overflowing_duration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failsafe.yaml");
        std::fs::write(&path, "rate_limit:\n  interval: 400000000000000000m\n").unwrap();

        let err = Config::load(Some(&path)).unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("too large")));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failsafe.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "endpoints:").unwrap();
        writeln!(f, "  endpoints: [a, b, c]").unwrap();
        writeln!(f, "rate_limit:").unwrap();
        writeln!(f, "  tokens: 10").unwrap();
        drop(f);

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.endpoints.endpoints, vec!["a", "b", "c"]);
        assert_eq!(config.rate_limit.tokens, 10);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let err = Config::load(Some(Path::new("/nonexistent/failsafe.yaml"))).unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("not found")));
    }

    #[test]
    fn test_load_rejects_zero_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failsafe.yaml");
        std::fs::write(&path, "rate_limit:\n  tokens: 0\n").unwrap();

        let err = Config::load(Some(&path)).unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("tokens")));
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        let config = RateLimitConfig {
            interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RateLimitConfig {
            sweep_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
