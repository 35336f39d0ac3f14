//! probegrid.toml configuration parser.
//!
//! Every key is optional. Durations are given in milliseconds; the
//! camelCase spellings used by older deployments are accepted as aliases.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::types::Target;

const MAX_BACKOFF_MULTIPLIER: f64 = 10.0;
/// Longest delay any retry may wait (ms).
const MAX_RETRY_DELAY_MS: f64 = 24.0 * 60.0 * 60.0 * 1000.0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    /// Per-attempt probe deadline (ms).
    pub timeout: u64,
    #[serde(alias = "retryAttempts")]
    pub retry_attempts: u32,
    /// Base delay between retries (ms).
    #[serde(alias = "retryDelay")]
    pub retry_delay: u64,
    #[serde(alias = "retryBackoffMultiplier")]
    pub retry_backoff_multiplier: f64,
    #[serde(alias = "concurrencyLimit")]
    pub concurrency_limit: usize,
    #[serde(alias = "intervalMinutes")]
    pub interval_minutes: u64,
    #[serde(alias = "enableCache")]
    pub enable_cache: bool,
    /// Cache TTL (ms).
    #[serde(alias = "cacheExpiration")]
    pub cache_expiration: u64,
    #[serde(alias = "cacheMaxSize")]
    pub cache_max_size: usize,
    #[serde(alias = "cacheSweepInterval")]
    pub cache_sweep_interval: u64,
    #[serde(alias = "failureThreshold")]
    pub failure_threshold: u32,
    /// Time an open circuit waits before allowing a trial call (ms).
    #[serde(alias = "resetTimeout")]
    pub reset_timeout: u64,
    /// Period of the circuit failure-count decay (ms).
    #[serde(alias = "circuitMonitoringPeriod")]
    pub circuit_monitoring_period: u64,
    #[serde(alias = "poolMaxResources")]
    pub pool_max_resources: usize,
    #[serde(alias = "poolAcquireTimeout")]
    pub pool_acquire_timeout: u64,
    #[serde(alias = "memoryCheckInterval")]
    pub memory_check_interval: u64,
    #[serde(alias = "memoryThresholdMb")]
    pub memory_threshold_mb: u64,
    #[serde(alias = "metricsMaxSamples")]
    pub metrics_max_samples: usize,
    /// Outcomes retained per target for health decisions.
    #[serde(alias = "historySize")]
    pub history_size: usize,
    pub targets: Vec<Target>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            timeout: 30_000,
            retry_attempts: 3,
            retry_delay: 1_000,
            retry_backoff_multiplier: 1.5,
            concurrency_limit: 5,
            interval_minutes: 5,
            enable_cache: true,
            cache_expiration: 300_000,
            cache_max_size: 1_000,
            cache_sweep_interval: 60_000,
            failure_threshold: 5,
            reset_timeout: 60_000,
            circuit_monitoring_period: 120_000,
            pool_max_resources: 5,
            pool_acquire_timeout: 30_000,
            memory_check_interval: 30_000,
            memory_threshold_mb: 512,
            metrics_max_samples: 1_000,
            history_size: 10,
            targets: Vec::new(),
        }
    }
}

impl MonitorConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> ConfigResult<Self> {
        let config: MonitorConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Load and validate in one step.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let config = Self::from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> ConfigResult<()> {
        fn invalid(msg: &str) -> ConfigResult<()> {
            Err(ConfigError::Validation(msg.to_string()))
        }

        if self.timeout == 0 {
            return invalid("timeout must be greater than zero");
        }
        if self.concurrency_limit == 0 {
            return invalid("concurrency_limit must be greater than zero");
        }
        if self.interval_minutes == 0 {
            return invalid("interval_minutes must be greater than zero");
        }
        if self.enable_cache
            && (self.cache_max_size == 0 || self.cache_expiration == 0 || self.cache_sweep_interval == 0)
        {
            return invalid(
                "cache_max_size, cache_expiration and cache_sweep_interval must be non-zero when caching is enabled",
            );
        }
        if self.failure_threshold == 0 {
            return invalid("failure_threshold must be greater than zero");
        }
        if self.circuit_monitoring_period == 0 {
            return invalid("circuit_monitoring_period must be greater than zero");
        }
        if self.memory_check_interval == 0 {
            return invalid("memory_check_interval must be greater than zero");
        }
        if self.pool_max_resources == 0 {
            return invalid("pool_max_resources must be greater than zero");
        }
        if self.history_size == 0 {
            return invalid("history_size must be greater than zero");
        }
        if !(1.0..=MAX_BACKOFF_MULTIPLIER).contains(&self.retry_backoff_multiplier) {
            return invalid("retry_backoff_multiplier must be between 1.0 and 10.0");
        }
        let longest_delay = self.retry_delay as f64
            * self
                .retry_backoff_multiplier
                .powi(self.retry_attempts.min(i32::MAX as u32) as i32);
        if longest_delay > MAX_RETRY_DELAY_MS {
            return invalid("retry_delay grown by retry_backoff_multiplier over retry_attempts exceeds one day");
        }

        let mut seen = HashSet::new();
        for target in &self.targets {
            if target.url.trim().is_empty() {
                return invalid("target url must not be empty");
            }
            if !seen.insert(target.url.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate target url: {}",
                    target.url
                )));
            }
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay)
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes * 60)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_expiration)
    }

    pub fn cache_sweep_period(&self) -> Duration {
        Duration::from_millis(self.cache_sweep_interval)
    }

    pub fn circuit_reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout)
    }

    pub fn circuit_decay_period(&self) -> Duration {
        Duration::from_millis(self.circuit_monitoring_period)
    }

    pub fn pool_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_acquire_timeout)
    }

    pub fn memory_check_period(&self) -> Duration {
        Duration::from_millis(self.memory_check_interval)
    }

    pub fn memory_threshold_bytes(&self) -> u64 {
        self.memory_threshold_mb * 1024 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Priority;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let c = MonitorConfig::default();
        assert_eq!(c.retry_attempts, 3);
        assert_eq!(c.concurrency_limit, 5);
        assert_eq!(c.cache_ttl(), Duration::from_secs(300));
        assert_eq!(c.cache_max_size, 1000);
        assert_eq!(c.failure_threshold, 5);
        assert_eq!(c.circuit_reset_timeout(), Duration::from_secs(60));
        assert_eq!(c.circuit_decay_period(), Duration::from_secs(120));
        assert_eq!(c.pool_wait_timeout(), Duration::from_secs(30));
        assert!(c.validate().is_ok());
    }

    #[test]
    fn parse_minimal() {
        let c = MonitorConfig::parse("").unwrap();
        assert_eq!(c, MonitorConfig::default());
    }

    #[test]
    fn parse_camel_case_aliases_and_targets() {
        let toml_str = r#"
timeout = 5000
retryAttempts = 2
retryDelay = 250
concurrencyLimit = 8
intervalMinutes = 1
enableCache = false
failureThreshold = 3
resetTimeout = 10000

[[targets]]
url = "http://10.0.0.1/status"
group = "site-a"
priority = "high"

[[targets]]
url = "http://10.0.0.2/status"
group = "site-a"
priority = "normal"
enabled = false
"#;
        let c = MonitorConfig::parse(toml_str).unwrap();
        assert_eq!(c.probe_timeout(), Duration::from_secs(5));
        assert_eq!(c.retry_attempts, 2);
        assert_eq!(c.retry_base_delay(), Duration::from_millis(250));
        assert_eq!(c.concurrency_limit, 8);
        assert_eq!(c.cycle_interval(), Duration::from_secs(60));
        assert!(!c.enable_cache);
        assert_eq!(c.failure_threshold, 3);
        assert_eq!(c.targets.len(), 2);
        assert_eq!(c.targets[0].priority, Priority::High);
        assert_eq!(c.targets[1].priority, Priority::Medium);
        assert!(!c.targets[1].enabled);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_concurrency() {
        let c = MonitorConfig {
            concurrency_limit: 0,
            ..Default::default()
        };
        assert!(matches!(c.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn validate_rejects_zero_cache_size_only_when_enabled() {
        let mut c = MonitorConfig {
            cache_max_size: 0,
            ..Default::default()
        };
        assert!(c.validate().is_err());
        c.enable_cache = false;
        assert!(c.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_background_periods() {
        let cases = [
            MonitorConfig {
                cache_sweep_interval: 0,
                ..Default::default()
            },
            MonitorConfig {
                circuit_monitoring_period: 0,
                ..Default::default()
            },
            MonitorConfig {
                memory_check_interval: 0,
                ..Default::default()
            },
        ];
        for c in cases {
            let err = c.validate().unwrap_err();
            assert!(matches!(err, ConfigError::Validation(_)), "{err}");
        }

        // The sweeper never runs without a cache.
        let c = MonitorConfig {
            cache_sweep_interval: 0,
            enable_cache: false,
            ..Default::default()
        };
        assert!(c.validate().is_ok());
    }

    #[test]
    fn validate_bounds_retry_backoff() {
        let c = MonitorConfig {
            retry_backoff_multiplier: 0.5,
            ..Default::default()
        };
        assert!(c.validate().is_err());

        let c = MonitorConfig {
            retry_backoff_multiplier: 1e300,
            ..Default::default()
        };
        assert!(c.validate().unwrap_err().to_string().contains("between 1.0 and 10.0"));

        let c = MonitorConfig {
            retry_backoff_multiplier: f64::NAN,
            ..Default::default()
        };
        assert!(c.validate().is_err());

        // 1s * 10^6 is over a day.
        let c = MonitorConfig {
            retry_backoff_multiplier: 10.0,
            retry_attempts: 6,
            ..Default::default()
        };
        assert!(c.validate().unwrap_err().to_string().contains("exceeds one day"));

        let c = MonitorConfig {
            retry_backoff_multiplier: 10.0,
            retry_attempts: 4,
            ..Default::default()
        };
        assert!(c.validate().is_ok());
    }

    #[test]
    fn validate_rejects_duplicate_targets() {
        let c = MonitorConfig {
            targets: vec![
                Target::new("http://a", "g", Priority::Low),
                Target::new("http://a", "h", Priority::High),
            ],
            ..Default::default()
        };
        let err = c.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate target url"));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "concurrency_limit = 2\n[[targets]]\nurl = \"http://x\"\ngroup = \"g\""
        )
        .unwrap();
        let c = MonitorConfig::load(file.path()).unwrap();
        assert_eq!(c.concurrency_limit, 2);
        assert_eq!(c.targets.len(), 1);
    }

    #[test]
    fn load_rejects_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "interval_minutes = 0").unwrap();
        assert!(matches!(
            MonitorConfig::load(file.path()),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn load_reports_parse_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "timeout = \"soon\"").unwrap();
        assert!(matches!(
            MonitorConfig::from_file(file.path()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn round_trips_through_toml() {
        let c = MonitorConfig {
            targets: vec![Target::new("http://a", "g", Priority::Low)],
            ..Default::default()
        };
        let s = c.to_toml_string().unwrap();
        assert!(s.contains("http://a"));
        assert_eq!(MonitorConfig::parse(&s).unwrap(), c);
    }
}
