//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{builtin_operations, LimiterRegistry, RateLimitConfig};

/// Main configuration for a Turnstile process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TurnstileConfig {
    /// Rate limiter per operation name
    #[serde(default = "builtin_operations")]
    pub limiters: BTreeMap<String, RateLimitConfig>,

    /// Background eviction of expired key state
    #[serde(default)]
    pub sweep: SweepConfig,
}

impl Default for TurnstileConfig {
    fn default() -> Self {
        Self {
            limiters: builtin_operations(),
            sweep: SweepConfig::default(),
        }
    }
}

/// Sweep configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SweepConfig {
    /// Seconds between sweeps; zero disables sweeping
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    60
}

impl SweepConfig {
    /// The sweep interval, or `None` when sweeping is disabled.
    pub fn interval(&self) -> Option<Duration> {
        (self.interval_secs > 0).then(|| Duration::from_secs(self.interval_secs))
    }
}

impl TurnstileConfig {
    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every limiter entry.
    pub fn validate(&self) -> Result<()> {
        if self.limiters.is_empty() {
            return Err(TurnstileError::Config(
                "at least one limiter must be configured".to_string(),
            ));
        }
        for (name, limiter) in &self.limiters {
            limiter
                .validate()
                .map_err(|e| TurnstileError::Config(format!("limiter '{}': {}", name, e)))?;
        }
        Ok(())
    }

    /// Build the limiter registry described by this configuration.
    pub fn build_registry(&self) -> Result<LimiterRegistry> {
        LimiterRegistry::new(self.limiters.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_uses_builtin_table() {
        let config = TurnstileConfig::default();
        assert_eq!(config.limiters, builtin_operations());
        assert_eq!(config.sweep.interval(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = TurnstileConfig::from_yaml("{}").unwrap();
        assert_eq!(config.limiters.len(), 4);
        assert_eq!(config.sweep.interval_secs, 60);
    }

    #[test]
    fn test_parse_limiters() {
        let yaml = r#"
limiters:
  referral:
    max_requests: 3
    time_window_ms: 10000
  eco_score:
    max_requests: 10
    cooldown_ms: null
sweep:
  interval_secs: 0
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.limiters.len(), 2);
        let referral = &config.limiters["referral"];
        assert_eq!(referral.max_requests, 3);
        assert_eq!(referral.time_window, Duration::from_secs(10));
        assert_eq!(referral.cooldown, Some(Duration::from_secs(5)));
        assert_eq!(config.limiters["eco_score"].cooldown, None);
        assert_eq!(config.sweep.interval(), None);

        let registry = config.build_registry().unwrap();
        assert!(registry.get("referral").is_ok());
        assert!(registry.get("api").is_err());
    }

    #[test]
    fn test_invalid_limiter_rejected() {
        let yaml = r#"
limiters:
  broken:
    max_requests: 0
"#;
        assert!(matches!(
            TurnstileConfig::from_yaml(yaml),
            Err(TurnstileError::Config(_))
        ));
    }

    #[test]
    fn test_empty_limiter_table_rejected() {
        assert!(TurnstileConfig::from_yaml("limiters: {}").is_err());
    }

    #[test]
    fn test_malformed_yaml_rejected() {
        assert!(TurnstileConfig::from_yaml("limiters: [1, 2").is_err());
    }

    #[test]
    fn test_from_file_missing() {
        assert!(matches!(
            TurnstileConfig::from_file("/nonexistent/turnstile.yaml"),
            Err(TurnstileError::Io(_))
        ));
    }
}
