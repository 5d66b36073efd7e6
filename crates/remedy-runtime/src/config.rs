//! Runtime configuration.
//!
//! Loaded from YAML or JSON and validated before anything is built. A
//! configuration that fails validation is fatal: the engine never runs
//! with undefined guardrail behavior.
//!
//! ```yaml
//! enabled: true
//! min_confidence: 0.85
//! guardrails:
//!   forbidden_keywords: ["delete account", "re:^pay(ment)?\\b"]
//! cache:
//!   success_ttl: 12h
//!   refusal_ttl: 30m
//! resilience:
//!   call_timeout: 20s
//!   retry: { max_attempts: 3, base_delay: 500ms, max_delay: 8s }
//! providers:
//!   - { alias: primary, provider_type: llm, priority: 0 }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use remedy_core::{
    GuardrailChecker, GuardrailConfig, PatternError, RegistryConfig, SourceUpdateConfig,
    SourceUpdater,
};

use crate::cache::CacheConfig;
use crate::providers::ProviderBinding;
use crate::resilience::{BudgetConfig, CircuitBreakerConfig, RetryConfig};

/// Errors from loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid forbidden pattern: {0}")]
    Pattern(#[from] PatternError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Retry, budget, breaker and timeout settings for provider calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub retry: RetryConfig,
    pub budgets: BudgetConfig,
    pub breaker: CircuitBreakerConfig,

    /// Upper bound on one provider call
    #[serde(with = "humantime_duration")]
    pub call_timeout: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            budgets: BudgetConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Global switch; when false every attempt is refused
    pub enabled: bool,

    /// Overrides `guardrails.min_confidence` when set
    pub min_confidence: Option<f64>,

    pub guardrails: GuardrailConfig,
    pub cache: CacheConfig,
    pub resilience: ResilienceConfig,
    pub providers: Vec<ProviderBinding>,
    pub registry: RegistryConfig,
    pub source_update: SourceUpdateConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_confidence: None,
            guardrails: GuardrailConfig::default(),
            cache: CacheConfig::default(),
            resilience: ResilienceConfig::default(),
            providers: Vec::new(),
            registry: RegistryConfig::default(),
            source_update: SourceUpdateConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load by extension: `.json` as JSON, anything else as YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&contents),
            _ => Self::from_yaml(&contents),
        }
    }

    /// Guardrail settings with the top-level confidence override applied.
    pub fn effective_guardrails(&self) -> GuardrailConfig {
        let mut guardrails = self.guardrails.clone();
        if let Some(min) = self.min_confidence {
            guardrails.min_confidence = min;
        }
        guardrails
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        let guardrails = self.effective_guardrails();

        for (name, value) in [
            ("min_confidence", guardrails.min_confidence),
            (
                "registry.auto_update_threshold",
                self.registry.auto_update_threshold,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return invalid(format!("{} must be within [0, 1], got {}", name, value));
            }
        }

        let retry = &self.resilience.retry;
        if retry.max_attempts == 0 {
            return invalid("resilience.retry.max_attempts must be at least 1".into());
        }
        if retry.base_delay > retry.max_delay {
            return invalid(format!(
                "resilience.retry.base_delay ({:?}) exceeds max_delay ({:?})",
                retry.base_delay, retry.max_delay
            ));
        }
        if self.resilience.breaker.failure_threshold == 0 {
            return invalid("resilience.breaker.failure_threshold must be at least 1".into());
        }
        if self.resilience.call_timeout.is_zero() {
            return invalid("resilience.call_timeout must be positive".into());
        }
        if self.cache.max_entries == 0 {
            return invalid("cache.max_entries must be at least 1".into());
        }
        if let Some(limit) = self.resilience.budgets.max_daily_cost_usd {
            if limit < 0.0 || !limit.is_finite() {
                return invalid(format!("resilience.budgets.max_daily_cost_usd is invalid: {}", limit));
            }
        }

        // Compiling runs the pathological-pattern check
        GuardrailChecker::new(&guardrails)?;
        SourceUpdater::new(self.source_update.clone())
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let mut aliases = HashSet::new();
        for binding in &self.providers {
            if !aliases.insert(binding.alias.as_str()) {
                return invalid(format!("duplicate provider alias '{}'", binding.alias));
            }
        }

        Ok(())
    }
}

/// `Duration` written as a humantime string ("30s", "5m").
pub mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(RuntimeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_yaml_with_human_durations() {
        let yaml = r#"
min_confidence: 0.85
cache:
  max_entries: 500
  success_ttl: 12h
  refusal_ttl: 30m
resilience:
  call_timeout: 20s
  retry:
    max_attempts: 4
    base_delay: 250ms
    max_delay: 4s
  breaker:
    failure_threshold: 2
    cooldown: 1m
providers:
  - alias: primary
    provider_type: llm
    priority: 0
    config: { model: fast }
  - alias: backup
    provider_type: llm
    priority: 1
"#;
        let config = RuntimeConfig::from_yaml(yaml).unwrap();
        assert!(config.enabled);
        assert_eq!(config.effective_guardrails().min_confidence, 0.85);
        assert_eq!(config.cache.success_ttl, Duration::from_secs(12 * 3600));
        assert_eq!(config.cache.refusal_ttl, Duration::from_secs(1800));
        assert_eq!(config.resilience.retry.base_delay, Duration::from_millis(250));
        assert_eq!(config.resilience.breaker.cooldown, Duration::from_secs(60));
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[0].config["model"], "fast");
    }

    #[test]
    fn test_rejects_invalid_values() {
        let cases = [
            "min_confidence: 1.5",
            "resilience: { retry: { max_attempts: 0 } }",
            "resilience: { retry: { base_delay: 10s, max_delay: 1s } }",
            "resilience: { breaker: { failure_threshold: 0 } }",
            "cache: { max_entries: 0 }",
            "registry: { auto_update_threshold: -0.1 }",
        ];
        for yaml in cases {
            assert!(
                matches!(RuntimeConfig::from_yaml(yaml), Err(ConfigError::Invalid(_))),
                "{} should be rejected",
                yaml
            );
        }
    }

    #[test]
    fn test_rejects_pathological_pattern() {
        let yaml = r#"guardrails: { forbidden_keywords: ["re:(a+)+$"] }"#;
        assert!(matches!(
            RuntimeConfig::from_yaml(yaml),
            Err(ConfigError::Pattern(PatternError::Pathological { .. }))
        ));
    }

    #[test]
    fn test_rejects_bad_glob_and_duplicate_alias() {
        assert!(RuntimeConfig::from_yaml(r#"source_update: { exclude: ["["] }"#).is_err());

        let json = r#"{"providers": [
            {"alias": "a", "provider_type": "llm"},
            {"alias": "a", "provider_type": "llm", "priority": 2}
        ]}"#;
        match RuntimeConfig::from_json(json) {
            Err(ConfigError::Invalid(msg)) => assert!(msg.contains("duplicate provider alias")),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_bad_duration_is_parse_error() {
        assert!(matches!(
            RuntimeConfig::from_yaml("cache: { success_ttl: soon }"),
            Err(ConfigError::YamlError(_))
        ));
    }
}
