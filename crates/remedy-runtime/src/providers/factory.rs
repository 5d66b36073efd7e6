//! Factory pattern for registering heal providers by type name.
//!
//! Configuration names providers through bindings. Several aliases may
//! point at the same underlying provider: bindings with the same type and
//! the same configuration resolve to one shared instance, so they also
//! share one circuit breaker.
//!
//! ```ignore
//! let mut registry = ProviderRegistry::new();
//! registry.register(Arc::new(MyLlmFactory));
//! let providers = registry.materialize(&config.providers)?;
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::{HealProvider, ProviderError};

/// Creates heal providers of one type from JSON configuration.
pub trait ProviderFactory: Send + Sync {
    /// Unique identifier for this provider type.
    fn provider_type(&self) -> &'static str;

    fn create(&self, config: &JsonValue) -> Result<Arc<dyn HealProvider>, ProviderError>;

    /// Validate configuration without creating a provider.
    fn validate_config(&self, config: &JsonValue) -> Result<(), ProviderError>;

    fn description(&self) -> &'static str {
        "Heal provider"
    }
}

/// A named, prioritized reference to a provider type and its settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderBinding {
    pub alias: String,

    pub provider_type: String,

    /// Lower values are tried first.
    #[serde(default)]
    pub priority: u32,

    #[serde(default)]
    pub config: JsonValue,
}

impl ProviderBinding {
    pub fn new(alias: impl Into<String>, provider_type: impl Into<String>, priority: u32) -> Self {
        Self {
            alias: alias.into(),
            provider_type: provider_type.into(),
            priority,
            config: JsonValue::Null,
        }
    }

    pub fn with_config(mut self, config: JsonValue) -> Self {
        self.config = config;
        self
    }

    fn instance_key(&self) -> (String, String) {
        (self.provider_type.clone(), self.config.to_string())
    }
}

/// Registry of available provider factories.
#[derive(Default)]
pub struct ProviderRegistry {
    factories: BTreeMap<String, Arc<dyn ProviderFactory>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory, replacing any with the same type.
    pub fn register(&mut self, factory: Arc<dyn ProviderFactory>) {
        self.factories
            .insert(factory.provider_type().to_string(), factory);
    }

    fn factory(&self, provider_type: &str) -> Result<&Arc<dyn ProviderFactory>, ProviderError> {
        self.factories.get(provider_type).ok_or_else(|| {
            ProviderError::NotConfigured(format!(
                "Unknown provider type: '{}'. Available: {:?}",
                provider_type,
                self.available_types()
            ))
        })
    }

    pub fn create(
        &self,
        provider_type: &str,
        config: &JsonValue,
    ) -> Result<Arc<dyn HealProvider>, ProviderError> {
        self.factory(provider_type)?.create(config)
    }

    pub fn validate(&self, provider_type: &str, config: &JsonValue) -> Result<(), ProviderError> {
        self.factory(provider_type)?.validate_config(config)
    }

    /// Build one provider per distinct (type, config), in binding order.
    ///
    /// Returned pairs keep the caller's order; aliases that resolve to the
    /// same instance hold clones of the same `Arc`.
    pub fn materialize(
        &self,
        bindings: &[ProviderBinding],
    ) -> Result<Vec<(ProviderBinding, Arc<dyn HealProvider>)>, ProviderError> {
        let mut instances: HashMap<(String, String), Arc<dyn HealProvider>> = HashMap::new();
        let mut out = Vec::with_capacity(bindings.len());

        for binding in bindings {
            let key = binding.instance_key();
            let provider = match instances.get(&key) {
                Some(existing) => existing.clone(),
                None => {
                    let factory = self.factory(&binding.provider_type)?;
                    factory.validate_config(&binding.config)?;
                    let created = factory.create(&binding.config)?;
                    tracing::debug!(
                        alias = %binding.alias,
                        provider_type = %binding.provider_type,
                        "Provider instance created"
                    );
                    instances.insert(key, created.clone());
                    created
                }
            };
            out.push((binding.clone(), provider));
        }

        Ok(out)
    }

    pub fn available_types(&self) -> Vec<&str> {
        self.factories.keys().map(|s| s.as_str()).collect()
    }

    pub fn has_provider(&self, provider_type: &str) -> bool {
        self.factories.contains_key(provider_type)
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.available_types())
            .finish()
    }
}
