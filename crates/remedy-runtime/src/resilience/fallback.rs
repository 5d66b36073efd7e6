//! Ordered provider fallback chain.
//!
//! Entries are tried in ascending priority; ties keep insertion order.
//! Aliases bound to the same provider instance share one breaker, so a
//! provider that is down is skipped under every alias at once.

use std::sync::Arc;

use super::circuit_breaker::{BreakerStats, CircuitBreaker, CircuitBreakerConfig};
use crate::providers::HealProvider;

/// One alias in the chain.
#[derive(Clone)]
pub struct ProviderEntry {
    pub alias: String,
    pub priority: u32,
    pub provider: Arc<dyn HealProvider>,
    pub breaker: Arc<CircuitBreaker>,
}

impl std::fmt::Debug for ProviderEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderEntry")
            .field("alias", &self.alias)
            .field("priority", &self.priority)
            .field("provider", &self.provider.name())
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProviderChain {
    entries: Vec<ProviderEntry>,
    breaker_config: CircuitBreakerConfig,
}

impl ProviderChain {
    pub fn new(breaker_config: CircuitBreakerConfig) -> Self {
        Self {
            entries: Vec::new(),
            breaker_config,
        }
    }

    /// Add an alias for `provider`.
    pub fn with_provider(
        mut self,
        alias: impl Into<String>,
        priority: u32,
        provider: Arc<dyn HealProvider>,
    ) -> Self {
        let alias = alias.into();
        let breaker = self
            .entries
            .iter()
            .find(|e| Arc::ptr_eq(&e.provider, &provider))
            .map(|e| e.breaker.clone())
            .unwrap_or_else(|| Arc::new(CircuitBreaker::new(alias.clone(), self.breaker_config.clone())));

        self.entries.push(ProviderEntry {
            alias,
            priority,
            provider,
            breaker,
        });
        // Stable sort keeps insertion order among equal priorities
        self.entries.sort_by_key(|e| e.priority);
        self
    }

    pub fn entries(&self) -> &[ProviderEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One breaker per distinct provider instance.
    pub fn breakers(&self) -> Vec<Arc<CircuitBreaker>> {
        let mut out: Vec<Arc<CircuitBreaker>> = Vec::new();
        for entry in &self.entries {
            if !out.iter().any(|b| Arc::ptr_eq(b, &entry.breaker)) {
                out.push(entry.breaker.clone());
            }
        }
        out
    }

    pub fn breaker_stats(&self) -> Vec<BreakerStats> {
        self.breakers().iter().map(|b| b.stats()).collect()
    }

    /// Reset every breaker, or only the one serving `alias`.
    pub fn reset_breakers(&self, alias: Option<&str>) -> usize {
        match alias {
            Some(alias) => self
                .entries
                .iter()
                .find(|e| e.alias == alias)
                .map(|e| {
                    e.breaker.reset();
                    1
                })
                .unwrap_or(0),
            None => {
                let breakers = self.breakers();
                breakers.iter().for_each(|b| b.reset());
                breakers.len()
            }
        }
    }
}
