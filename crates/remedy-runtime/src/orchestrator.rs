//! Resilience orchestrator: one decision from a prioritized set of providers.
//!
//! For each provider in priority order:
//! - skip it if its breaker rejects the call (no retry budget spent)
//! - check the run and daily budgets, refusing outright when exhausted
//! - call it under a per-call timeout, retrying transient errors with
//!   capped exponential backoff
//!
//! A timed-out call is dropped in place; nothing is spawned, so nothing
//! outlives the caller.

use futures::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use remedy_core::{FailureContext, HealDecision, IntentContract, UiSnapshot};

use crate::config::ResilienceConfig;
use crate::providers::{HealProvider, ProviderBinding, ProviderError, ProviderRegistry};
use crate::resilience::{
    BreakerStats, BudgetExceeded, BudgetTracker, LlmUsage, ProviderChain, ProviderEntry,
};

/// Errors from the orchestrator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrchestratorError {
    /// The orchestrator declined to try.
    #[error("Budget exceeded: {0}")]
    BudgetExceeded(#[from] BudgetExceeded),

    /// Every provider was tried or skipped and none produced a decision.
    #[error("All providers unavailable: {}", .summary.join("; "))]
    AllProvidersUnavailable { summary: Vec<String> },

    #[error("No providers configured")]
    NoProviders,
}

/// Call accounting since construction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorStats {
    pub provider_calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub skipped_open: u64,
    pub budget_refusals: u64,
    pub usage: LlmUsage,
}

#[derive(Default)]
struct Counters {
    provider_calls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
    skipped_open: AtomicU64,
    budget_refusals: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub struct ResilienceOrchestrator {
    chain: ProviderChain,
    config: ResilienceConfig,
    budget: BudgetTracker,
    counters: Counters,
}

impl ResilienceOrchestrator {
    pub fn builder() -> ResilienceOrchestratorBuilder {
        ResilienceOrchestratorBuilder::new()
    }

    /// Produce a decision, falling back across providers.
    pub async fn evaluate(
        &self,
        failure: &FailureContext,
        snapshot: &UiSnapshot,
        intent: &IntentContract,
    ) -> Result<HealDecision, OrchestratorError> {
        if self.chain.is_empty() {
            return Err(OrchestratorError::NoProviders);
        }

        let mut summary = Vec::new();
        for entry in self.chain.entries() {
            match self.try_provider(entry, failure, snapshot, intent).await {
                Ok(decision) => return Ok(decision),
                Err(Attempt::Refused(e)) => {
                    bump(&self.counters.budget_refusals);
                    tracing::info!(provider = %entry.alias, reason = %e, "Provider call refused by budget");
                    return Err(OrchestratorError::BudgetExceeded(e));
                }
                Err(Attempt::Skipped) => {
                    summary.push(format!("{}: circuit open", entry.alias));
                }
                Err(Attempt::Failed(e)) => {
                    summary.push(format!("{}: {}", entry.alias, e));
                }
            }
        }

        tracing::warn!(summary = ?summary, "All providers unavailable");
        Err(OrchestratorError::AllProvidersUnavailable { summary })
    }

    async fn try_provider(
        &self,
        entry: &ProviderEntry,
        failure: &FailureContext,
        snapshot: &UiSnapshot,
        intent: &IntentContract,
    ) -> Result<HealDecision, Attempt> {
        let retry = &self.config.retry;
        let mut last_error = None;

        for attempt in 1..=retry.max_attempts.max(1) {
            if !entry.breaker.try_acquire() {
                bump(&self.counters.skipped_open);
                tracing::debug!(provider = %entry.alias, attempt, "Circuit open, skipping provider");
                return Err(last_error.map_or(Attempt::Skipped, Attempt::Failed));
            }

            if let Err(e) = self.budget.try_reserve(entry.provider.cost_estimate()) {
                // The breaker may have just admitted us as its half-open trial
                entry.breaker.release_trial();
                return Err(Attempt::Refused(e));
            }
            bump(&self.counters.provider_calls);

            let call = entry.provider.evaluate(failure, snapshot, intent);
            let result = match tokio::time::timeout(self.config.call_timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(self.config.call_timeout)),
            };

            let error = match result {
                Ok(decision) => {
                    bump(&self.counters.successes);
                    entry.breaker.record_success();
                    entry.breaker.record_cost(decision.estimated_cost_usd);
                    self.budget
                        .record(decision.estimated_tokens, decision.estimated_cost_usd);
                    tracing::debug!(
                        provider = %entry.alias,
                        attempt,
                        confidence = decision.confidence,
                        "Provider produced decision"
                    );
                    return Ok(decision.with_provider(entry.alias.clone()));
                }
                Err(e) => e,
            };

            bump(&self.counters.failures);
            entry.breaker.record_failure(error.is_permanent());
            tracing::warn!(provider = %entry.alias, attempt, error = %error, "Provider call failed");

            if !error.is_transient() || attempt >= retry.max_attempts {
                return Err(Attempt::Failed(error));
            }

            let delay = retry.delay_after(attempt, error.retry_after());
            bump(&self.counters.retries);
            tracing::debug!(
                provider = %entry.alias,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Retrying after backoff"
            );
            last_error = Some(error);
            tokio::time::sleep(delay).await;
        }

        Err(last_error.map_or(Attempt::Skipped, Attempt::Failed))
    }

    pub fn stats(&self) -> OrchestratorStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        OrchestratorStats {
            provider_calls: load(&self.counters.provider_calls),
            successes: load(&self.counters.successes),
            failures: load(&self.counters.failures),
            retries: load(&self.counters.retries),
            skipped_open: load(&self.counters.skipped_open),
            budget_refusals: load(&self.counters.budget_refusals),
            usage: self.budget.usage(),
        }
    }

    pub fn breaker_stats(&self) -> Vec<BreakerStats> {
        self.chain.breaker_stats()
    }

    /// Reset every breaker, or the one serving `alias`. Returns how many
    /// breakers were reset.
    pub fn reset_breakers(&self, alias: Option<&str>) -> usize {
        self.chain.reset_breakers(alias)
    }

    /// Begin a new run's request budget.
    pub fn reset_run_budget(&self) {
        self.budget.reset_run();
    }

    pub fn chain(&self) -> &ProviderChain {
        &self.chain
    }

    /// Probe every provider concurrently, one result per alias.
    pub async fn health(&self) -> Vec<(String, bool)> {
        let probes = self.chain.entries().iter().map(|entry| async move {
            let healthy = entry.provider.health_check().await;
            if !healthy {
                tracing::warn!(provider = %entry.alias, "Provider health check failed");
            }
            (entry.alias.clone(), healthy)
        });
        join_all(probes).await
    }
}

enum Attempt {
    Skipped,
    Refused(BudgetExceeded),
    Failed(ProviderError),
}

/// Builder for [`ResilienceOrchestrator`].
#[derive(Default)]
pub struct ResilienceOrchestratorBuilder {
    providers: Vec<(String, u32, Arc<dyn HealProvider>)>,
    config: ResilienceConfig,
}

impl ResilienceOrchestratorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: ResilienceConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a provider under `alias`.
    pub fn provider(
        mut self,
        alias: impl Into<String>,
        priority: u32,
        provider: Arc<dyn HealProvider>,
    ) -> Self {
        self.providers.push((alias.into(), priority, provider));
        self
    }

    /// Materialize bindings through a registry and add them.
    pub fn bindings(
        mut self,
        registry: &ProviderRegistry,
        bindings: &[ProviderBinding],
    ) -> Result<Self, ProviderError> {
        for (binding, provider) in registry.materialize(bindings)? {
            self.providers
                .push((binding.alias, binding.priority, provider));
        }
        Ok(self)
    }

    pub fn build(self) -> Result<ResilienceOrchestrator, OrchestratorError> {
        if self.providers.is_empty() {
            return Err(OrchestratorError::NoProviders);
        }

        let chain = self.providers.into_iter().fold(
            ProviderChain::new(self.config.breaker.clone()),
            |chain, (alias, priority, provider)| chain.with_provider(alias, priority, provider),
        );

        Ok(ResilienceOrchestrator {
            chain,
            budget: BudgetTracker::new(self.config.budgets.clone()),
            config: self.config,
            counters: Counters::default(),
        })
    }
}
