//! Healing decision engine.
//!
//! [`HealingEngine::attempt_heal`] is the entry point a framework binding
//! calls when a step fails. Every path ends in one of three outcomes:
//!
//! - `SUCCESS`: a candidate was chosen, vetted, acted on and validated
//! - `REFUSED`: policy declined to heal (reason says which rule)
//! - `FAILED`: healing was attempted and did not work
//!
//! Pipeline for one attempt:
//!
//! 1. Step-level guardrails (policy OFF, assertion, destructive, forbidden
//!    step or URL, scenario quota). No provider call, no cache write.
//! 2. Cache lookup by fingerprint. A cached refusal is replayed as is; a
//!    cached heal is matched to the current page by the locator it chose
//!    (evicted and re-evaluated when that element is gone) and goes
//!    through the full guardrail check again.
//! 3. On a miss, one evaluation per fingerprint through the orchestrator.
//! 4. Decision guardrails. Refusals about the decision itself are cached
//!    with the shorter refusal TTL; low confidence is never cached.
//! 5. Execute the action, then validate the declared outcome and invariants.
//! 6. On success: cache the decision and register a pending heal for the run.
//!
//! All collaborators are injected; the engine holds no per-scenario state.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

use remedy_core::{
    CheckScope, ElementCandidate, FailureContext, Fingerprint, GuardrailChecker, HealDecision,
    HealResult, IntentContract, PatternError, PendingHeal, RegistryError, RunSummary,
    SourceLocation, SourceUpdater, StepContext, UiSnapshot, UpdateError, ValidatedHealRegistry,
};

use crate::cache::{CacheEntry, CacheStats, DecisionCache, Evaluated, InFlightGuard, PersistenceError};
use crate::capabilities::{ActionExecutor, OutcomeValidator, SnapshotCapture};
use crate::config::{ConfigError, RuntimeConfig};
use crate::orchestrator::{
    OrchestratorError, OrchestratorStats, ResilienceOrchestrator, ResilienceOrchestratorBuilder,
};
use crate::providers::{HealProvider, ProviderError, ProviderRegistry};
use crate::resilience::BreakerStats;

/// Reason reported when the orchestrator could not produce a decision.
pub const NO_PROVIDER_AVAILABLE: &str = "no provider available";

/// Reason reported when post-action checks did not hold.
pub const OUTCOME_VALIDATION_FAILED: &str = "outcome validation failed";

/// Errors from building the engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid guardrail pattern: {0}")]
    Pattern(#[from] PatternError),

    #[error("Provider setup failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("Orchestrator setup failed: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("Source updater setup failed: {0}")]
    SourceUpdate(#[from] UpdateError),

    #[error("No action executor configured")]
    MissingExecutor,
}

/// How the decision for this attempt was obtained.
struct Resolved {
    decision: HealDecision,
    from_cache: bool,
    /// Present when this caller ran the evaluation and owns the cache write.
    leader: Option<InFlightGuard>,
}

pub struct HealingEngine {
    config: RuntimeConfig,
    guardrails: GuardrailChecker,
    orchestrator: Arc<ResilienceOrchestrator>,
    cache: Arc<DecisionCache>,
    registry: Arc<ValidatedHealRegistry>,
    updater: SourceUpdater,
    executor: Arc<dyn ActionExecutor>,
    validator: Option<Arc<dyn OutcomeValidator>>,
    capture: Option<Arc<dyn SnapshotCapture>>,
}

impl HealingEngine {
    pub fn builder(config: RuntimeConfig) -> HealingEngineBuilder {
        HealingEngineBuilder::new(config)
    }

    /// Try to heal one failed step.
    pub async fn attempt_heal(
        &self,
        ctx: &StepContext,
        failure: &FailureContext,
        intent: &IntentContract,
        snapshot: &UiSnapshot,
    ) -> HealResult {
        let started = Instant::now();

        if let Some(reason) = self.refuse_early(ctx, failure, intent, Some(&snapshot.url)) {
            tracing::info!(run_id = %ctx.run_id, step = %failure.step_text, %reason, "Heal refused");
            return HealResult::refused(reason, 0.0, started.elapsed(), false);
        }

        let fingerprint = Fingerprint::for_failure(failure, &snapshot.url);
        let resolved = match self.resolve(&fingerprint, failure, snapshot, intent).await {
            Ok(resolved) => resolved,
            Err(e) => {
                let reason = match &e {
                    OrchestratorError::BudgetExceeded(b) => format!("budget exceeded: {}", b),
                    _ => NO_PROVIDER_AVAILABLE.to_string(),
                };
                tracing::warn!(fingerprint = %fingerprint.short(), error = %e, "No decision obtained");
                return HealResult::failed(reason, 0.0, started.elapsed(), false);
            }
        };
        let Resolved {
            decision,
            from_cache,
            leader,
        } = resolved;

        if from_cache && !decision.is_healable() {
            let reason = decision
                .refusal_reason
                .clone()
                .unwrap_or_else(|| "cached refusal".to_string());
            tracing::info!(fingerprint = %fingerprint.short(), %reason, "Replayed cached refusal");
            return HealResult::refused(reason, decision.confidence, started.elapsed(), true);
        }

        let candidate = match decision.candidate_index {
            Some(index) => match decision.target_in(snapshot) {
                Some(candidate) => Some(candidate),
                None => {
                    if from_cache {
                        self.cache.remove(&fingerprint).await;
                    }
                    let reason = match &decision.chosen_locator {
                        Some(locator) => format!("chosen element {} not present in snapshot", locator),
                        None => format!("candidate {} not present in snapshot", index),
                    };
                    tracing::warn!(fingerprint = %fingerprint.short(), %reason, "Decision does not match page");
                    return HealResult::failed(reason, decision.confidence, started.elapsed(), from_cache);
                }
            },
            None => None,
        };

        let scope = CheckScope {
            page_url: Some(&snapshot.url),
            candidate,
            heals_in_scenario: ctx.heals_in_scenario,
        };
        let verdict = self.guardrails.check(&decision, failure, intent, &scope);
        let target = match (verdict.allowed, candidate) {
            (true, Some(target)) => target,
            _ => {
                let reason = verdict
                    .reason
                    .unwrap_or_else(|| "provider chose no candidate".to_string());
                if leader.is_some() && verdict.violation.as_ref().is_some_and(|v| v.caches_refusal()) {
                    let refusal = HealDecision::refuse(reason.clone(), decision.confidence)
                        .with_provider(decision.provider.clone());
                    self.cache
                        .put(fingerprint.clone(), refusal, self.config.cache.refusal_ttl)
                        .await;
                }
                tracing::info!(
                    fingerprint = %fingerprint.short(),
                    confidence = decision.confidence,
                    %reason,
                    "Heal refused by guardrails"
                );
                return HealResult::refused(reason, decision.confidence, started.elapsed(), from_cache);
            }
        };

        if let Err(e) = self
            .executor
            .execute(intent.action, target, intent.payload.as_deref())
            .await
        {
            if from_cache {
                self.cache.remove(&fingerprint).await;
            }
            tracing::warn!(fingerprint = %fingerprint.short(), locator = %target.locator, error = %e, "Healed action failed");
            return HealResult::failed(
                format!("action execution failed: {}", e),
                decision.confidence,
                started.elapsed(),
                from_cache,
            );
        }

        if let Err(reason) = self.validate_outcome(intent, target).await {
            if from_cache {
                self.cache.remove(&fingerprint).await;
            }
            tracing::warn!(fingerprint = %fingerprint.short(), %reason, "Healed action did not achieve intent");
            return HealResult::failed(reason, decision.confidence, started.elapsed(), from_cache);
        }

        if leader.is_some() {
            let pinned = decision.clone().with_chosen_locator(target.locator.clone());
            self.cache
                .put(fingerprint.clone(), pinned, self.config.cache.success_ttl)
                .await;
        }
        drop(leader);

        let location = ctx
            .source
            .clone()
            .unwrap_or_else(|| SourceLocation::new(&failure.feature).in_method(&failure.scenario));
        let pending = PendingHeal::new(
            ctx.run_id.clone(),
            location,
            failure.original_locator.clone(),
            target.locator.clone(),
            decision.confidence,
        )
        .with_step_text(failure.step_text.clone());
        if let Err(e) = self.registry.register_pending(pending) {
            tracing::warn!(run_id = %ctx.run_id, error = %e, "Heal not recorded for source update");
        }

        tracing::info!(
            run_id = %ctx.run_id,
            fingerprint = %fingerprint.short(),
            original = %failure.original_locator,
            healed = %target.locator,
            confidence = decision.confidence,
            from_cache,
            "Step healed"
        );
        HealResult::success(
            decision.confidence,
            target.locator.clone(),
            started.elapsed(),
            from_cache,
        )
    }

    /// Capture the page through the injected [`SnapshotCapture`], then heal.
    pub async fn attempt_heal_with_capture(
        &self,
        ctx: &StepContext,
        failure: &FailureContext,
        intent: &IntentContract,
    ) -> HealResult {
        let started = Instant::now();

        // Skip the capture entirely when policy already says no
        if let Some(reason) = self.refuse_early(ctx, failure, intent, None) {
            return HealResult::refused(reason, 0.0, started.elapsed(), false);
        }

        let Some(capture) = &self.capture else {
            return HealResult::failed("no snapshot capture configured", 0.0, started.elapsed(), false);
        };
        match capture.capture(failure).await {
            Ok(snapshot) => self.attempt_heal(ctx, failure, intent, &snapshot).await,
            Err(e) => {
                tracing::warn!(step = %failure.step_text, error = %e, "Snapshot capture failed");
                HealResult::failed(
                    format!("snapshot capture failed: {}", e),
                    0.0,
                    started.elapsed(),
                    false,
                )
            }
        }
    }

    /// Open a run. Resets the per-run request budget.
    pub fn on_run_started(&self, run_id: &str) -> Result<(), RegistryError> {
        self.registry.on_run_started(run_id)?;
        self.orchestrator.reset_run_budget();
        tracing::debug!(run_id, "Run started");
        Ok(())
    }

    /// Close a run: promote or discard its heals, and apply promoted heals
    /// to source when auto-update is on.
    pub fn on_run_finished(&self, run_id: &str, passed: bool) -> RunSummary {
        let mut summary = self.registry.on_run_finished(run_id, passed);
        if summary.promoted.is_empty() || !self.updater.is_enabled() {
            return summary;
        }

        summary.updates = self.updater.apply_all_validated(&summary.promoted);
        let applied: Vec<SourceLocation> = summary
            .updates
            .iter()
            .filter(|u| u.is_applied())
            .map(|u| u.location.clone())
            .collect();
        self.registry.mark_applied(&applied);
        tracing::info!(
            run_id,
            applied = applied.len(),
            attempted = summary.updates.len(),
            "Validated heals written to source"
        );
        summary
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ValidatedHealRegistry> {
        &self.registry
    }

    pub fn orchestrator(&self) -> &Arc<ResilienceOrchestrator> {
        &self.orchestrator
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    pub async fn clear_cache(&self) {
        self.cache.clear().await;
        tracing::info!("Decision cache cleared");
    }

    pub fn export_cache(&self) -> Vec<CacheEntry> {
        self.cache.export()
    }

    pub async fn import_cache(&self, entries: Vec<CacheEntry>) -> usize {
        self.cache.import(entries).await
    }

    pub fn save_cache(&self, path: &Path) -> Result<usize, PersistenceError> {
        self.cache.save_to(path)
    }

    pub async fn load_cache(&self, path: &Path) -> Result<usize, PersistenceError> {
        self.cache.load_from(path).await
    }

    pub fn breaker_stats(&self) -> Vec<BreakerStats> {
        self.orchestrator.breaker_stats()
    }

    /// Close the breaker of `alias`, or of every provider when `None`.
    pub fn reset_breakers(&self, alias: Option<&str>) -> usize {
        let reset = self.orchestrator.reset_breakers(alias);
        tracing::info!(alias = alias.unwrap_or("*"), reset, "Circuit breakers reset");
        reset
    }

    pub fn orchestrator_stats(&self) -> OrchestratorStats {
        self.orchestrator.stats()
    }

    pub async fn provider_health(&self) -> Vec<(String, bool)> {
        self.orchestrator.health().await
    }

    /// Persist the cache if configured, then stop its background sweep.
    pub async fn shutdown(&self) {
        if let Some(path) = &self.config.cache.persist_path {
            match self.cache.save_to(path) {
                Ok(saved) => tracing::info!(path = %path.display(), saved, "Decision cache persisted"),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to persist decision cache"),
            }
        }
        self.cache.shutdown().await;
    }

    /// Checks that need neither the page structure nor a decision.
    fn refuse_early(
        &self,
        ctx: &StepContext,
        failure: &FailureContext,
        intent: &IntentContract,
        page_url: Option<&str>,
    ) -> Option<String> {
        if !self.config.enabled {
            return Some("healing is disabled".to_string());
        }

        let scope = CheckScope {
            page_url,
            candidate: None,
            heals_in_scenario: ctx.heals_in_scenario,
        };
        let verdict = self.guardrails.precheck(failure, intent, &scope);
        if !verdict.allowed {
            return verdict.reason;
        }

        if !failure.kind.is_locator_failure() {
            return Some(format!("not a locator failure ({:?})", failure.kind));
        }
        None
    }

    async fn resolve(
        &self,
        fingerprint: &Fingerprint,
        failure: &FailureContext,
        snapshot: &UiSnapshot,
        intent: &IntentContract,
    ) -> Result<Resolved, OrchestratorError> {
        if let Some(decision) = self.cache.get(fingerprint).await {
            if replays_on(&decision, snapshot) {
                tracing::debug!(fingerprint = %fingerprint.short(), "Decision cache hit");
                return Ok(Resolved {
                    decision,
                    from_cache: true,
                    leader: None,
                });
            }
            tracing::info!(fingerprint = %fingerprint.short(), "Cached element not on page, re-evaluating");
            self.cache.remove(fingerprint).await;
        }

        let cache = &self.cache;
        let orchestrator = &self.orchestrator;
        let coalesced = self
            .cache
            .coalesce(fingerprint, move || async move {
                // Another leader may have written the cache since our miss
                if let Some(decision) = cache.peek(fingerprint).await {
                    if replays_on(&decision, snapshot) {
                        return Ok(Evaluated::cached(decision));
                    }
                    cache.remove(fingerprint).await;
                }
                let decision = orchestrator.evaluate(failure, snapshot, intent).await?;
                // Followers may hold differently ordered snapshots
                let decision = match decision.target_in(snapshot) {
                    Some(target) => {
                        let locator = target.locator.clone();
                        decision.with_chosen_locator(locator)
                    }
                    None => decision,
                };
                Ok(Evaluated::from(decision))
            })
            .await;

        let Evaluated {
            decision,
            from_cache,
        } = coalesced.result?;
        Ok(Resolved {
            decision,
            from_cache,
            leader: if from_cache { None } else { coalesced.leader },
        })
    }

    async fn validate_outcome(
        &self,
        intent: &IntentContract,
        target: &ElementCandidate,
    ) -> Result<(), String> {
        if !intent.requires_validation() {
            return Ok(());
        }
        let Some(validator) = &self.validator else {
            return Err(format!("{}: no outcome validator configured", OUTCOME_VALIDATION_FAILED));
        };
        match validator.validate(intent, target).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(OUTCOME_VALIDATION_FAILED.to_string()),
            Err(e) => Err(format!("{}: {}", OUTCOME_VALIDATION_FAILED, e)),
        }
    }
}

/// Whether a cached decision can be replayed against `snapshot`. Refusals
/// always can; heals only when the element they chose is still present.
fn replays_on(decision: &HealDecision, snapshot: &UiSnapshot) -> bool {
    if !decision.is_healable() {
        return true;
    }
    decision
        .chosen_locator
        .as_ref()
        .is_some_and(|locator| snapshot.find(locator).is_some())
}

/// Builder for [`HealingEngine`].
///
/// Collaborators not supplied are built from the configuration.
pub struct HealingEngineBuilder {
    config: RuntimeConfig,
    orchestrator: Option<Arc<ResilienceOrchestrator>>,
    providers: ResilienceOrchestratorBuilder,
    cache: Option<Arc<DecisionCache>>,
    registry: Option<Arc<ValidatedHealRegistry>>,
    executor: Option<Arc<dyn ActionExecutor>>,
    validator: Option<Arc<dyn OutcomeValidator>>,
    capture: Option<Arc<dyn SnapshotCapture>>,
}

impl HealingEngineBuilder {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            providers: ResilienceOrchestrator::builder().config(config.resilience.clone()),
            config,
            orchestrator: None,
            cache: None,
            registry: None,
            executor: None,
            validator: None,
            capture: None,
        }
    }

    /// Use a prebuilt orchestrator; provider settings below are ignored.
    pub fn orchestrator(mut self, orchestrator: Arc<ResilienceOrchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    pub fn provider(
        mut self,
        alias: impl Into<String>,
        priority: u32,
        provider: Arc<dyn HealProvider>,
    ) -> Self {
        self.providers = self.providers.provider(alias, priority, provider);
        self
    }

    /// Materialize the configured provider bindings through `registry`.
    pub fn provider_registry(mut self, registry: &ProviderRegistry) -> Result<Self, EngineError> {
        self.providers = self.providers.bindings(registry, &self.config.providers)?;
        Ok(self)
    }

    pub fn cache(mut self, cache: Arc<DecisionCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn registry(mut self, registry: Arc<ValidatedHealRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn ActionExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn validator(mut self, validator: Arc<dyn OutcomeValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn snapshot_capture(mut self, capture: Arc<dyn SnapshotCapture>) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Validate the configuration and assemble the engine. A persisted
    /// cache is loaded when configured; load failures are logged and the
    /// engine starts with an empty cache.
    pub async fn build(self) -> Result<HealingEngine, EngineError> {
        self.config.validate()?;
        let executor = self.executor.ok_or(EngineError::MissingExecutor)?;
        let guardrails = GuardrailChecker::new(&self.config.effective_guardrails())?;
        let updater = SourceUpdater::new(self.config.source_update.clone())?;

        let orchestrator = match self.orchestrator {
            Some(orchestrator) => orchestrator,
            None => Arc::new(self.providers.build()?),
        };

        let cache = match self.cache {
            Some(cache) => cache,
            None => {
                let cache = Arc::new(DecisionCache::new(self.config.cache.clone()));
                if let Some(path) = &self.config.cache.persist_path {
                    if path.exists() {
                        match cache.load_from(path).await {
                            Ok(restored) => {
                                tracing::info!(path = %path.display(), restored, "Decision cache restored")
                            }
                            Err(e) => {
                                tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable decision cache")
                            }
                        }
                    }
                }
                cache
            }
        };

        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(ValidatedHealRegistry::new(self.config.registry.clone())));

        tracing::info!(
            providers = orchestrator.chain().entries().len(),
            min_confidence = guardrails.min_confidence(),
            enabled = self.config.enabled,
            "Healing engine ready"
        );

        Ok(HealingEngine {
            config: self.config,
            guardrails,
            orchestrator,
            cache,
            registry,
            updater,
            executor,
            validator: self.validator,
            capture: self.capture,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use remedy_core::{
        ActionKind, FailureKind, HealOutcome, HealingPolicy, InvariantCheck, Locator,
        SourceUpdateConfig, UpdateStatus,
    };
    use crate::providers::{ProviderBinding, ProviderFactory};
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedProvider {
        decision: HealDecision,
        calls: AtomicUsize,
    }

    impl FixedProvider {
        fn new(decision: HealDecision) -> Arc<Self> {
            Arc::new(Self {
                decision,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HealProvider for FixedProvider {
        async fn evaluate(
            &self,
            _failure: &FailureContext,
            _snapshot: &UiSnapshot,
            _intent: &IntentContract,
        ) -> Result<HealDecision, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.decision.clone())
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    #[derive(Default)]
    struct RecordingExecutor {
        fail: bool,
        executed: Mutex<Vec<(ActionKind, String, Option<String>)>>,
    }

    #[async_trait]
    impl ActionExecutor for RecordingExecutor {
        async fn execute(
            &self,
            action: ActionKind,
            target: &ElementCandidate,
            payload: Option<&str>,
        ) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("element detached");
            }
            self.executed.lock().push((
                action,
                target.locator.value.clone(),
                payload.map(str::to_string),
            ));
            Ok(())
        }
    }

    struct FixedValidator(bool);

    #[async_trait]
    impl OutcomeValidator for FixedValidator {
        async fn validate(
            &self,
            _intent: &IntentContract,
            _target: &ElementCandidate,
        ) -> anyhow::Result<bool> {
            Ok(self.0)
        }
    }

    struct FixedFactory;

    impl ProviderFactory for FixedFactory {
        fn provider_type(&self) -> &'static str {
            "fixed"
        }

        fn create(&self, _config: &serde_json::Value) -> Result<Arc<dyn HealProvider>, ProviderError> {
            let provider: Arc<dyn HealProvider> =
                FixedProvider::new(HealDecision::heal(0, 0.95, "label match"));
            Ok(provider)
        }

        fn validate_config(&self, _config: &serde_json::Value) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    struct StaticCapture;

    #[async_trait]
    impl SnapshotCapture for StaticCapture {
        async fn capture(&self, _failure: &FailureContext) -> anyhow::Result<UiSnapshot> {
            Ok(snapshot())
        }
    }

    fn failure(step: &str) -> FailureContext {
        FailureContext::new(
            "Checkout",
            "Buy one item",
            step,
            Locator::css("button#buy"),
            "NoSuchElementException",
            "no such element: button#buy",
        )
    }

    fn snapshot() -> UiSnapshot {
        UiSnapshot::new(
            "https://shop.test/cart/42",
            vec![
                ElementCandidate::new(Locator::css("button.buy-now")).with_text("Buy now"),
                ElementCandidate::new(Locator::css("a.close-account")).with_text("Close account"),
            ],
        )
    }

    fn ctx() -> StepContext {
        StepContext::new("run-1").with_source(SourceLocation::new("steps/cart.rs").at_line(12))
    }

    async fn engine_with(
        config: RuntimeConfig,
        provider: Arc<FixedProvider>,
        executor: Arc<RecordingExecutor>,
    ) -> HealingEngine {
        HealingEngine::builder(config)
            .provider("primary", 0, provider)
            .executor(executor)
            .snapshot_capture(Arc::new(StaticCapture))
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_disabled_engine_refuses_without_calls() {
        let provider = FixedProvider::new(HealDecision::heal(0, 0.95, "label match"));
        let config = RuntimeConfig {
            enabled: false,
            ..Default::default()
        };
        let engine = engine_with(config, provider.clone(), Arc::default()).await;

        let click = IntentContract::for_action(ActionKind::Click);
        let result = engine
            .attempt_heal(&ctx(), &failure("When I click buy"), &click, &snapshot())
            .await;
        assert_eq!(result.outcome, HealOutcome::Refused);
        assert_eq!(result.reason.as_deref(), Some("healing is disabled"));
        assert_eq!(provider.calls(), 0);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_non_locator_failure_is_refused() {
        let provider = FixedProvider::new(HealDecision::heal(0, 0.95, "label match"));
        let engine = engine_with(RuntimeConfig::default(), provider.clone(), Arc::default()).await;

        let mut broken = failure("When I click buy");
        broken.kind = FailureKind::Unknown;
        let result = engine
            .attempt_heal(&ctx(), &broken, &IntentContract::for_action(ActionKind::Click), &snapshot())
            .await;
        assert_eq!(result.outcome, HealOutcome::Refused);
        assert!(result.reason.unwrap().contains("not a locator failure"));
        assert_eq!(provider.calls(), 0);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_forbidden_target_refusal_is_cached_and_replayed() {
        // Candidate 1 is "Close account", matched by the default keywords
        let provider = FixedProvider::new(HealDecision::heal(1, 0.95, "only button"));
        let executor = Arc::new(RecordingExecutor::default());
        let engine = engine_with(RuntimeConfig::default(), provider.clone(), executor.clone()).await;
        let click = IntentContract::for_action(ActionKind::Click);

        let first = engine
            .attempt_heal(&ctx(), &failure("When I click buy"), &click, &snapshot())
            .await;
        assert_eq!(first.outcome, HealOutcome::Refused);
        assert!(!first.from_cache);
        assert_eq!(engine.cache_stats().await.size, 1);

        let second = engine
            .attempt_heal(&ctx(), &failure("When I click buy"), &click, &snapshot())
            .await;
        assert_eq!(second.outcome, HealOutcome::Refused);
        assert!(second.from_cache);
        assert_eq!(second.reason, first.reason);
        assert_eq!(provider.calls(), 1);
        assert!(executor.executed.lock().is_empty());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_executor_failure_is_not_cached() {
        let provider = FixedProvider::new(HealDecision::heal(0, 0.95, "label match"));
        let executor = Arc::new(RecordingExecutor {
            fail: true,
            ..Default::default()
        });
        let engine = engine_with(RuntimeConfig::default(), provider, executor).await;

        let result = engine
            .attempt_heal(
                &ctx(),
                &failure("When I click buy"),
                &IntentContract::for_action(ActionKind::Click),
                &snapshot(),
            )
            .await;
        assert_eq!(result.outcome, HealOutcome::Failed);
        assert!(result.reason.unwrap().contains("element detached"));
        assert_eq!(engine.cache_stats().await.size, 0);
        assert!(engine.registry().pending("run-1").is_empty());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_outcome_validation_gates_success() {
        let intent = IntentContract::for_action(ActionKind::Type)
            .with_payload("alice")
            .with_outcome_check("username field shows alice")
            .with_invariant(InvariantCheck::new("no-error", "no error banner"));

        // Validator says no
        let provider = FixedProvider::new(HealDecision::heal(0, 0.95, "label match"));
        let engine = HealingEngine::builder(RuntimeConfig::default())
            .provider("primary", 0, provider)
            .executor(Arc::new(RecordingExecutor::default()))
            .validator(Arc::new(FixedValidator(false)))
            .build()
            .await
            .unwrap();
        let result = engine
            .attempt_heal(&ctx(), &failure("When I type the name"), &intent, &snapshot())
            .await;
        assert_eq!(result.outcome, HealOutcome::Failed);
        assert_eq!(result.reason.as_deref(), Some(OUTCOME_VALIDATION_FAILED));
        assert_eq!(engine.cache_stats().await.size, 0);
        engine.shutdown().await;

        // No validator at all: declared checks cannot pass
        let provider = FixedProvider::new(HealDecision::heal(0, 0.95, "label match"));
        let engine = engine_with(RuntimeConfig::default(), provider, Arc::default()).await;
        let result = engine
            .attempt_heal(&ctx(), &failure("When I type the name"), &intent, &snapshot())
            .await;
        assert_eq!(result.outcome, HealOutcome::Failed);
        assert!(result.reason.unwrap().starts_with(OUTCOME_VALIDATION_FAILED));
        engine.shutdown().await;

        // Validator says yes; payload reaches the executor
        let executor = Arc::new(RecordingExecutor::default());
        let provider = FixedProvider::new(HealDecision::heal(0, 0.95, "label match"));
        let engine = HealingEngine::builder(RuntimeConfig::default())
            .provider("primary", 0, provider)
            .executor(executor.clone())
            .validator(Arc::new(FixedValidator(true)))
            .build()
            .await
            .unwrap();
        let result = engine
            .attempt_heal(&ctx(), &failure("When I type the name"), &intent, &snapshot())
            .await;
        assert!(result.is_success());
        assert_eq!(
            executor.executed.lock()[0],
            (ActionKind::Type, "button.buy-now".to_string(), Some("alice".to_string()))
        );
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_quota_and_manual_destructive_override() {
        let provider = FixedProvider::new(HealDecision::heal(0, 0.95, "label match"));
        let engine = engine_with(RuntimeConfig::default(), provider.clone(), Arc::default()).await;
        let click = IntentContract::for_action(ActionKind::Click);

        let exhausted = ctx().with_heals_in_scenario(5);
        let result = engine
            .attempt_heal(&exhausted, &failure("When I click buy"), &click, &snapshot())
            .await;
        assert_eq!(result.outcome, HealOutcome::Refused);
        assert!(result.reason.unwrap().contains("quota"));

        let destructive = click.clone().destructive(false);
        let result = engine
            .attempt_heal(&ctx(), &failure("When I click buy"), &destructive, &snapshot())
            .await;
        assert_eq!(result.outcome, HealOutcome::Refused);
        assert_eq!(provider.calls(), 0);

        let allowed = click.with_policy(HealingPolicy::Manual).destructive(true);
        let result = engine
            .attempt_heal(&ctx(), &failure("When I click buy"), &allowed, &snapshot())
            .await;
        assert!(result.is_success());
        assert_eq!(provider.calls(), 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_capture_path() {
        let provider = FixedProvider::new(HealDecision::heal(0, 0.95, "label match"));
        let engine = engine_with(RuntimeConfig::default(), provider, Arc::default()).await;
        let result = engine
            .attempt_heal_with_capture(
                &ctx(),
                &failure("When I click buy"),
                &IntentContract::for_action(ActionKind::Click),
            )
            .await;
        assert!(result.is_success());
        assert_eq!(result.healed_locator, Some(Locator::css("button.buy-now")));
        engine.shutdown().await;

        let provider = FixedProvider::new(HealDecision::heal(0, 0.95, "label match"));
        let engine = HealingEngine::builder(RuntimeConfig::default())
            .provider("primary", 0, provider)
            .executor(Arc::new(RecordingExecutor::default()))
            .build()
            .await
            .unwrap();
        let result = engine
            .attempt_heal_with_capture(
                &ctx(),
                &failure("When I click buy"),
                &IntentContract::for_action(ActionKind::Click),
            )
            .await;
        assert_eq!(result.outcome, HealOutcome::Failed);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_passing_run_applies_source_update() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("cart_steps.rs");
        fs::write(&file, "let buy = css(\"button#buy\");\n").unwrap();

        let config = RuntimeConfig {
            source_update: SourceUpdateConfig {
                enabled: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let provider = FixedProvider::new(HealDecision::heal(0, 0.95, "label match"));
        let engine = engine_with(config, provider, Arc::default()).await;

        engine.on_run_started("run-7").unwrap();
        let step = StepContext::new("run-7").with_source(SourceLocation::new(&file).at_line(1));
        let result = engine
            .attempt_heal(
                &step,
                &failure("When I click buy"),
                &IntentContract::for_action(ActionKind::Click),
                &snapshot(),
            )
            .await;
        assert!(result.is_success());

        let summary = engine.on_run_finished("run-7", true);
        assert_eq!(summary.promoted.len(), 1);
        assert_eq!(summary.updates.len(), 1);
        assert!(matches!(summary.updates[0].status, UpdateStatus::Applied { .. }));
        assert!(fs::read_to_string(&file).unwrap().contains("button.buy-now"));
        assert!(engine.registry().validated()[0].applied_at.is_some());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_persists_and_build_restores() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RuntimeConfig::default();
        config.cache.persist_path = Some(dir.path().join("decisions.json"));

        let provider = FixedProvider::new(HealDecision::heal(0, 0.95, "label match"));
        let engine = engine_with(config.clone(), provider, Arc::default()).await;
        let click = IntentContract::for_action(ActionKind::Click);
        engine
            .attempt_heal(&ctx(), &failure("When I click buy"), &click, &snapshot())
            .await;
        engine.shutdown().await;

        let provider = FixedProvider::new(HealDecision::heal(0, 0.95, "label match"));
        let engine = engine_with(config, provider.clone(), Arc::default()).await;
        assert_eq!(engine.export_cache().len(), 1);
        let result = engine
            .attempt_heal(&ctx(), &failure("When I click buy"), &click, &snapshot())
            .await;
        assert!(result.from_cache);
        assert_eq!(provider.calls(), 0);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_providers_from_configured_bindings() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(FixedFactory));
        let config = RuntimeConfig {
            providers: vec![
                ProviderBinding::new("primary-again", "fixed", 1),
                ProviderBinding::new("primary", "fixed", 0),
            ],
            ..Default::default()
        };
        let engine = HealingEngine::builder(config)
            .provider_registry(&registry)
            .unwrap()
            .executor(Arc::new(RecordingExecutor::default()))
            .build()
            .await
            .unwrap();

        let aliases: Vec<_> = engine
            .orchestrator()
            .chain()
            .entries()
            .iter()
            .map(|e| e.alias.clone())
            .collect();
        assert_eq!(aliases, vec!["primary", "primary-again"]);
        // Same type and config: one instance, one breaker
        assert_eq!(engine.breaker_stats().len(), 1);

        let result = engine
            .attempt_heal(
                &ctx(),
                &failure("When I click buy"),
                &IntentContract::for_action(ActionKind::Click),
                &snapshot(),
            )
            .await;
        assert!(result.is_success());
        engine.shutdown().await;

        let unknown = RuntimeConfig {
            providers: vec![ProviderBinding::new("x", "missing", 0)],
            ..Default::default()
        };
        assert!(matches!(
            HealingEngine::builder(unknown).provider_registry(&registry),
            Err(EngineError::Provider(ProviderError::NotConfigured(_)))
        ));
    }

    #[tokio::test]
    async fn test_build_requires_executor_and_providers() {
        let provider = FixedProvider::new(HealDecision::heal(0, 0.95, "x"));
        let missing_executor = HealingEngine::builder(RuntimeConfig::default())
            .provider("primary", 0, provider)
            .build()
            .await;
        assert!(matches!(missing_executor, Err(EngineError::MissingExecutor)));

        let no_providers = HealingEngine::builder(RuntimeConfig::default())
            .executor(Arc::new(RecordingExecutor::default()))
            .build()
            .await;
        assert!(matches!(
            no_providers,
            Err(EngineError::Orchestrator(OrchestratorError::NoProviders))
        ));
    }
}
