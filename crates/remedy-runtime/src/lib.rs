//! # remedy-runtime
//!
//! Async side of Remedy: asks model providers for replacement locators,
//! keeps that reliable and cheap, and runs the healing pipeline.
//!
//! - [`HealingEngine`]: the entry point framework bindings call on a
//!   failed step, plus run lifecycle hooks and admin operations
//! - [`ResilienceOrchestrator`]: priority fallback across providers with
//!   retry, budgets and per-provider circuit breakers
//! - [`DecisionCache`]: fingerprint-keyed decisions with TTL, LRU
//!   capacity and one evaluation in flight per fingerprint
//!
//! The browser side is injected through the traits in [`capabilities`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use remedy_runtime::{HealingEngine, RuntimeConfig};
//! use remedy_core::{ActionKind, IntentContract, StepContext};
//!
//! let config = RuntimeConfig::from_file("remedy.yaml")?;
//! let engine = HealingEngine::builder(config)
//!     .provider("primary", 0, provider)
//!     .executor(executor)
//!     .build()
//!     .await?;
//!
//! engine.on_run_started("run-42")?;
//! let result = engine
//!     .attempt_heal(
//!         &StepContext::new("run-42"),
//!         &failure,
//!         &IntentContract::for_action(ActionKind::Click),
//!         &snapshot,
//!     )
//!     .await;
//! let summary = engine.on_run_finished("run-42", true);
//! engine.shutdown().await;
//! ```

pub mod cache;
pub mod capabilities;
pub mod config;
pub mod engine;
pub mod orchestrator;
pub mod prompts;
pub mod providers;
pub mod resilience;
pub mod telemetry;

pub use cache::{
    CacheConfig, CacheEntry, CacheStats, Coalesced, DecisionCache, Evaluated, PersistenceError,
};
pub use capabilities::{ActionExecutor, OutcomeValidator, SnapshotCapture};
pub use config::{ConfigError, ResilienceConfig, RuntimeConfig};
pub use engine::{
    EngineError, HealingEngine, HealingEngineBuilder, NO_PROVIDER_AVAILABLE,
    OUTCOME_VALIDATION_FAILED,
};
pub use orchestrator::{
    OrchestratorError, OrchestratorStats, ResilienceOrchestrator, ResilienceOrchestratorBuilder,
};
pub use providers::{
    HealProvider, LlmHealProvider, LlmProvider, ProviderBinding, ProviderError, ProviderFactory,
    ProviderRegistry,
};
pub use resilience::{
    BreakerStats, BudgetConfig, BudgetExceeded, CircuitBreaker, CircuitBreakerConfig,
    CircuitState, RetryConfig,
};
pub use telemetry::init_tracing;
