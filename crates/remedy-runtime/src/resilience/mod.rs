//! Resilience patterns around provider calls:
//! per-provider circuit breakers, request and spend budgets, retry with
//! backoff, and the ordered fallback chain.

mod budget;
mod circuit_breaker;
mod fallback;
mod retry;

pub use budget::{BudgetConfig, BudgetExceeded, BudgetTracker, LlmUsage};
pub use circuit_breaker::{BreakerStats, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use fallback::{ProviderChain, ProviderEntry};
pub use retry::{RetryConfig, MAX_JITTER_FRACTION};
