//! Circuit breaker guarding one provider.
//!
//! ```text
//! Closed --threshold failures or permanent error--> Open
//! Open --cooldown elapsed, next acquire--> HalfOpen (one trial call)
//! HalfOpen --trial succeeds--> Closed
//! HalfOpen --trial fails--> Open (cooldown doubled when configured)
//! ```
//!
//! Every read-modify-write happens under one mutex, so concurrent callers
//! never observe a torn state. Time is read through `tokio::time::Instant`
//! so tests can drive cooldowns with a paused clock.

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,

    /// Time spent open before a trial call is allowed
    #[serde(with = "crate::config::humantime_duration")]
    pub cooldown: Duration,

    /// Double the cooldown each time a trial call fails
    pub double_cooldown: bool,

    #[serde(with = "crate::config::humantime_duration")]
    pub max_cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
            double_cooldown: false,
            max_cooldown: Duration::from_secs(300),
        }
    }
}

/// State of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerStats {
    pub provider: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub daily_cost_usd: f64,
    pub times_opened: u32,
    pub rejected_calls: u64,
    #[serde(with = "crate::config::humantime_duration")]
    pub current_cooldown: Duration,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    current_cooldown: Duration,
    /// Set while the single half-open trial is outstanding.
    trial_started: Option<Instant>,
    last_failure: Option<DateTime<Utc>>,
    cost_day: NaiveDate,
    daily_cost_usd: f64,
    times_opened: u32,
    rejected_calls: u64,
}

impl Inner {
    fn new(cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            current_cooldown: cooldown,
            trial_started: None,
            last_failure: None,
            cost_day: Utc::now().date_naive(),
            daily_cost_usd: 0.0,
            times_opened: 0,
            rejected_calls: 0,
        }
    }

    fn cooldown_elapsed(&self, now: Instant) -> bool {
        self.opened_at
            .map(|at| now.duration_since(at) >= self.current_cooldown)
            .unwrap_or(true)
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.trial_started = None;
        self.times_opened += 1;
    }

    fn roll_cost_day(&mut self) {
        let today = Utc::now().date_naive();
        if today != self.cost_day {
            self.cost_day = today;
            self.daily_cost_usd = 0.0;
        }
    }
}

/// Per-provider circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    provider: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(provider: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            provider: provider.into(),
            inner: Mutex::new(Inner::new(config.cooldown)),
            config,
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Ask permission to call the provider.
    ///
    /// Closed always admits. Open rejects until the cooldown elapses, then
    /// admits exactly one caller as the half-open trial. Further callers are
    /// rejected until that trial is recorded. A trial that never reports
    /// back is abandoned after one more cooldown.
    pub fn try_acquire(&self) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let admitted = match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if inner.cooldown_elapsed(now) {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_started = Some(now);
                    tracing::info!(provider = %self.provider, "Circuit half-open, admitting trial call");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => match inner.trial_started {
                Some(started) if now.duration_since(started) < inner.current_cooldown => false,
                _ => {
                    inner.trial_started = Some(now);
                    true
                }
            },
        };

        if !admitted {
            inner.rejected_calls += 1;
        }
        admitted
    }

    /// Give back a half-open trial that was admitted but never called.
    ///
    /// The circuit returns to open with its original open time, so the next
    /// caller is admitted as the trial straight away.
    pub fn release_trial(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen && inner.trial_started.is_some() {
            inner.state = CircuitState::Open;
            inner.trial_started = None;
            tracing::debug!(provider = %self.provider, "Half-open trial released unused");
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            inner.trial_started = None;
            inner.current_cooldown = self.config.cooldown;
            tracing::info!(provider = %self.provider, "Circuit closed after successful trial");
        }
    }

    /// Record a failed call. `permanent` failures open the circuit at once.
    pub fn record_failure(&self, permanent: bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(Utc::now());

        match inner.state {
            CircuitState::Closed => {
                if permanent || inner.consecutive_failures >= self.config.failure_threshold {
                    inner.open(now);
                    tracing::warn!(
                        provider = %self.provider,
                        failures = inner.consecutive_failures,
                        permanent,
                        "Circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                if self.config.double_cooldown {
                    inner.current_cooldown = inner
                        .current_cooldown
                        .saturating_mul(2)
                        .min(self.config.max_cooldown);
                }
                inner.open(now);
                tracing::warn!(
                    provider = %self.provider,
                    cooldown_ms = inner.current_cooldown.as_millis() as u64,
                    "Circuit reopened after failed trial"
                );
            }
            CircuitState::Open => {}
        }
    }

    /// Add spend to today's total, rolling over at UTC midnight.
    pub fn record_cost(&self, usd: f64) {
        let mut inner = self.inner.lock();
        inner.roll_cost_day();
        inner.daily_cost_usd += usd.max(0.0);
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn stats(&self) -> BreakerStats {
        let mut inner = self.inner.lock();
        inner.roll_cost_day();
        BreakerStats {
            provider: self.provider.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_failure: inner.last_failure,
            daily_cost_usd: inner.daily_cost_usd,
            times_opened: inner.times_opened,
            rejected_calls: inner.rejected_calls,
            current_cooldown: inner.current_cooldown,
        }
    }

    /// Force the circuit closed and clear all counters.
    pub fn reset(&self) {
        *self.inner.lock() = Inner::new(self.config.cooldown);
        tracing::info!(provider = %self.provider, "Circuit reset");
    }
}
