//! Request and spend budgets for provider calls.
//!
//! Two caps are checked before any call is made: the number of provider
//! requests in the current run, and the estimated dollar spend for the
//! current UTC day. Exceeding either is a deliberate refusal, not a
//! retryable error.

use chrono::{NaiveDate, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;

/// Budget limits. `None` means unlimited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub max_requests_per_run: Option<u32>,
    pub max_daily_cost_usd: Option<f64>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_requests_per_run: Some(200),
            max_daily_cost_usd: Some(10.0),
        }
    }
}

/// Which budget declined the call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BudgetExceeded {
    #[error("request budget exhausted ({limit} requests per run)")]
    Requests { limit: u32 },

    #[error("daily cost budget exhausted (${spent:.4} spent of ${limit:.4})")]
    DailyCost { spent: f64, limit: f64 },
}

/// Accumulated provider usage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmUsage {
    pub total_tokens: u64,
    pub provider_calls: u32,
    pub estimated_cost: f64,
}

impl LlmUsage {
    pub fn add(&mut self, tokens: u32, cost_usd: f64) {
        self.total_tokens += u64::from(tokens);
        self.provider_calls += 1;
        self.estimated_cost += cost_usd;
    }
}

/// Budget tracker shared by every call through one orchestrator.
pub struct BudgetTracker {
    config: BudgetConfig,
    requests: AtomicU32,
    daily: Mutex<(NaiveDate, f64)>,
    usage: RwLock<LlmUsage>,
}

impl BudgetTracker {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            requests: AtomicU32::new(0),
            daily: Mutex::new((Utc::now().date_naive(), 0.0)),
            usage: RwLock::new(LlmUsage::default()),
        }
    }

    /// Claim one request slot if both budgets allow a call costing
    /// `estimated_cost`.
    ///
    /// The request counter is only incremented when the call is admitted,
    /// so refusals do not consume budget.
    pub fn try_reserve(&self, estimated_cost: f64) -> Result<(), BudgetExceeded> {
        if let Some(limit) = self.config.max_daily_cost_usd {
            let spent = self.spent_today();
            if spent + estimated_cost > limit {
                return Err(BudgetExceeded::DailyCost { spent, limit });
            }
        }

        if let Some(limit) = self.config.max_requests_per_run {
            self.requests
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                    (used < limit).then_some(used + 1)
                })
                .map_err(|_| BudgetExceeded::Requests { limit })?;
        } else {
            self.requests.fetch_add(1, Ordering::SeqCst);
        }

        Ok(())
    }

    /// Record actual spend after a call.
    pub fn record(&self, tokens: u32, cost_usd: f64) {
        {
            let mut daily = self.daily.lock();
            let today = Utc::now().date_naive();
            if daily.0 != today {
                *daily = (today, 0.0);
            }
            daily.1 += cost_usd.max(0.0);
        }
        self.usage.write().add(tokens, cost_usd);
    }

    pub fn spent_today(&self) -> f64 {
        let daily = self.daily.lock();
        if daily.0 == Utc::now().date_naive() {
            daily.1
        } else {
            0.0
        }
    }

    pub fn requests_this_run(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn usage(&self) -> LlmUsage {
        self.usage.read().clone()
    }

    /// Start a new run: the per-run request counter resets, the daily
    /// spend does not.
    pub fn reset_run(&self) {
        self.requests.store(0, Ordering::SeqCst);
    }
}

impl Default for BudgetTracker {
    fn default() -> Self {
        Self::new(BudgetConfig::default())
    }
}
