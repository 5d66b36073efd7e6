//! Model provider abstractions.
//!
//! A [`HealProvider`] answers one question: given a failed step, its intent
//! and the current page, which candidate (if any) should replace the broken
//! locator? Transport details belong to each implementation; this module
//! fixes only the contract and the error taxonomy every implementation
//! must map onto.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use remedy_core::{FailureContext, HealDecision, IntentContract, UiSnapshot};

mod factory;
mod llm;
mod response;

pub use factory::{ProviderBinding, ProviderFactory, ProviderRegistry};
pub use llm::{
    ChatMessage, CompletionConfig, CompletionResponse, LlmHealProvider, LlmProvider,
    ModelPricing, TokenUsage,
};
pub use response::{DecisionParser, ResponseError};

/// Errors from model providers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Authentication failed")]
    AuthError,

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("HTTP request failed: {0}")]
    HttpError(String),

    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },

    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

impl ProviderError {
    /// Worth retrying against the same provider after a backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_)
            | Self::RateLimited { .. }
            | Self::HttpError(_)
            | Self::MalformedResponse(_) => true,
            Self::ApiError { status, .. } => *status == 429 || *status >= 500,
            Self::AuthError | Self::NotConfigured(_) => false,
        }
    }

    /// Will not recover without operator action; trips the breaker at once.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::AuthError | Self::NotConfigured(_) => true,
            Self::ApiError { status, .. } => *status == 401 || *status == 403,
            _ => false,
        }
    }

    /// Server-suggested wait, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Capability: choose a replacement locator for a failed step.
#[async_trait]
pub trait HealProvider: Send + Sync {
    /// Produce a decision for one failure.
    async fn evaluate(
        &self,
        failure: &FailureContext,
        snapshot: &UiSnapshot,
        intent: &IntentContract,
    ) -> Result<HealDecision, ProviderError>;

    /// Provider name for logs and breaker bookkeeping.
    fn name(&self) -> &str;

    /// Declared cost of one call in USD, checked against the daily budget
    /// before the call is made.
    fn cost_estimate(&self) -> f64 {
        0.0
    }

    /// Check if provider is healthy.
    async fn health_check(&self) -> bool {
        true
    }
}
