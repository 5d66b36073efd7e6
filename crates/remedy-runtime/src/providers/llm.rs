//! Chat-completion backends and the adapter that turns one into a
//! [`HealProvider`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use remedy_core::{FailureContext, HealDecision, IntentContract, UiSnapshot};

use super::response::DecisionParser;
use super::{HealProvider, ProviderError};
use crate::prompts::{heal_user_prompt, HEAL_SYSTEM_PROMPT};

/// Configuration for a completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    pub model: String,

    /// Maximum tokens to generate
    pub max_tokens: u32,

    /// Temperature (0.0 for deterministic)
    pub temperature: f32,

    /// Request timeout
    #[serde(with = "crate::config::humantime_duration")]
    pub timeout: Duration,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            model: "default".to_string(),
            max_tokens: 400,
            temperature: 0.0,
            timeout: Duration::from_secs(20),
        }
    }
}

/// A chat message for LLM completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// "system", "user" or "assistant"
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Response from an LLM completion.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub usage: TokenUsage,
    pub model: String,
}

/// Token usage from a completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

/// Per-million-token prices in USD.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

impl Default for ModelPricing {
    fn default() -> Self {
        Self {
            input_per_mtok: 3.0,
            output_per_mtok: 15.0,
        }
    }
}

impl ModelPricing {
    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        (usage.prompt_tokens as f64 * self.input_per_mtok
            + usage.completion_tokens as f64 * self.output_per_mtok)
            / 1_000_000.0
    }
}

/// A chat-completion backend. Transport lives entirely in implementations.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        config: &CompletionConfig,
    ) -> Result<CompletionResponse, ProviderError>;

    /// Check if provider is healthy.
    async fn health_check(&self) -> bool;

    fn name(&self) -> &str;

    /// Estimate tokens for a prompt.
    fn estimate_tokens(&self, text: &str) -> u32 {
        // ~4 chars per token
        (text.len() / 4) as u32
    }
}

/// Adapts an [`LlmProvider`] into a [`HealProvider`].
///
/// Every reply goes through [`DecisionParser`]; anything that is not a
/// schema-valid choice among the snapshot's candidates becomes
/// [`ProviderError::MalformedResponse`].
pub struct LlmHealProvider {
    llm: Arc<dyn LlmProvider>,
    name: String,
    config: CompletionConfig,
    pricing: ModelPricing,
    /// Prompt size assumed when quoting a cost before the call.
    expected_prompt_tokens: u32,
}

impl LlmHealProvider {
    pub fn new(llm: Arc<dyn LlmProvider>, config: CompletionConfig) -> Self {
        Self {
            name: llm.name().to_string(),
            llm,
            config,
            pricing: ModelPricing::default(),
            expected_prompt_tokens: 2_000,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_pricing(mut self, pricing: ModelPricing) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn with_expected_prompt_tokens(mut self, tokens: u32) -> Self {
        self.expected_prompt_tokens = tokens;
        self
    }

    /// Messages sent for one failure.
    pub fn build_messages(
        failure: &FailureContext,
        snapshot: &UiSnapshot,
        intent: &IntentContract,
    ) -> Vec<ChatMessage> {
        vec![
            ChatMessage::system(HEAL_SYSTEM_PROMPT),
            ChatMessage::user(heal_user_prompt(failure, snapshot, intent)),
        ]
    }
}

#[async_trait]
impl HealProvider for LlmHealProvider {
    async fn evaluate(
        &self,
        failure: &FailureContext,
        snapshot: &UiSnapshot,
        intent: &IntentContract,
    ) -> Result<HealDecision, ProviderError> {
        let messages = Self::build_messages(failure, snapshot, intent);
        let response = self.llm.complete(messages, &self.config).await?;

        let decision = DecisionParser::new(snapshot)
            .parse(&response.content)
            .map_err(|e| {
                tracing::warn!(provider = %self.name, error = %e, "Rejected model reply");
                ProviderError::MalformedResponse(e.to_string())
            })?;

        let cost = self.pricing.cost(&response.usage);
        tracing::debug!(
            provider = %self.name,
            model = %response.model,
            tokens = response.usage.total(),
            cost_usd = cost,
            "Model reply accepted"
        );

        Ok(decision
            .with_cost(response.usage.total(), cost)
            .with_provider(&self.name))
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn cost_estimate(&self) -> f64 {
        self.pricing.cost(&TokenUsage {
            prompt_tokens: self.expected_prompt_tokens,
            completion_tokens: self.config.max_tokens,
        })
    }

    async fn health_check(&self) -> bool {
        self.llm.health_check().await
    }
}
