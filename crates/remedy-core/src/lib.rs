//! # remedy-core
//!
//! Deterministic building blocks for healing broken UI locators in
//! browser tests.
//!
//! This crate answers, without any I/O or model calls:
//! - What failed, and is it a locator failure at all?
//! - Which earlier decision does this failure correspond to? (fingerprint)
//! - May a proposed heal proceed? (guardrails)
//! - What happens to a heal once its test run passes or fails? (registry)
//!
//! The async pieces (model providers, resilience, caching, the engine)
//! live in `remedy-runtime`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use remedy_core::{
//!     ActionKind, CheckScope, FailureContext, GuardrailChecker, GuardrailConfig,
//!     HealDecision, IntentContract, Locator,
//! };
//!
//! let checker = GuardrailChecker::new(&GuardrailConfig::default())?;
//! let failure = FailureContext::new(
//!     "Checkout", "Buy one item", "When I click buy",
//!     Locator::css("button.buy"), "NoSuchElementException", "no such element",
//! );
//! let intent = IntentContract::for_action(ActionKind::Click);
//! let verdict = checker.check(
//!     &HealDecision::heal(0, 0.92, "same label"),
//!     &failure,
//!     &intent,
//!     &CheckScope::default(),
//! );
//! assert!(verdict.allowed);
//! ```

pub mod fingerprint;
pub mod guardrails;
pub mod registry;
pub mod source_updater;
pub mod types;

pub use fingerprint::{normalize_step_text, url_pattern, Fingerprint};
pub use guardrails::{
    CheckScope, ForbiddenPattern, GuardrailChecker, GuardrailConfig, GuardrailVerdict,
    PatternError, Violation,
};
pub use registry::{
    HealState, PendingHeal, RegistryConfig, RegistryError, RunSummary, ValidatedHeal,
    ValidatedHealRegistry,
};
pub use source_updater::{
    SourceUpdateConfig, SourceUpdater, UpdateError, UpdateResult, UpdateStatus,
};
pub use types::{
    ActionKind, BoundingBox, ElementCandidate, FailureContext, FailureKind, HealDecision,
    HealOutcome, HealResult, HealingPolicy, IntentContract, InvariantCheck, Locator,
    LocatorStrategy, SourceLocation, StepContext, StepKeyword, UiSnapshot,
};

use thiserror::Error;

/// Errors from parsing core data.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),
}
