//! Guardrail Checker
//!
//! **Question**: May this heal proceed, whatever the model thinks?
//!
//! The checker is a pure function of its inputs. It holds only compiled,
//! immutable configuration and is safe to share across threads without
//! synchronization.
//!
//! Rules are evaluated in a fixed order and the first violation wins:
//!
//! 1. Policy `OFF`
//! 2. Assertion steps (never healed, at any confidence)
//! 3. Destructive actions without a MANUAL-policy override
//! 4. Forbidden patterns in the step text
//! 5. Forbidden patterns in the current page URL
//! 6. Per-scenario heal quota
//! 7. Provider refusal / missing candidate
//! 8. Confidence below the configured minimum
//! 9. Forbidden patterns in the chosen target element

mod patterns;

pub use patterns::{
    first_match, ForbiddenPattern, PatternError, DEFAULT_FORBIDDEN_KEYWORDS, MAX_PATTERN_LEN,
    REGEX_PREFIX,
};

use serde::{Deserialize, Serialize};

use crate::types::{ElementCandidate, FailureContext, HealDecision, HealingPolicy, IntentContract};

/// Guardrail configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailConfig {
    /// Minimum decision confidence accepted.
    pub min_confidence: f64,

    /// Keyword or `re:` patterns matched against step text and target element.
    pub forbidden_keywords: Vec<String>,

    /// Keyword or `re:` patterns matched against the page URL.
    pub forbidden_url_patterns: Vec<String>,

    /// Maximum heals per scenario; `None` disables the quota.
    pub max_heals_per_scenario: Option<u32>,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.8,
            forbidden_keywords: DEFAULT_FORBIDDEN_KEYWORDS
                .iter()
                .map(|k| k.to_string())
                .collect(),
            forbidden_url_patterns: Vec::new(),
            max_heals_per_scenario: Some(5),
        }
    }
}

/// Why a heal was refused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum Violation {
    PolicyOff,
    AssertionStep,
    DestructiveAction,
    ForbiddenStep { pattern: String },
    ForbiddenUrl { pattern: String },
    QuotaExhausted { used: u32, max: u32 },
    NoCandidate { reason: String },
    MalformedConfidence,
    LowConfidence { confidence: f64, minimum: f64 },
    ForbiddenTarget { pattern: String },
}

impl Violation {
    /// Human-readable reason for logs and reports.
    pub fn reason(&self) -> String {
        match self {
            Self::PolicyOff => "healing policy is OFF for this step".to_string(),
            Self::AssertionStep => {
                "assertion steps are never auto-healed".to_string()
            }
            Self::DestructiveAction => {
                "destructive action requires MANUAL policy with explicit override".to_string()
            }
            Self::ForbiddenStep { pattern } => {
                format!("step text matches forbidden pattern '{}'", pattern)
            }
            Self::ForbiddenUrl { pattern } => {
                format!("page URL matches forbidden pattern '{}'", pattern)
            }
            Self::QuotaExhausted { used, max } => {
                format!("scenario heal quota exhausted ({}/{})", used, max)
            }
            Self::NoCandidate { reason } => format!("no healable candidate: {}", reason),
            Self::MalformedConfidence => "decision confidence is not a finite number".to_string(),
            Self::LowConfidence { confidence, minimum } => {
                format!("confidence {:.2} below minimum {:.2}", confidence, minimum)
            }
            Self::ForbiddenTarget { pattern } => {
                format!("chosen element matches forbidden pattern '{}'", pattern)
            }
        }
    }

    /// Whether the refusal should be cached against the fingerprint.
    ///
    /// Only verdicts about the decision itself are cached. Low-confidence
    /// guesses are never pinned, and step-level rules are re-evaluated on
    /// every attempt because their inputs (policy, quota) change.
    pub fn caches_refusal(&self) -> bool {
        matches!(self, Self::NoCandidate { .. } | Self::ForbiddenTarget { .. })
    }
}

/// Result of a guardrail check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailVerdict {
    pub allowed: bool,
    pub reason: Option<String>,
    pub violation: Option<Violation>,
}

impl GuardrailVerdict {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            violation: None,
        }
    }

    pub fn deny(violation: Violation) -> Self {
        Self {
            allowed: false,
            reason: Some(violation.reason()),
            violation: Some(violation),
        }
    }
}

/// Step environment the caller knows but the decision does not carry.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckScope<'a> {
    pub page_url: Option<&'a str>,
    pub candidate: Option<&'a ElementCandidate>,
    pub heals_in_scenario: u32,
}

/// Stateless policy evaluator.
#[derive(Debug, Clone)]
pub struct GuardrailChecker {
    min_confidence: f64,
    forbidden_keywords: Vec<ForbiddenPattern>,
    forbidden_urls: Vec<ForbiddenPattern>,
    max_heals_per_scenario: Option<u32>,
}

impl GuardrailChecker {
    /// Build a checker, validating every pattern.
    pub fn new(config: &GuardrailConfig) -> Result<Self, PatternError> {
        Ok(Self {
            min_confidence: config.min_confidence,
            forbidden_keywords: ForbiddenPattern::compile_all(&config.forbidden_keywords)?,
            forbidden_urls: ForbiddenPattern::compile_all(&config.forbidden_url_patterns)?,
            max_heals_per_scenario: config.max_heals_per_scenario,
        })
    }

    pub fn min_confidence(&self) -> f64 {
        self.min_confidence
    }

    /// Decision-independent rules (1-6). Run before any provider call.
    pub fn precheck(
        &self,
        failure: &FailureContext,
        intent: &IntentContract,
        scope: &CheckScope<'_>,
    ) -> GuardrailVerdict {
        match self.step_violation(failure, intent, scope) {
            Some(v) => GuardrailVerdict::deny(v),
            None => GuardrailVerdict::allow(),
        }
    }

    /// Full check of a decision (rules 1-9).
    pub fn check(
        &self,
        decision: &HealDecision,
        failure: &FailureContext,
        intent: &IntentContract,
        scope: &CheckScope<'_>,
    ) -> GuardrailVerdict {
        if let Some(v) = self.step_violation(failure, intent, scope) {
            return GuardrailVerdict::deny(v);
        }

        if !decision.is_healable() {
            let reason = decision
                .refusal_reason
                .clone()
                .unwrap_or_else(|| "provider chose no candidate".to_string());
            return GuardrailVerdict::deny(Violation::NoCandidate { reason });
        }

        if !decision.confidence.is_finite() {
            return GuardrailVerdict::deny(Violation::MalformedConfidence);
        }

        if decision.confidence < self.min_confidence {
            return GuardrailVerdict::deny(Violation::LowConfidence {
                confidence: decision.confidence,
                minimum: self.min_confidence,
            });
        }

        if let Some(candidate) = scope.candidate {
            let target_texts = [candidate.text.as_deref(), Some(candidate.locator.value.as_str())];
            for text in target_texts.into_iter().flatten() {
                if let Some(p) = first_match(&self.forbidden_keywords, text) {
                    return GuardrailVerdict::deny(Violation::ForbiddenTarget {
                        pattern: p.source().to_string(),
                    });
                }
            }
        }

        GuardrailVerdict::allow()
    }

    fn step_violation(
        &self,
        failure: &FailureContext,
        intent: &IntentContract,
        scope: &CheckScope<'_>,
    ) -> Option<Violation> {
        if intent.policy == HealingPolicy::Off {
            return Some(Violation::PolicyOff);
        }

        if intent.is_assertion() || failure.is_assertion_step() {
            return Some(Violation::AssertionStep);
        }

        if intent.is_destructive()
            && !(intent.policy == HealingPolicy::Manual && intent.allow_destructive)
        {
            return Some(Violation::DestructiveAction);
        }

        if let Some(p) = first_match(&self.forbidden_keywords, &failure.step_text) {
            return Some(Violation::ForbiddenStep {
                pattern: p.source().to_string(),
            });
        }

        if let Some(url) = scope.page_url {
            if let Some(p) = first_match(&self.forbidden_urls, url) {
                return Some(Violation::ForbiddenUrl {
                    pattern: p.source().to_string(),
                });
            }
        }

        if let Some(max) = self.max_heals_per_scenario {
            if scope.heals_in_scenario >= max {
                return Some(Violation::QuotaExhausted {
                    used: scope.heals_in_scenario,
                    max,
                });
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActionKind, ElementCandidate, Locator, StepKeyword};
    use proptest::prelude::*;

    fn checker() -> GuardrailChecker {
        GuardrailChecker::new(&GuardrailConfig {
            forbidden_url_patterns: vec!["re:/admin(/|$)".to_string()],
            ..Default::default()
        })
        .unwrap()
    }

    fn failure(step: &str) -> FailureContext {
        FailureContext::new(
            "Checkout",
            "Buy one item",
            step,
            Locator::css("button.buy"),
            "NoSuchElementException",
            "no such element",
        )
    }

    fn click() -> IntentContract {
        IntentContract::for_action(ActionKind::Click)
    }

    #[test]
    fn test_allows_confident_heal() {
        let verdict = checker().check(
            &HealDecision::heal(0, 0.92, "same text"),
            &failure("When I click buy"),
            &click(),
            &CheckScope::default(),
        );
        assert!(verdict.allowed);
        assert!(verdict.reason.is_none());
    }

    #[test]
    fn test_low_confidence_is_refused_and_not_cached() {
        let verdict = checker().check(
            &HealDecision::heal(0, 0.5, "weak"),
            &failure("When I click buy"),
            &click(),
            &CheckScope::default(),
        );
        assert!(!verdict.allowed);
        let violation = verdict.violation.unwrap();
        assert!(matches!(violation, Violation::LowConfidence { .. }));
        assert!(!violation.caches_refusal());
    }

    #[test]
    fn test_nan_confidence_is_malformed() {
        let mut decision = HealDecision::heal(0, 0.9, "x");
        decision.confidence = f64::NAN;
        let verdict = checker().check(
            &decision,
            &failure("When I click buy"),
            &click(),
            &CheckScope::default(),
        );
        assert!(!verdict.allowed);
        let violation = verdict.violation.unwrap();
        assert_eq!(violation, Violation::MalformedConfidence);
        assert!(!violation.caches_refusal());

        assert!(!HealDecision::heal(0, f64::NAN, "x").confidence.is_finite());
    }

    #[test]
    fn test_policy_off_refused() {
        let verdict = checker().precheck(
            &failure("When I click buy"),
            &click().with_policy(HealingPolicy::Off),
            &CheckScope::default(),
        );
        assert_eq!(verdict.violation, Some(Violation::PolicyOff));
    }

    #[test]
    fn test_destructive_needs_manual_override() {
        let c = checker();
        let f = failure("When I remove the item");

        let auto = click().destructive(true);
        assert_eq!(
            c.precheck(&f, &auto, &CheckScope::default()).violation,
            Some(Violation::DestructiveAction)
        );

        let manual_no_override = click().destructive(false).with_policy(HealingPolicy::Manual);
        assert!(!c.precheck(&f, &manual_no_override, &CheckScope::default()).allowed);

        let manual_override = click().destructive(true).with_policy(HealingPolicy::Manual);
        assert!(c.precheck(&f, &manual_override, &CheckScope::default()).allowed);
    }

    #[test]
    fn test_forbidden_step_and_url() {
        let c = checker();
        let verdict = c.precheck(
            &failure("When I confirm the purchase"),
            &click(),
            &CheckScope::default(),
        );
        assert!(matches!(verdict.violation, Some(Violation::ForbiddenStep { .. })));

        let scope = CheckScope {
            page_url: Some("https://shop.test/Admin/users"),
            ..Default::default()
        };
        let verdict = c.precheck(&failure("When I click save"), &click(), &scope);
        assert!(matches!(verdict.violation, Some(Violation::ForbiddenUrl { .. })));
    }

    #[test]
    fn test_quota() {
        let scope = CheckScope {
            heals_in_scenario: 5,
            ..Default::default()
        };
        let verdict = checker().precheck(&failure("When I click buy"), &click(), &scope);
        assert_eq!(
            verdict.violation,
            Some(Violation::QuotaExhausted { used: 5, max: 5 })
        );
    }

    #[test]
    fn test_forbidden_target_is_cacheable() {
        let candidate = ElementCandidate::new(Locator::css("#danger")).with_text("Delete account");
        let scope = CheckScope {
            candidate: Some(&candidate),
            ..Default::default()
        };
        let verdict = checker().check(
            &HealDecision::heal(0, 0.99, "looks right"),
            &failure("When I click settings"),
            &click(),
            &scope,
        );
        let violation = verdict.violation.unwrap();
        assert!(matches!(violation, Violation::ForbiddenTarget { .. }));
        assert!(violation.caches_refusal());
    }

    #[test]
    fn test_provider_refusal_maps_to_no_candidate() {
        let verdict = checker().check(
            &HealDecision::refuse("nothing similar on the page", 0.95),
            &failure("When I click buy"),
            &click(),
            &CheckScope::default(),
        );
        assert!(matches!(verdict.violation, Some(Violation::NoCandidate { .. })));
        assert!(verdict.reason.unwrap().contains("nothing similar"));
    }

    #[test]
    fn test_invalid_pattern_rejected_at_load() {
        let config = GuardrailConfig {
            forbidden_keywords: vec!["re:(a+)+".to_string()],
            ..Default::default()
        };
        assert!(GuardrailChecker::new(&config).is_err());
    }

    proptest! {
        #[test]
        fn prop_assertions_never_healed(confidence in 0.0f64..=1.0, rest in "[a-z ]{0,30}") {
            let c = checker();
            let then_step = failure(&format!("Then {}", rest));
            let verdict = c.check(
                &HealDecision::heal(0, confidence, ""),
                &then_step,
                &click(),
                &CheckScope::default(),
            );
            prop_assert_eq!(verdict.violation, Some(Violation::AssertionStep));

            let and_step = failure(&format!("And {}", rest)).with_keyword(StepKeyword::Then);
            let verdict = c.check(
                &HealDecision::heal(0, 1.0, ""),
                &and_step,
                &IntentContract::for_action(ActionKind::Click),
                &CheckScope::default(),
            );
            prop_assert!(!verdict.allowed);
        }
    }
}
