//! Data model shared by every stage of a heal attempt.
//!
//! All of these values are immutable once constructed. The caller owns
//! `FailureContext`, `IntentContract` and `UiSnapshot`; the engine only
//! reads them and produces a `HealDecision` and a `HealResult`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::CoreError;

/// Strategy half of a locator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocatorStrategy {
    Id,
    Css,
    XPath,
    Name,
    LinkText,
    Text,
    TestId,
    Role,
    Other,
}

impl LocatorStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::Css => "css",
            Self::XPath => "xpath",
            Self::Name => "name",
            Self::LinkText => "link_text",
            Self::Text => "text",
            Self::TestId => "test_id",
            Self::Role => "role",
            Self::Other => "other",
        }
    }
}

/// A strategy + value pair identifying a UI element.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Locator {
    pub strategy: LocatorStrategy,
    pub value: String,
}

impl Locator {
    pub fn new(strategy: LocatorStrategy, value: impl Into<String>) -> Self {
        Self {
            strategy,
            value: value.into(),
        }
    }

    pub fn css(value: impl Into<String>) -> Self {
        Self::new(LocatorStrategy::Css, value)
    }

    pub fn id(value: impl Into<String>) -> Self {
        Self::new(LocatorStrategy::Id, value)
    }

    pub fn xpath(value: impl Into<String>) -> Self {
        Self::new(LocatorStrategy::XPath, value)
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.strategy.as_str(), self.value)
    }
}

/// Classification of the driver exception that failed the step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    ElementNotFound,
    StaleElement,
    ClickIntercepted,
    NotInteractable,
    Timeout,
    AssertionFailure,
    Unknown,
}

impl FailureKind {
    /// Derive the kind from the exception type name and message.
    ///
    /// The type name wins when it is recognisable; the message is only
    /// consulted for generic exception types.
    pub fn classify(exception_kind: &str, message: &str) -> Self {
        let kind = exception_kind.to_lowercase();
        let message = message.to_lowercase();

        let by_name = Self::from_text(&kind);
        if by_name != Self::Unknown {
            return by_name;
        }
        Self::from_text(&message)
    }

    fn from_text(text: &str) -> Self {
        if text.contains("nosuchelement")
            || text.contains("no such element")
            || text.contains("unable to locate element")
            || text.contains("element not found")
        {
            Self::ElementNotFound
        } else if text.contains("staleelement") || text.contains("stale element") {
            Self::StaleElement
        } else if text.contains("clickintercepted") || text.contains("click intercepted") {
            Self::ClickIntercepted
        } else if text.contains("notinteractable") || text.contains("not interactable") {
            Self::NotInteractable
        } else if text.contains("timeout") || text.contains("timed out") {
            Self::Timeout
        } else if text.contains("assertion") {
            Self::AssertionFailure
        } else {
            Self::Unknown
        }
    }

    /// Whether a different locator could plausibly fix this failure.
    pub fn is_locator_failure(&self) -> bool {
        matches!(
            self,
            Self::ElementNotFound
                | Self::StaleElement
                | Self::ClickIntercepted
                | Self::NotInteractable
                | Self::Timeout
        )
    }
}

/// Gherkin keyword of the failing step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKeyword {
    Given,
    When,
    Then,
    And,
    But,
}

impl StepKeyword {
    /// Parse the leading keyword of a step, if any.
    pub fn parse_leading(step_text: &str) -> Option<Self> {
        let first = step_text.split_whitespace().next()?;
        match first.to_lowercase().as_str() {
            "given" => Some(Self::Given),
            "when" => Some(Self::When),
            "then" => Some(Self::Then),
            "and" => Some(Self::And),
            "but" => Some(Self::But),
            _ => None,
        }
    }
}

/// Context of one failed step, built by the framework binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureContext {
    pub feature: String,
    pub scenario: String,
    pub step_text: String,

    /// Effective keyword. `And`/`But` steps should carry the keyword they
    /// continue; when absent it is parsed from `step_text`.
    #[serde(default)]
    pub keyword: Option<StepKeyword>,

    #[serde(default)]
    pub tags: Vec<String>,

    pub original_locator: Locator,
    pub exception_kind: String,
    pub exception_message: String,
    pub kind: FailureKind,
}

impl FailureContext {
    pub fn new(
        feature: impl Into<String>,
        scenario: impl Into<String>,
        step_text: impl Into<String>,
        original_locator: Locator,
        exception_kind: impl Into<String>,
        exception_message: impl Into<String>,
    ) -> Self {
        let exception_kind = exception_kind.into();
        let exception_message = exception_message.into();
        let kind = FailureKind::classify(&exception_kind, &exception_message);
        Self {
            feature: feature.into(),
            scenario: scenario.into(),
            step_text: step_text.into(),
            keyword: None,
            tags: Vec::new(),
            original_locator,
            exception_kind,
            exception_message,
            kind,
        }
    }

    pub fn with_keyword(mut self, keyword: StepKeyword) -> Self {
        self.keyword = Some(keyword);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn effective_keyword(&self) -> Option<StepKeyword> {
        self.keyword
            .or_else(|| StepKeyword::parse_leading(&self.step_text))
    }

    /// True for `Then`-style verification steps.
    pub fn is_assertion_step(&self) -> bool {
        self.effective_keyword() == Some(StepKeyword::Then)
    }
}

/// Kind of action the failing step was performing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Click,
    Type,
    Select,
    Hover,
    Submit,
    Read,
    Assert,
    Other,
}

impl ActionKind {
    /// Destructive-action detector.
    ///
    /// Not yet implemented: always returns `false`. Destructiveness is
    /// taken only from [`IntentContract::destructive`] until a detector
    /// that inspects the target element exists.
    pub fn detected_destructive(&self) -> bool {
        false
    }
}

/// How much autonomy healing has for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealingPolicy {
    #[default]
    AutoSafe,
    Manual,
    Off,
}

/// A caller-declared predicate over post-action state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvariantCheck {
    pub name: String,
    pub description: String,
}

impl InvariantCheck {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// What the step is trying to do, and how far healing may go.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentContract {
    pub action: ActionKind,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub policy: HealingPolicy,

    #[serde(default)]
    pub destructive: bool,

    /// Explicit override for destructive steps; honoured only under
    /// [`HealingPolicy::Manual`].
    #[serde(default)]
    pub allow_destructive: bool,

    #[serde(default)]
    pub outcome_check: Option<String>,

    #[serde(default)]
    pub invariants: Vec<InvariantCheck>,

    /// Value handed to the executor (text to type, option to select).
    #[serde(default)]
    pub payload: Option<String>,
}

impl IntentContract {
    /// Default intent used when the caller supplies none.
    pub fn for_action(action: ActionKind) -> Self {
        Self {
            action,
            description: String::new(),
            policy: HealingPolicy::AutoSafe,
            destructive: false,
            allow_destructive: false,
            outcome_check: None,
            invariants: Vec::new(),
            payload: None,
        }
    }

    pub fn with_policy(mut self, policy: HealingPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn with_outcome_check(mut self, check: impl Into<String>) -> Self {
        self.outcome_check = Some(check.into());
        self
    }

    pub fn with_invariant(mut self, invariant: InvariantCheck) -> Self {
        self.invariants.push(invariant);
        self
    }

    pub fn destructive(mut self, allow: bool) -> Self {
        self.destructive = true;
        self.allow_destructive = allow;
        self
    }

    pub fn is_destructive(&self) -> bool {
        self.destructive || self.action.detected_destructive()
    }

    pub fn is_assertion(&self) -> bool {
        self.action == ActionKind::Assert
    }

    /// Whether post-action validation has anything to evaluate.
    pub fn requires_validation(&self) -> bool {
        self.outcome_check.is_some() || !self.invariants.is_empty()
    }

    /// Parse an intent from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, CoreError> {
        Ok(serde_yaml::from_str(yaml)?)
    }
}

/// On-screen geometry of a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// One element the repair may retarget to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementCandidate {
    pub locator: Locator,

    #[serde(default)]
    pub text: Option<String>,

    #[serde(default)]
    pub bounds: Option<BoundingBox>,

    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl ElementCandidate {
    pub fn new(locator: Locator) -> Self {
        Self {
            locator,
            text: None,
            bounds: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Structural capture of the page at failure time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiSnapshot {
    pub url: String,

    #[serde(default)]
    pub title: Option<String>,

    /// Serialized DOM or accessibility tree.
    #[serde(default)]
    pub structure: String,

    /// Ranked candidates, best first.
    #[serde(default)]
    pub candidates: Vec<ElementCandidate>,

    pub captured_at: DateTime<Utc>,
}

impl UiSnapshot {
    pub fn new(url: impl Into<String>, candidates: Vec<ElementCandidate>) -> Self {
        Self {
            url: url.into(),
            title: None,
            structure: String::new(),
            candidates,
            captured_at: Utc::now(),
        }
    }

    pub fn with_structure(mut self, structure: impl Into<String>) -> Self {
        self.structure = structure.into();
        self
    }

    pub fn candidate(&self, index: usize) -> Option<&ElementCandidate> {
        self.candidates.get(index)
    }

    pub fn find(&self, locator: &Locator) -> Option<&ElementCandidate> {
        self.candidates.iter().find(|c| c.locator == *locator)
    }

    /// Parse a snapshot serialized by the capture side.
    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// A provider's answer for one failure.
///
/// `refusal_reason` is present exactly when the decision is not healable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealDecision {
    pub confidence: f64,
    pub candidate_index: Option<usize>,
    pub reasoning: String,
    pub refusal_reason: Option<String>,

    #[serde(default)]
    pub estimated_tokens: u32,

    #[serde(default)]
    pub estimated_cost_usd: f64,

    /// Name of the provider binding that produced the decision.
    #[serde(default)]
    pub provider: String,

    /// Locator of the chosen candidate, recorded when the decision is cached
    /// so a replay finds the same element on a differently ordered page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chosen_locator: Option<Locator>,
}

impl HealDecision {
    /// A healable decision selecting `candidate_index`.
    pub fn heal(candidate_index: usize, confidence: f64, reasoning: impl Into<String>) -> Self {
        Self {
            confidence: confidence.clamp(0.0, 1.0),
            candidate_index: Some(candidate_index),
            reasoning: reasoning.into(),
            refusal_reason: None,
            estimated_tokens: 0,
            estimated_cost_usd: 0.0,
            provider: String::new(),
            chosen_locator: None,
        }
    }

    /// A decision declining to pick any candidate.
    pub fn refuse(reason: impl Into<String>, confidence: f64) -> Self {
        let reason = reason.into();
        Self {
            confidence: confidence.clamp(0.0, 1.0),
            candidate_index: None,
            reasoning: reason.clone(),
            refusal_reason: Some(reason),
            estimated_tokens: 0,
            estimated_cost_usd: 0.0,
            provider: String::new(),
            chosen_locator: None,
        }
    }

    pub fn with_cost(mut self, tokens: u32, cost_usd: f64) -> Self {
        self.estimated_tokens = tokens;
        self.estimated_cost_usd = cost_usd;
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    pub fn with_chosen_locator(mut self, locator: Locator) -> Self {
        self.chosen_locator = Some(locator);
        self
    }

    pub fn is_healable(&self) -> bool {
        self.refusal_reason.is_none() && self.candidate_index.is_some()
    }

    /// The chosen element on `snapshot`: by recorded locator when there is
    /// one, otherwise by index.
    pub fn target_in<'a>(&self, snapshot: &'a UiSnapshot) -> Option<&'a ElementCandidate> {
        match (&self.chosen_locator, self.candidate_index) {
            (Some(locator), _) => snapshot.find(locator),
            (None, Some(index)) => snapshot.candidate(index),
            (None, None) => None,
        }
    }
}

/// Terminal outcome of a heal attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealOutcome {
    Success,
    Refused,
    Failed,
}

impl fmt::Display for HealOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::Refused => write!(f, "REFUSED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Value returned to the framework binding. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealResult {
    pub outcome: HealOutcome,
    pub confidence: f64,
    pub healed_locator: Option<Locator>,
    pub reason: Option<String>,
    pub elapsed: Duration,
    pub from_cache: bool,
}

impl HealResult {
    pub fn success(confidence: f64, healed_locator: Locator, elapsed: Duration, from_cache: bool) -> Self {
        Self {
            outcome: HealOutcome::Success,
            confidence,
            healed_locator: Some(healed_locator),
            reason: None,
            elapsed,
            from_cache,
        }
    }

    pub fn refused(reason: impl Into<String>, confidence: f64, elapsed: Duration, from_cache: bool) -> Self {
        Self {
            outcome: HealOutcome::Refused,
            confidence,
            healed_locator: None,
            reason: Some(reason.into()),
            elapsed,
            from_cache,
        }
    }

    pub fn failed(reason: impl Into<String>, confidence: f64, elapsed: Duration, from_cache: bool) -> Self {
        Self {
            outcome: HealOutcome::Failed,
            confidence,
            healed_locator: None,
            reason: Some(reason.into()),
            elapsed,
            from_cache,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == HealOutcome::Success
    }
}

/// Where in test source code the failing locator lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: PathBuf,

    #[serde(default)]
    pub line: Option<u32>,

    #[serde(default)]
    pub method: Option<String>,
}

impl SourceLocation {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            line: None,
            method: None,
        }
    }

    pub fn at_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    pub fn in_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.file.display())?;
        if let Some(line) = self.line {
            write!(f, ":{}", line)?;
        }
        if let Some(method) = &self.method {
            write!(f, " ({})", method)?;
        }
        Ok(())
    }
}

/// Per-step context passed explicitly through the call chain.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StepContext {
    pub run_id: String,

    /// Heals already performed in the current scenario (caller's counter).
    #[serde(default)]
    pub heals_in_scenario: u32,

    #[serde(default)]
    pub source: Option<SourceLocation>,
}

impl StepContext {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            heals_in_scenario: 0,
            source: None,
        }
    }

    pub fn with_heals_in_scenario(mut self, count: u32) -> Self {
        self.heals_in_scenario = count;
        self
    }

    pub fn with_source(mut self, source: SourceLocation) -> Self {
        self.source = Some(source);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_by_exception_name() {
        assert_eq!(
            FailureKind::classify("NoSuchElementException", ""),
            FailureKind::ElementNotFound
        );
        assert_eq!(
            FailureKind::classify("StaleElementReferenceException", ""),
            FailureKind::StaleElement
        );
        assert_eq!(
            FailureKind::classify("ElementClickInterceptedException", ""),
            FailureKind::ClickIntercepted
        );
        assert_eq!(
            FailureKind::classify("ElementNotInteractableException", ""),
            FailureKind::NotInteractable
        );
        assert_eq!(
            FailureKind::classify("TimeoutException", ""),
            FailureKind::Timeout
        );
        assert_eq!(
            FailureKind::classify("AssertionError", ""),
            FailureKind::AssertionFailure
        );
    }

    #[test]
    fn test_classify_falls_back_to_message() {
        assert_eq!(
            FailureKind::classify("WebDriverException", "no such element: Unable to locate element"),
            FailureKind::ElementNotFound
        );
        assert_eq!(
            FailureKind::classify("RuntimeError", "something odd"),
            FailureKind::Unknown
        );
    }

    #[test]
    fn test_locator_failures() {
        assert!(FailureKind::ElementNotFound.is_locator_failure());
        assert!(FailureKind::Timeout.is_locator_failure());
        assert!(!FailureKind::AssertionFailure.is_locator_failure());
        assert!(!FailureKind::Unknown.is_locator_failure());
    }

    #[test]
    fn test_assertion_step_detection() {
        let locator = Locator::css("#total");
        let then = FailureContext::new("f", "s", "Then the total is 5", locator.clone(), "", "");
        assert!(then.is_assertion_step());

        let when = FailureContext::new("f", "s", "When I click buy", locator.clone(), "", "");
        assert!(!when.is_assertion_step());

        // `And` continuing a `Then` carries the effective keyword
        let and = FailureContext::new("f", "s", "And the badge shows 1", locator, "", "")
            .with_keyword(StepKeyword::Then);
        assert!(and.is_assertion_step());
    }

    #[test]
    fn test_decision_refusal_invariant() {
        let heal = HealDecision::heal(2, 0.9, "best text match");
        assert!(heal.is_healable());
        assert!(heal.refusal_reason.is_none());

        let refuse = HealDecision::refuse("no candidate resembles the target", 0.1);
        assert!(!refuse.is_healable());
        assert!(refuse.refusal_reason.is_some());
    }

    #[test]
    fn test_recorded_locator_wins_over_index() {
        let sign_in = ElementCandidate::new(Locator::id("sign-in"));
        let help = ElementCandidate::new(Locator::css("a.help"));
        let first = UiSnapshot::new("https://app.test/login", vec![sign_in.clone(), help.clone()]);
        let reordered = UiSnapshot::new("https://app.test/login", vec![help, sign_in]);

        let decision = HealDecision::heal(0, 0.9, "label match");
        assert_eq!(decision.target_in(&reordered).unwrap().locator, Locator::css("a.help"));

        let pinned = decision.with_chosen_locator(Locator::id("sign-in"));
        assert_eq!(pinned.target_in(&first).unwrap().locator, Locator::id("sign-in"));
        assert_eq!(pinned.target_in(&reordered).unwrap().locator, Locator::id("sign-in"));

        let gone = UiSnapshot::new("https://app.test/login", vec![]);
        assert!(pinned.target_in(&gone).is_none());
    }

    #[test]
    fn test_confidence_is_clamped() {
        assert_eq!(HealDecision::heal(0, 1.7, "").confidence, 1.0);
        assert_eq!(HealDecision::refuse("x", -0.2).confidence, 0.0);
    }

    #[test]
    fn test_intent_from_yaml() {
        let yaml = r#"
action: click
description: "Submit the order"
policy: manual
destructive: true
allow_destructive: true
invariants:
  - name: "cart_empty"
    description: "Cart badge shows zero"
"#;
        let intent = IntentContract::from_yaml(yaml).unwrap();
        assert_eq!(intent.action, ActionKind::Click);
        assert_eq!(intent.policy, HealingPolicy::Manual);
        assert!(intent.is_destructive());
        assert!(intent.requires_validation());
    }

    #[test]
    fn test_destructive_detector_is_inert() {
        for action in [ActionKind::Click, ActionKind::Submit, ActionKind::Type] {
            assert!(!action.detected_destructive());
        }
    }

    #[test]
    fn test_snapshot_from_json() {
        let json = r##"{
            "url": "https://shop.test/p/1",
            "captured_at": "2026-01-05T10:00:00Z",
            "candidates": [
                {"locator": {"strategy": "css", "value": "#buy-now"}, "text": "Buy now"}
            ]
        }"##;
        let snapshot = UiSnapshot::from_json(json).unwrap();
        assert_eq!(snapshot.candidates.len(), 1);
        assert_eq!(snapshot.candidate(0).unwrap().locator, Locator::css("#buy-now"));
        assert!(snapshot.candidate(1).is_none());
    }

    #[test]
    fn test_source_location_display() {
        let loc = SourceLocation::new("tests/login.rs").at_line(42).in_method("login_works");
        assert_eq!(loc.to_string(), "tests/login.rs:42 (login_works)");
    }
}
