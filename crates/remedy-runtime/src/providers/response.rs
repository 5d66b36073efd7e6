//! Parsing and validation of model replies.
//!
//! Models produce a CHOICE, not an action. A reply is accepted only when
//! it is valid JSON, conforms to the embedded schema, and refers to a
//! candidate that exists in the snapshot. Anything else is a malformed
//! response: we never best-effort parse.

use serde::Deserialize;
use std::sync::OnceLock;
use thiserror::Error;

use remedy_core::{HealDecision, UiSnapshot};

/// Embedded reply schema (loaded at compile time).
const DECISION_SCHEMA_JSON: &str = include_str!("../../schema/heal_decision.schema.json");

/// Compiled JSON Schema validator (initialized once, reused).
static COMPILED_SCHEMA: OnceLock<Result<jsonschema::Validator, String>> = OnceLock::new();

/// Errors from reply validation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResponseError {
    #[error("Failed to load reply schema: {0}")]
    SchemaLoad(String),

    #[error("Reply contains no JSON object")]
    NoJson,

    #[error("Reply is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("Reply violates schema: {}", .0.join("; "))]
    SchemaViolation(Vec<String>),

    #[error("Candidate index {index} out of range ({available} candidates)")]
    CandidateOutOfRange { index: usize, available: usize },

    #[error("Reply must name a candidate or give a refusal reason, not {0}")]
    Inconsistent(&'static str),
}

fn validator() -> Result<&'static jsonschema::Validator, ResponseError> {
    let result = COMPILED_SCHEMA.get_or_init(|| {
        let schema: serde_json::Value = serde_json::from_str(DECISION_SCHEMA_JSON)
            .map_err(|e| format!("Invalid schema JSON: {}", e))?;
        jsonschema::options()
            .build(&schema)
            .map_err(|e| format!("Failed to compile schema: {}", e))
    });

    result
        .as_ref()
        .map_err(|e| ResponseError::SchemaLoad(e.clone()))
}

#[derive(Debug, Deserialize)]
struct DecisionReply {
    candidate_index: Option<usize>,
    confidence: f64,
    reasoning: String,
    #[serde(default)]
    refusal_reason: Option<String>,
}

/// Validates a raw model reply against a snapshot.
pub struct DecisionParser<'a> {
    snapshot: &'a UiSnapshot,
}

impl<'a> DecisionParser<'a> {
    pub fn new(snapshot: &'a UiSnapshot) -> Self {
        Self { snapshot }
    }

    /// Parse `raw` into a decision.
    pub fn parse(&self, raw: &str) -> Result<HealDecision, ResponseError> {
        let json = extract_object(raw).ok_or(ResponseError::NoJson)?;
        let value: serde_json::Value =
            serde_json::from_str(json).map_err(|e| ResponseError::InvalidJson(e.to_string()))?;

        let errors: Vec<String> = validator()?
            .iter_errors(&value)
            .map(|e| format!("{} at {}", e, e.instance_path))
            .collect();
        if !errors.is_empty() {
            return Err(ResponseError::SchemaViolation(errors));
        }

        let reply: DecisionReply =
            serde_json::from_value(value).map_err(|e| ResponseError::InvalidJson(e.to_string()))?;

        match (reply.candidate_index, reply.refusal_reason) {
            (Some(index), None) => {
                let available = self.snapshot.candidates.len();
                if index >= available {
                    return Err(ResponseError::CandidateOutOfRange { index, available });
                }
                Ok(HealDecision::heal(index, reply.confidence, reply.reasoning))
            }
            (None, Some(reason)) => {
                let mut decision = HealDecision::refuse(reason, reply.confidence);
                decision.reasoning = reply.reasoning;
                Ok(decision)
            }
            (Some(_), Some(_)) => Err(ResponseError::Inconsistent("both")),
            (None, None) => Err(ResponseError::Inconsistent("neither")),
        }
    }
}

/// The outermost `{...}` span, tolerating code fences and prose around it.
fn extract_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}
