//! Prompts for model-backed heal providers.
//!
//! The system prompt is static so providers that support prompt caching
//! can reuse it across calls. Only the user message varies per failure.

use std::fmt::Write;

use remedy_core::{FailureContext, IntentContract, UiSnapshot};

/// Upper bound on the page structure excerpt included in a prompt.
pub const MAX_STRUCTURE_CHARS: usize = 8_000;

/// System prompt shared by every heal request.
pub const HEAL_SYSTEM_PROMPT: &str = r#"
You repair broken UI locators in automated browser tests.

A test step failed because its locator no longer matches the page. You are
given the step, the action it intended to perform, the broken locator, and
a numbered list of candidate elements from the current page.

Your job is to CHOOSE one candidate, or refuse. You never invent a locator.

## Rules
1. Choose only from the numbered candidates.
2. The chosen element must perform the same action the step intended.
3. Prefer matching visible text and role over matching position.
4. If no candidate clearly fits, refuse and say why.
5. Never choose an element that would change what a verification step proves.

## Output Format (JSON only)
{
  "candidate_index": 0 | null,
  "confidence": 0.0-1.0,
  "reasoning": "why this element replaces the broken one",
  "refusal_reason": "why no candidate fits" | null
}

Exactly one of candidate_index and refusal_reason must be non-null.

## Confidence Guidelines
- >= 0.9: same label and same role, unambiguous
- 0.7 - 0.9: strong match with minor differences
- < 0.7: plausible but uncertain; say so in reasoning
"#;

/// Render the per-failure user message.
pub fn heal_user_prompt(
    failure: &FailureContext,
    snapshot: &UiSnapshot,
    intent: &IntentContract,
) -> String {
    let mut out = String::new();

    // writeln! into a String cannot fail
    let _ = writeln!(out, "## Failed step");
    let _ = writeln!(out, "Feature: {}", failure.feature);
    let _ = writeln!(out, "Scenario: {}", failure.scenario);
    let _ = writeln!(out, "Step: {}", failure.step_text);
    let _ = writeln!(out, "Broken locator: {}", failure.original_locator);
    let _ = writeln!(
        out,
        "Error: {} ({})",
        failure.exception_kind, failure.exception_message
    );

    let _ = writeln!(out, "\n## Intent");
    let _ = writeln!(out, "Action: {:?}", intent.action);
    if !intent.description.is_empty() {
        let _ = writeln!(out, "Description: {}", intent.description);
    }

    let _ = writeln!(out, "\n## Page");
    let _ = writeln!(out, "URL: {}", snapshot.url);
    if let Some(title) = &snapshot.title {
        let _ = writeln!(out, "Title: {}", title);
    }

    let _ = writeln!(out, "\n## Candidates");
    for (i, candidate) in snapshot.candidates.iter().enumerate() {
        let _ = write!(out, "[{}] {}", i, candidate.locator);
        if let Some(text) = &candidate.text {
            let _ = write!(out, " text={:?}", text);
        }
        for (k, v) in &candidate.attributes {
            let _ = write!(out, " {}={:?}", k, v);
        }
        out.push('\n');
    }

    if !snapshot.structure.is_empty() {
        let _ = writeln!(out, "\n## Structure (excerpt)");
        out.push_str(truncate_chars(&snapshot.structure, MAX_STRUCTURE_CHARS));
        out.push('\n');
    }

    out
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
