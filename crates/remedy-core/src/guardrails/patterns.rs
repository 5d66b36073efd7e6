//! Forbidden keyword and URL patterns.
//!
//! Patterns are configuration data. Each one is either a plain keyword
//! (case-insensitive substring) or a `re:`-prefixed regular expression.
//! Regexes are vetted at load time: length-capped, compiled under a size
//! limit, and refused when they nest unbounded quantifiers.

use lazy_static::lazy_static;
use regex::{Regex, RegexBuilder};
use thiserror::Error;

/// Prefix marking a pattern as a regular expression.
pub const REGEX_PREFIX: &str = "re:";

/// Longest pattern source accepted.
pub const MAX_PATTERN_LEN: usize = 256;

/// Compiled program size limit per regex (bytes).
const REGEX_SIZE_LIMIT: usize = 64 * 1024;

lazy_static! {
    // A group whose body ends in an unbounded quantifier, itself quantified:
    // (a+)+  (.*)*  (x{2,})+  ([a-z]+){3,}
    static ref NESTED_QUANTIFIER: Regex = Regex::new(
        r"\([^()]*(?:[+*]|\{\d+,\})\)\s*(?:[+*]|\{\d+,\d*\})"
    ).unwrap();

    /// Keywords refused by default: steps touching these are never auto-healed.
    pub static ref DEFAULT_FORBIDDEN_KEYWORDS: Vec<&'static str> = vec![
        "delete account",
        "close account",
        "drop database",
        "payment",
        "wire transfer",
        "purchase",
        "unsubscribe",
    ];
}

/// Errors raised while loading patterns.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PatternError {
    #[error("Empty pattern")]
    Empty,

    #[error("Pattern exceeds {max} characters: {pattern}")]
    TooLong { pattern: String, max: usize },

    #[error("Pattern nests unbounded quantifiers: {pattern}")]
    Pathological { pattern: String },

    #[error("Invalid regex '{pattern}': {message}")]
    InvalidRegex { pattern: String, message: String },
}

#[derive(Debug, Clone)]
enum Matcher {
    Keyword(String),
    Regex(Regex),
}

/// A validated forbidden pattern.
#[derive(Debug, Clone)]
pub struct ForbiddenPattern {
    source: String,
    matcher: Matcher,
}

impl ForbiddenPattern {
    /// Validate and compile a pattern.
    pub fn compile(source: &str) -> Result<Self, PatternError> {
        let trimmed = source.trim();
        if trimmed.is_empty() {
            return Err(PatternError::Empty);
        }
        if trimmed.len() > MAX_PATTERN_LEN {
            return Err(PatternError::TooLong {
                pattern: trimmed.to_string(),
                max: MAX_PATTERN_LEN,
            });
        }

        let matcher = match trimmed.strip_prefix(REGEX_PREFIX) {
            Some(expr) => {
                if expr.trim().is_empty() {
                    return Err(PatternError::Empty);
                }
                if NESTED_QUANTIFIER.is_match(expr) {
                    return Err(PatternError::Pathological {
                        pattern: trimmed.to_string(),
                    });
                }
                let regex = RegexBuilder::new(expr)
                    .case_insensitive(true)
                    .size_limit(REGEX_SIZE_LIMIT)
                    .build()
                    .map_err(|e| PatternError::InvalidRegex {
                        pattern: trimmed.to_string(),
                        message: e.to_string(),
                    })?;
                Matcher::Regex(regex)
            }
            None => Matcher::Keyword(trimmed.to_lowercase()),
        };

        Ok(Self {
            source: trimmed.to_string(),
            matcher,
        })
    }

    /// Compile a list, failing on the first invalid entry.
    pub fn compile_all<S: AsRef<str>>(sources: &[S]) -> Result<Vec<Self>, PatternError> {
        sources.iter().map(|s| Self::compile(s.as_ref())).collect()
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, text: &str) -> bool {
        match &self.matcher {
            Matcher::Keyword(keyword) => text.to_lowercase().contains(keyword.as_str()),
            Matcher::Regex(regex) => regex.is_match(text),
        }
    }
}

/// First pattern matching `text`, if any.
pub fn first_match<'a>(patterns: &'a [ForbiddenPattern], text: &str) -> Option<&'a ForbiddenPattern> {
    patterns.iter().find(|p| p.matches(text))
}
