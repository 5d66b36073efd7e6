//! Validated Heal Registry.
//!
//! Tracks heals per test run as a small two-phase commit:
//!
//! ```text
//! register_pending ──> PENDING ──run passed, confidence >= threshold──> VALIDATED
//!                         │    ──run passed, below threshold──────────> PENDING (deferred)
//!                         └────run failed─────────────────────────────> DISCARDED
//! ```
//!
//! Pending heals are keyed by (run id, source location); a second heal for
//! the same location within a run replaces the first. Appends from many
//! steps of one run may race; the terminal drain happens once per run.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::source_updater::UpdateResult;
use crate::types::{Locator, SourceLocation};

/// Errors from the registry.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Run already active: {0}")]
    RunAlreadyActive(String),

    #[error("Run not active: {0}")]
    RunNotActive(String),

    #[error("Failed to persist validated heals: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to (de)serialize validated heals: {0}")]
    Json(#[from] serde_json::Error),
}

/// Registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Minimum confidence for promotion to VALIDATED.
    pub auto_update_threshold: f64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            auto_update_threshold: 0.9,
        }
    }
}

/// Lifecycle state of a heal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealState {
    Pending,
    Validated,
    Discarded,
}

/// A repair awaiting the verdict of its test run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingHeal {
    pub run_id: String,
    pub location: SourceLocation,
    pub original: Locator,
    pub replacement: Locator,
    pub confidence: f64,
    pub step_text: String,
    pub registered_at: DateTime<Utc>,
}

impl PendingHeal {
    pub fn new(
        run_id: impl Into<String>,
        location: SourceLocation,
        original: Locator,
        replacement: Locator,
        confidence: f64,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            location,
            original,
            replacement,
            confidence,
            step_text: String::new(),
            registered_at: Utc::now(),
        }
    }

    pub fn with_step_text(mut self, step_text: impl Into<String>) -> Self {
        self.step_text = step_text.into();
        self
    }
}

/// A repair confirmed by a passing run, eligible for source update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedHeal {
    pub run_id: String,
    pub location: SourceLocation,
    pub original: Locator,
    pub replacement: Locator,
    pub confidence: f64,
    pub validated_at: DateTime<Utc>,

    #[serde(default)]
    pub applied_at: Option<DateTime<Utc>>,
}

impl From<PendingHeal> for ValidatedHeal {
    fn from(pending: PendingHeal) -> Self {
        Self {
            run_id: pending.run_id,
            location: pending.location,
            original: pending.original,
            replacement: pending.replacement,
            confidence: pending.confidence,
            validated_at: Utc::now(),
            applied_at: None,
        }
    }
}

/// What happened to a run's heals when it finished.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub passed: bool,
    pub promoted: Vec<ValidatedHeal>,
    pub deferred: usize,
    pub discarded: usize,
    /// Source edits made for the promoted heals, when auto-update is on.
    #[serde(default)]
    pub updates: Vec<UpdateResult>,
}

type RunHeals = BTreeMap<SourceLocation, PendingHeal>;

/// Per-run heal tracking with promotion and discard.
#[derive(Debug, Default)]
pub struct ValidatedHealRegistry {
    config: RegistryConfig,
    runs: Mutex<HashMap<String, RunHeals>>,
    deferred: Mutex<BTreeMap<SourceLocation, PendingHeal>>,
    validated: Mutex<Vec<ValidatedHeal>>,
}

impl ValidatedHealRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            runs: Mutex::new(HashMap::new()),
            deferred: Mutex::new(BTreeMap::new()),
            validated: Mutex::new(Vec::new()),
        }
    }

    /// Open a run.
    pub fn on_run_started(&self, run_id: &str) -> Result<(), RegistryError> {
        let mut runs = self.runs.lock();
        if runs.contains_key(run_id) {
            return Err(RegistryError::RunAlreadyActive(run_id.to_string()));
        }
        runs.insert(run_id.to_string(), RunHeals::new());
        tracing::debug!(run_id, "Run started");
        Ok(())
    }

    /// Record a successful heal for the owning run.
    ///
    /// The run must be active: heals for runs never started, or already
    /// finished, are rejected and not kept.
    pub fn register_pending(&self, heal: PendingHeal) -> Result<(), RegistryError> {
        let mut runs = self.runs.lock();
        let Some(bucket) = runs.get_mut(&heal.run_id) else {
            return Err(RegistryError::RunNotActive(heal.run_id));
        };
        tracing::info!(
            run_id = %heal.run_id,
            location = %heal.location,
            replacement = %heal.replacement,
            confidence = heal.confidence,
            "Pending heal registered"
        );
        bucket.insert(heal.location.clone(), heal);
        Ok(())
    }

    /// Close a run: promote (passed) or discard (failed) its pending heals.
    pub fn on_run_finished(&self, run_id: &str, passed: bool) -> RunSummary {
        let heals = match self.runs.lock().remove(run_id) {
            Some(heals) => heals,
            None => {
                tracing::warn!(run_id, "Finished a run with no registered heals");
                RunHeals::new()
            }
        };

        let mut summary = RunSummary {
            run_id: run_id.to_string(),
            passed,
            ..Default::default()
        };

        if !passed {
            summary.discarded = heals.len();
            if summary.discarded > 0 {
                tracing::info!(run_id, discarded = summary.discarded, "Run failed, pending heals discarded");
            }
            return summary;
        }

        let mut deferred = self.deferred.lock();
        for (location, heal) in heals {
            // A fresh heal for this location supersedes any deferred one
            deferred.remove(&location);
            if heal.confidence >= self.config.auto_update_threshold {
                summary.promoted.push(ValidatedHeal::from(heal));
            } else {
                deferred.insert(location, heal);
                summary.deferred += 1;
            }
        }
        drop(deferred);

        if !summary.promoted.is_empty() {
            self.validated.lock().extend(summary.promoted.iter().cloned());
        }

        tracing::info!(
            run_id,
            promoted = summary.promoted.len(),
            deferred = summary.deferred,
            "Run passed"
        );
        summary
    }

    /// Pending heals of an active run.
    pub fn pending(&self, run_id: &str) -> Vec<PendingHeal> {
        self.runs
            .lock()
            .get(run_id)
            .map(|heals| heals.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Heals from passed runs that stayed pending (below threshold).
    pub fn deferred(&self) -> Vec<PendingHeal> {
        self.deferred.lock().values().cloned().collect()
    }

    /// All validated heals.
    pub fn validated(&self) -> Vec<ValidatedHeal> {
        self.validated.lock().clone()
    }

    /// Validated heals promoted by one run.
    pub fn validated_for_run(&self, run_id: &str) -> Vec<ValidatedHeal> {
        self.validated
            .lock()
            .iter()
            .filter(|h| h.run_id == run_id)
            .cloned()
            .collect()
    }

    /// Stamp `applied_at` on validated heals at the given locations.
    pub fn mark_applied(&self, locations: &[SourceLocation]) {
        let now = Utc::now();
        for heal in self.validated.lock().iter_mut() {
            if locations.contains(&heal.location) {
                heal.applied_at = Some(now);
            }
        }
    }

    /// Write validated heals as JSON.
    pub fn save_validated(&self, path: impl AsRef<Path>) -> Result<(), RegistryError> {
        let json = serde_json::to_string_pretty(&*self.validated.lock())?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Append validated heals from a JSON file. Returns how many were loaded.
    pub fn load_validated(&self, path: impl AsRef<Path>) -> Result<usize, RegistryError> {
        let json = fs::read_to_string(path)?;
        let heals: Vec<ValidatedHeal> = serde_json::from_str(&json)?;
        let count = heals.len();
        self.validated.lock().extend(heals);
        Ok(count)
    }
}
