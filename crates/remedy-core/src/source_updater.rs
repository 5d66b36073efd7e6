//! Source Updater: writes validated heals back into test source files.
//!
//! Each heal is applied independently. A failure on one heal never blocks
//! the others, and excluded files are reported as skipped.

use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::registry::ValidatedHeal;
use crate::types::SourceLocation;

/// Errors from the source updater.
#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Invalid exclude pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Original locator '{locator}' not found in {path}")]
    LocatorNotFound { path: PathBuf, locator: String },

    #[error("Line {line} out of range in {path}")]
    LineOutOfRange { path: PathBuf, line: u32 },
}

/// Source update configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceUpdateConfig {
    /// Apply validated heals automatically when a run passes.
    pub enabled: bool,

    /// Copy the file to `<file><backup_suffix>` before editing.
    pub create_backup: bool,

    pub backup_suffix: String,

    /// Glob patterns of files never to edit.
    pub exclude: Vec<String>,

    /// Base directory for relative locations.
    pub root: Option<PathBuf>,
}

impl Default for SourceUpdateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            create_backup: true,
            backup_suffix: ".remedy.bak".to_string(),
            exclude: Vec::new(),
            root: None,
        }
    }
}

/// Per-heal result status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UpdateStatus {
    Applied { backup: Option<PathBuf> },
    Skipped { reason: String },
    Failed { error: String },
}

/// Outcome of applying one heal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateResult {
    pub location: SourceLocation,
    pub status: UpdateStatus,
}

impl UpdateResult {
    pub fn is_applied(&self) -> bool {
        matches!(self.status, UpdateStatus::Applied { .. })
    }
}

/// Applies textual locator substitutions to source files.
#[derive(Debug, Clone)]
pub struct SourceUpdater {
    config: SourceUpdateConfig,
    exclude: Vec<Pattern>,
}

impl SourceUpdater {
    pub fn new(config: SourceUpdateConfig) -> Result<Self, UpdateError> {
        let exclude = config
            .exclude
            .iter()
            .map(|p| {
                Pattern::new(p).map_err(|e| UpdateError::InvalidPattern {
                    pattern: p.clone(),
                    message: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { config, exclude })
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Apply every heal, collecting one result per heal.
    pub fn apply_all_validated(&self, heals: &[ValidatedHeal]) -> Vec<UpdateResult> {
        heals
            .iter()
            .map(|heal| {
                let status = self.apply_one(heal);
                match &status {
                    UpdateStatus::Applied { .. } => tracing::info!(
                        location = %heal.location,
                        replacement = %heal.replacement,
                        "Source updated"
                    ),
                    UpdateStatus::Skipped { reason } => {
                        tracing::info!(location = %heal.location, reason = %reason, "Source update skipped")
                    }
                    UpdateStatus::Failed { error } => {
                        tracing::warn!(location = %heal.location, error = %error, "Source update failed")
                    }
                }
                UpdateResult {
                    location: heal.location.clone(),
                    status,
                }
            })
            .collect()
    }

    fn apply_one(&self, heal: &ValidatedHeal) -> UpdateStatus {
        let path = self.resolve(&heal.location.file);

        if let Some(pattern) = self.excluded_by(&heal.location.file) {
            return UpdateStatus::Skipped {
                reason: format!("excluded by pattern '{}'", pattern),
            };
        }

        if heal.original.strategy != heal.replacement.strategy {
            return UpdateStatus::Skipped {
                reason: format!(
                    "locator strategy changed ({} -> {}), edit manually",
                    heal.original.strategy.as_str(),
                    heal.replacement.strategy.as_str()
                ),
            };
        }

        match self.rewrite(&path, heal) {
            Ok(backup) => UpdateStatus::Applied { backup },
            Err(e) => UpdateStatus::Failed {
                error: e.to_string(),
            },
        }
    }

    fn resolve(&self, file: &Path) -> PathBuf {
        match &self.config.root {
            Some(root) if file.is_relative() => root.join(file),
            _ => file.to_path_buf(),
        }
    }

    fn excluded_by(&self, file: &Path) -> Option<&str> {
        self.exclude
            .iter()
            .find(|p| p.matches_path(file))
            .map(|p| p.as_str())
    }

    fn rewrite(&self, path: &Path, heal: &ValidatedHeal) -> Result<Option<PathBuf>, UpdateError> {
        let io_err = |source| UpdateError::Io {
            path: path.to_path_buf(),
            source,
        };

        let content = fs::read_to_string(path).map_err(io_err)?;
        let updated = substitute(&content, heal, path)?;

        let backup = if self.config.create_backup {
            let mut backup = path.as_os_str().to_owned();
            backup.push(&self.config.backup_suffix);
            let backup = PathBuf::from(backup);
            fs::copy(path, &backup).map_err(io_err)?;
            Some(backup)
        } else {
            None
        };

        fs::write(path, updated).map_err(io_err)?;
        Ok(backup)
    }
}

/// Replace the first quoted occurrence of the original locator value,
/// restricted to the heal's line when one is known.
fn substitute(content: &str, heal: &ValidatedHeal, path: &Path) -> Result<String, UpdateError> {
    let original = &heal.original.value;
    let replacement = &heal.replacement.value;
    let not_found = || UpdateError::LocatorNotFound {
        path: path.to_path_buf(),
        locator: original.clone(),
    };

    match heal.location.line {
        Some(line) => {
            let idx = line.checked_sub(1).ok_or(UpdateError::LineOutOfRange {
                path: path.to_path_buf(),
                line,
            })? as usize;

            // split_inclusive keeps line endings intact
            let mut lines: Vec<String> = content.split_inclusive('\n').map(String::from).collect();
            let target = lines.get_mut(idx).ok_or(UpdateError::LineOutOfRange {
                path: path.to_path_buf(),
                line,
            })?;
            *target = replace_quoted(target, original, replacement).ok_or_else(not_found)?;
            Ok(lines.concat())
        }
        None => replace_quoted(content, original, replacement).ok_or_else(not_found),
    }
}

fn replace_quoted(text: &str, original: &str, replacement: &str) -> Option<String> {
    for quote in ['"', '\''] {
        let needle = format!("{quote}{original}{quote}");
        if let Some(pos) = text.find(&needle) {
            let mut out = String::with_capacity(text.len() + replacement.len());
            out.push_str(&text[..pos]);
            out.push(quote);
            out.push_str(replacement);
            out.push(quote);
            out.push_str(&text[pos + needle.len()..]);
            return Some(out);
        }
    }
    None
}
