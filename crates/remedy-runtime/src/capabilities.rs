//! Capabilities the engine borrows from the browser side.
//!
//! Each is a named interface with one implementation per driver family.
//! Errors are `anyhow` because they belong to the collaborating subsystem;
//! the engine only turns them into a FAILED outcome with the message as
//! reason.

use async_trait::async_trait;

use remedy_core::{ActionKind, ElementCandidate, FailureContext, IntentContract, UiSnapshot};

/// Performs the step's action against the chosen element.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(
        &self,
        action: ActionKind,
        target: &ElementCandidate,
        payload: Option<&str>,
    ) -> anyhow::Result<()>;
}

/// Checks the post-action page against the intent's outcome check and
/// invariants. `Ok(false)` means the heal did not achieve the intent.
#[async_trait]
pub trait OutcomeValidator: Send + Sync {
    async fn validate(
        &self,
        intent: &IntentContract,
        target: &ElementCandidate,
    ) -> anyhow::Result<bool>;
}

/// Captures the current page for a failure.
#[async_trait]
pub trait SnapshotCapture: Send + Sync {
    async fn capture(&self, failure: &FailureContext) -> anyhow::Result<UiSnapshot>;
}
