//! Shared types for the ingestion pipeline.

use serde::{Deserialize, Serialize};

use crate::error::ActionError;
use crate::invoker::InvocationOutcome;
use crate::store::ArtifactRef;

// ── Inbound envelope ────────────────────────────────────────────────

/// A message accepted by the relay, ready for routing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Normalized (lowercase) recipient address.
    pub recipient: String,
    /// Relay-assigned id; becomes the artifact key suffix.
    pub message_id: String,
    /// Raw MIME bytes, untouched.
    #[serde(skip)]
    pub raw: Vec<u8>,
}

// ── Action results ──────────────────────────────────────────────────

/// What a successful action produced.
#[derive(Debug, Clone)]
pub enum ActionOutput {
    Stored(ArtifactRef),
    Invoked(Box<InvocationOutcome>),
}

#[derive(Debug)]
pub enum ActionStatus {
    Completed(ActionOutput),
    Failed(ActionError),
    /// Not run because an earlier action failed.
    Skipped,
}

/// One action's result within a routed chain.
#[derive(Debug)]
pub struct ActionResult {
    pub action: &'static str,
    pub status: ActionStatus,
}

/// Result of routing one envelope through its rule's action chain.
#[derive(Debug)]
pub struct RouteOutcome {
    pub rule: String,
    pub message_id: String,
    pub results: Vec<ActionResult>,
}

impl RouteOutcome {
    /// The stored artifact, if the store action completed.
    pub fn artifact(&self) -> Option<&ArtifactRef> {
        self.results.iter().find_map(|r| match r.status {
            ActionStatus::Completed(ActionOutput::Stored(ref artifact)) => Some(artifact),
            _ => None,
        })
    }

    /// The invocation outcome, if the invoke action completed.
    pub fn invocation(&self) -> Option<&InvocationOutcome> {
        self.results.iter().find_map(|r| match r.status {
            ActionStatus::Completed(ActionOutput::Invoked(ref outcome)) => Some(outcome.as_ref()),
            _ => None,
        })
    }

    /// The first failure in the chain.
    pub fn failure(&self) -> Option<(&'static str, &ActionError)> {
        self.results.iter().find_map(|r| match r.status {
            ActionStatus::Failed(ref e) => Some((r.action, e)),
            _ => None,
        })
    }

    pub fn succeeded(&self) -> bool {
        self.failure().is_none()
    }
}
