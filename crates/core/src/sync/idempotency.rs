//! Last-applied revision tracking and the apply decision.

use serde::{Deserialize, Serialize};

use super::Revision;
use crate::entities::EntityKind;

/// Last revision applied for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    pub store_id: String,
    pub kind: EntityKind,
    pub external_id: String,
    pub revision: Revision,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyDecision {
    /// No revision recorded yet.
    Apply,
    /// Candidate is strictly newer than the recorded revision.
    Supersede,
    /// Candidate is older or a true duplicate.
    Reject,
}

impl ApplyDecision {
    pub fn should_write(&self) -> bool {
        !matches!(self, Self::Reject)
    }
}

/// Decides whether `candidate` may overwrite the stored state.
///
/// Rule:
/// 1. later `updated_at` wins
/// 2. on equal timestamps, the lexicographically greater content hash wins
/// 3. identical revisions are duplicates and rejected
pub fn should_apply(stored: Option<&Revision>, candidate: &Revision) -> ApplyDecision {
    match stored {
        None => ApplyDecision::Apply,
        Some(stored) if candidate > stored => ApplyDecision::Supersede,
        Some(_) => ApplyDecision::Reject,
    }
}
