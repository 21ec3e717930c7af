use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ErrorRecord, SourceId};

/// Actions accepted by the cache store reducer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StoreAction {
    /// A fetch started for `source`.
    Request { source: SourceId },
    /// A payload arrived for `source` (fetched or written directly).
    Receive { source: SourceId, payload: Value },
    /// A classified failure for `record.source`.
    AddError { record: ErrorRecord },
    /// Drop one error record by position.
    RemoveError { index: usize },
    /// Truncate the error list.
    ResetErrors,
    /// Evict a single source.
    RemoveState { source: SourceId },
    /// Clear every source and error.
    ResetStore,
    /// Navigation marker. Changes nothing but is always published.
    Transition,
}

impl StoreAction {
    /// Returns `true` for actions that notify subscribers without a state change.
    pub fn is_marker(&self) -> bool {
        matches!(self, Self::Transition)
    }

    /// The source this action targets, if any.
    pub fn source(&self) -> Option<&SourceId> {
        match self {
            Self::Request { source } | Self::Receive { source, .. } | Self::RemoveState { source } => Some(source),
            Self::AddError { record } => Some(&record.source),
            Self::RemoveError { .. } | Self::ResetErrors | Self::ResetStore | Self::Transition => None,
        }
    }
}
