use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};

use crate::{FailureKind, SourceId};

/// Cached state for a single normalized source.
///
/// Entries are immutable once published. Every transition produces a new
/// entry, so a reader holding an older `Arc<CacheEntry>` never observes a
/// later change and can compare `updated` safely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub source: SourceId,
    /// Last known payload. Kept intact while a refresh is loading.
    pub state: Value,
    pub loading: bool,
    pub error: bool,
    /// Changes on every transition; consumers use it to detect staleness.
    pub updated: DateTime<Utc>,
}

impl CacheEntry {
    /// Entry for a source that has started loading.
    ///
    /// `previous` is carried over so views never blank during a refresh.
    pub fn loading(source: SourceId, previous: Option<&CacheEntry>, updated: DateTime<Utc>) -> Self {
        Self {
            source,
            state: previous
                .map(|entry| entry.state.clone())
                .unwrap_or_else(|| Value::Object(JsonMap::new())),
            loading: true,
            error: false,
            updated,
        }
    }

    pub fn received(source: SourceId, state: Value, updated: DateTime<Utc>) -> Self {
        Self {
            source,
            state,
            loading: false,
            error: false,
            updated,
        }
    }

    /// Copy of this entry flagged as errored. The fetch is over, so the
    /// loading flag is cleared while the last known state is kept.
    pub fn errored(&self, updated: DateTime<Utc>) -> Self {
        Self {
            loading: false,
            error: true,
            updated,
            ..self.clone()
        }
    }

    /// Returns `true` when the entry holds usable data for dependents.
    pub fn is_settled(&self) -> bool {
        !self.loading && !self.error
    }
}

/// A classified failure appended to the cache's error list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub source: SourceId,
    /// User-facing message.
    pub error: String,
    pub kind: FailureKind,
    /// HTTP status when the transport produced one.
    pub status: Option<u16>,
    /// Parsed error body returned by the server, if any.
    pub response: Option<Value>,
}

impl ErrorRecord {
    pub fn new(source: SourceId, kind: FailureKind, status: Option<u16>, response: Option<Value>) -> Self {
        Self {
            source,
            error: kind.message().to_string(),
            kind,
            status,
            response,
        }
    }
}

/// The whole observable cache state: `{ sources, errors }`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub sources: IndexMap<SourceId, Arc<CacheEntry>>,
    pub errors: Vec<ErrorRecord>,
}

impl CacheSnapshot {
    pub fn entry(&self, source: &str) -> Option<&Arc<CacheEntry>> {
        self.sources.get(source)
    }
}
