use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::SourceId;

/// Current navigation location as reported by the routing layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Path without the query string.
    pub path: String,
    /// Route parameters extracted by the router (`:id` -> `42`).
    #[serde(default)]
    pub params: IndexMap<String, String>,
    /// Query string pairs in arrival order.
    #[serde(default)]
    pub query: IndexMap<String, String>,
}

impl Location {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    /// Query pairs rendered as `k=v&k2=v2`, or `None` when empty.
    pub fn query_string(&self) -> Option<String> {
        if self.query.is_empty() {
            return None;
        }
        Some(
            self.query
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect::<Vec<_>>()
                .join("&"),
        )
    }

    /// Normalized path followed by the raw query string.
    pub fn uri(&self) -> String {
        let path = SourceId::normalize(&self.path);
        match self.query_string() {
            Some(query) => format!("{path}?{query}"),
            None => path.to_string(),
        }
    }
}
