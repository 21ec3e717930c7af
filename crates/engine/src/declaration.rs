//! Consumer-authored source declarations.

use std::{fmt, sync::Arc, time::Duration};

use serde_json::Value;
use sluice_types::{Location, SourceId};

/// Builds the real declaration(s) of a derived source from its dependencies'
/// payloads, passed positionally in `requires` order.
pub type SourceFn = Arc<dyn Fn(&[Value]) -> DeclarationSet + Send + Sync>;

/// Looks up a sibling dependency's cached payload by key.
pub type DataLookup<'a> = dyn Fn(&str) -> Option<Value> + 'a;

/// Reshapes a cached payload before it reaches dependents or local state.
pub type TransformFn = Arc<dyn Fn(Value, &DataLookup<'_>) -> Value + Send + Sync>;

/// Rewrites declarations before resolution, for example to prefix an API root.
pub type SourceTransformer = Arc<dyn Fn(Declaration, &Location) -> Declaration + Send + Sync>;

/// Name under which the keyless dependency is exposed to templates.
pub const DEFAULT_DEPENDENCY: &str = "default";

#[derive(Clone)]
pub enum SourceSpec {
    /// A concrete path or URL.
    Static(String),
    /// Computed from dependencies by a closure.
    Derived(SourceFn),
    /// Computed from dependencies by a `${{ dep.path }}` template.
    Template(String),
}

impl fmt::Debug for SourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(source) => f.debug_tuple("Static").field(source).finish(),
            Self::Derived(_) => f.write_str("Derived(..)"),
            Self::Template(template) => f.debug_tuple("Template").field(template).finish(),
        }
    }
}

/// One entry of a declaration's `requires` list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Requirement {
    /// The declaration with this key.
    Key(String),
    /// The keyless declaration of the same set.
    Default,
}

impl Requirement {
    /// Name used for template lookups.
    pub fn name(&self) -> &str {
        match self {
            Self::Key(key) => key,
            Self::Default => DEFAULT_DEPENDENCY,
        }
    }

    pub(crate) fn matches(&self, key: Option<&str>) -> bool {
        match self {
            Self::Key(wanted) => key == Some(wanted.as_str()),
            Self::Default => key.is_none(),
        }
    }
}

#[derive(Clone)]
pub struct Declaration {
    pub source: SourceSpec,
    /// Dot path in the consumer's local data tree. `None` writes to the root.
    pub key: Option<String>,
    /// Empty for independent declarations.
    pub requires: Vec<Requirement>,
    pub transform: Option<TransformFn>,
    pub refresh: Option<Duration>,
    /// Append the current location's query string to the source.
    pub query: bool,
}

impl fmt::Debug for Declaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Declaration")
            .field("source", &self.source)
            .field("key", &self.key)
            .field("requires", &self.requires)
            .field("transform", &self.transform.as_ref().map(|_| ".."))
            .field("refresh", &self.refresh)
            .field("query", &self.query)
            .finish()
    }
}

impl Declaration {
    fn with_spec(source: SourceSpec) -> Self {
        Self {
            source,
            key: None,
            requires: Vec::new(),
            transform: None,
            refresh: None,
            query: false,
        }
    }

    pub fn new(source: impl Into<String>) -> Self {
        Self::with_spec(SourceSpec::Static(source.into()))
    }

    pub fn derived(source: impl Fn(&[Value]) -> DeclarationSet + Send + Sync + 'static) -> Self {
        Self::with_spec(SourceSpec::Derived(Arc::new(source)))
    }

    pub fn template(template: impl Into<String>) -> Self {
        Self::with_spec(SourceSpec::Template(template.into()))
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn requires(mut self, key: impl Into<String>) -> Self {
        self.requires.push(Requirement::Key(key.into()));
        self
    }

    /// Depend on the keyless declaration of the same set.
    pub fn requires_default(mut self) -> Self {
        self.requires.push(Requirement::Default);
        self
    }

    pub fn transform(mut self, transform: impl Fn(Value, &DataLookup<'_>) -> Value + Send + Sync + 'static) -> Self {
        self.transform = Some(Arc::new(transform));
        self
    }

    pub fn refresh(mut self, interval: Duration) -> Self {
        self.refresh = Some(interval);
        self
    }

    pub fn with_query(mut self) -> Self {
        self.query = true;
        self
    }

    pub fn is_dependent(&self) -> bool {
        !self.requires.is_empty()
    }

    /// The cache key for a concrete declaration.
    pub fn source_id(&self) -> Option<SourceId> {
        match &self.source {
            SourceSpec::Static(source) => Some(SourceId::normalize(source)),
            SourceSpec::Derived(_) | SourceSpec::Template(_) => None,
        }
    }

    /// Apply `transform` to a copy of `payload`.
    pub fn apply_transform(&self, payload: Value, lookup: &DataLookup<'_>) -> Value {
        match &self.transform {
            Some(transform) => transform(payload, lookup),
            None => payload,
        }
    }

    /// Fill in fields a derived declaration's output left unset.
    pub(crate) fn inherit_from(mut self, parent: &Declaration) -> Self {
        if self.key.is_none() {
            self.key = parent.key.clone();
        }
        if self.transform.is_none() {
            self.transform = parent.transform.clone();
        }
        if self.refresh.is_none() {
            self.refresh = parent.refresh;
        }
        self.query |= parent.query;
        self
    }
}

/// Substitute route params, append the location query, then run `transformer`.
///
/// Query appending clears the `query` flag so a declaration is never
/// prepared twice.
pub fn prepare(declaration: Declaration, location: &Location, transformer: Option<&SourceTransformer>) -> Declaration {
    let mut declaration = declaration;
    if let SourceSpec::Static(source) = &declaration.source {
        let mut source = substitute_params(source, location);
        if declaration.query
            && let Some(query) = location.query_string()
        {
            source.push(if source.contains('?') { '&' } else { '?' });
            source.push_str(&query);
        }
        declaration.source = SourceSpec::Static(source);
        declaration.query = false;
    }

    match transformer {
        Some(transformer) => transformer(declaration, location),
        None => declaration,
    }
}

/// Replace `:name` path segments with matching route params.
///
/// ```rust
/// use sluice_engine::declaration::substitute_params;
/// use sluice_types::Location;
///
/// let location = Location::new("/users/42").with_param("id", "42");
/// assert_eq!(substitute_params("/api/users/:id/posts?tab=:id", &location), "/api/users/42/posts?tab=:id");
/// ```
pub fn substitute_params(source: &str, location: &Location) -> String {
    if location.params.is_empty() || !source.contains(':') {
        return source.to_string();
    }
    let (path, query) = match source.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (source, None),
    };

    let path = path
        .split('/')
        .map(|segment| {
            segment
                .strip_prefix(':')
                .and_then(|name| location.params.get(name))
                .map(String::as_str)
                .unwrap_or(segment)
        })
        .collect::<Vec<_>>()
        .join("/");

    match query {
        Some(query) => format!("{path}?{query}"),
        None => path,
    }
}

/// An ordered list of declarations.
///
/// Converts from a single path, a single declaration, or a list, mirroring
/// the shapes a consumer may return.
#[derive(Debug, Clone, Default)]
pub struct DeclarationSet(Vec<Declaration>);

impl DeclarationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, declaration: impl Into<Declaration>) {
        self.0.push(declaration.into());
    }

    pub fn with(mut self, declaration: impl Into<Declaration>) -> Self {
        self.push(declaration);
        self
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Declaration> {
        self.0.iter()
    }

    pub fn into_vec(self) -> Vec<Declaration> {
        self.0
    }
}

impl From<&str> for Declaration {
    fn from(source: &str) -> Self {
        Declaration::new(source)
    }
}

impl From<String> for Declaration {
    fn from(source: String) -> Self {
        Declaration::new(source)
    }
}

impl From<&str> for DeclarationSet {
    fn from(source: &str) -> Self {
        Self(vec![Declaration::new(source)])
    }
}

impl From<String> for DeclarationSet {
    fn from(source: String) -> Self {
        Self(vec![Declaration::new(source)])
    }
}

impl From<Declaration> for DeclarationSet {
    fn from(declaration: Declaration) -> Self {
        Self(vec![declaration])
    }
}

impl<T: Into<Declaration>> From<Vec<T>> for DeclarationSet {
    fn from(declarations: Vec<T>) -> Self {
        Self(declarations.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Declaration>> FromIterator<T> for DeclarationSet {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl IntoIterator for DeclarationSet {
    type Item = Declaration;
    type IntoIter = std::vec::IntoIter<Declaration>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
