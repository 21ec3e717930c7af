//! Expansion of declaration sets into concrete sources.
//!
//! Dependent declarations are expanded only when every dependency has a
//! settled cache entry; otherwise they are dropped for this pass and picked
//! up by a later pass once the store publishes the dependency's payload.
//! Expansion is recursive because a derived source may itself produce
//! dependent declarations.

use std::{collections::HashSet, sync::Arc};

use indexmap::IndexSet;
use serde_json::Value;
use sluice_types::{Location, SourceId};
use tracing::{debug, warn};

use crate::{
    declaration::{Declaration, DeclarationSet, SourceFn, SourceSpec, SourceTransformer, prepare},
    store::CacheStore,
    templates::render_template,
};

/// Nesting limit for derived sources that keep producing new closures.
pub const MAX_EXPANSION_DEPTH: usize = 32;

/// Output of one resolution pass.
#[derive(Debug, Default, Clone)]
pub struct Resolution {
    pub declarations: Vec<Declaration>,
    /// Concrete sources produced by expanding dependent declarations.
    pub discovered: Vec<SourceId>,
}

impl Resolution {
    /// Distinct concrete sources, in declaration order.
    pub fn sources(&self) -> IndexSet<SourceId> {
        self.declarations.iter().filter_map(Declaration::source_id).collect()
    }

    pub fn discovered(&self) -> IndexSet<SourceId> {
        self.discovered.iter().cloned().collect()
    }
}

/// Identity of one expansion: which declaration, fed by which sources.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ExpansionKey {
    origin: String,
    key: Option<String>,
    dependencies: Vec<SourceId>,
}

/// Expansions already performed during one resolution pass.
///
/// Derived sources are identified by the address of their closure, so every
/// closure seen is retained until the pass ends. Otherwise a closure dropped
/// with a finished branch could hand its address to an unrelated sibling.
#[derive(Default)]
struct ExpansionGuard {
    visited: HashSet<ExpansionKey>,
    retained: Vec<SourceFn>,
}

impl ExpansionGuard {
    /// Returns `false` when this expansion was already performed.
    fn enter(&mut self, declaration: &Declaration, dependencies: &[Dependency]) -> bool {
        let origin = match &declaration.source {
            SourceSpec::Derived(source) => {
                self.retained.push(Arc::clone(source));
                format!("fn:{:p}", Arc::as_ptr(source))
            }
            SourceSpec::Template(template) => format!("template:{template}"),
            SourceSpec::Static(source) => format!("static:{source}"),
        };
        self.visited.insert(ExpansionKey {
            origin,
            key: declaration.key.clone(),
            dependencies: dependencies.iter().map(|dependency| dependency.source.clone()).collect(),
        })
    }
}

struct Dependency {
    name: String,
    source: SourceId,
    payload: Value,
}

/// Resolves declaration sets against the current cache contents.
pub struct Resolver<'a> {
    store: &'a CacheStore,
    location: &'a Location,
    transformer: Option<&'a SourceTransformer>,
}

impl<'a> Resolver<'a> {
    pub fn new(store: &'a CacheStore, location: &'a Location) -> Self {
        Self {
            store,
            location,
            transformer: None,
        }
    }

    pub fn with_transformer(mut self, transformer: Option<&'a SourceTransformer>) -> Self {
        self.transformer = transformer;
        self
    }

    /// Expand `declarations` as far as the cache currently allows.
    ///
    /// Never blocks and never fetches; callers load
    /// [`Resolution::discovered`] themselves.
    pub fn resolve(&self, declarations: impl Into<DeclarationSet>) -> Resolution {
        let mut guard = ExpansionGuard::default();
        let mut discovered = Vec::new();
        let declarations = self.expand(declarations.into(), &[], &mut guard, 0, &mut discovered);
        Resolution { declarations, discovered }
    }

    fn expand(
        &self,
        raw: DeclarationSet,
        resolved: &[Declaration],
        guard: &mut ExpansionGuard,
        depth: usize,
        discovered: &mut Vec<SourceId>,
    ) -> Vec<Declaration> {
        let prepared: Vec<Declaration> = raw
            .into_iter()
            .map(|declaration| prepare(declaration, self.location, self.transformer))
            .collect();

        let mut output = Vec::new();
        let mut expansions: Vec<Declaration> = Vec::new();

        for declaration in &prepared {
            let is_static = matches!(declaration.source, SourceSpec::Static(_));
            if is_static && !declaration.is_dependent() {
                output.push(declaration.clone());
                continue;
            }

            let dependencies = {
                let scope: Vec<&Declaration> = prepared.iter().chain(resolved.iter()).chain(expansions.iter()).collect();
                match self.dependencies(declaration, &scope) {
                    Some(dependencies) => dependencies,
                    None => continue,
                }
            };

            if is_static {
                // Gated on dependencies but nothing to compute.
                discovered.extend(declaration.source_id());
                expansions.push(declaration.clone());
                continue;
            }

            if depth >= MAX_EXPANSION_DEPTH {
                warn!(key = ?declaration.key, depth, "derived source expansion exceeded depth limit");
                continue;
            }
            if !guard.enter(declaration, &dependencies) {
                warn!(key = ?declaration.key, "derived source expansion revisited itself; skipping cycle");
                continue;
            }

            let Some(produced) = self.produce(declaration, &dependencies) else {
                continue;
            };
            let produced: DeclarationSet = produced.into_iter().map(|child| child.inherit_from(declaration)).collect();

            let mut nested_scope: Vec<Declaration> = resolved.to_vec();
            nested_scope.extend(prepared.iter().cloned());
            nested_scope.extend(expansions.iter().cloned());
            let nested = self.expand(produced, &nested_scope, guard, depth + 1, discovered);

            discovered.extend(nested.iter().filter_map(Declaration::source_id));
            expansions.extend(nested);
        }

        output.extend(expansions);
        output
    }

    /// Collect the payloads `declaration` requires, or `None` if any is not ready.
    fn dependencies(&self, declaration: &Declaration, scope: &[&Declaration]) -> Option<Vec<Dependency>> {
        let lookup = |key: &str| -> Option<Value> {
            let source = find_concrete(scope, |candidate| candidate.key.as_deref() == Some(key))?.source_id()?;
            self.store.entry(source.as_str()).map(|entry| entry.state.clone())
        };

        let mut dependencies = Vec::with_capacity(declaration.requires.len());
        for requirement in &declaration.requires {
            let Some(matched) = find_concrete(scope, |candidate| requirement.matches(candidate.key.as_deref())) else {
                debug!(requirement = requirement.name(), key = ?declaration.key, "dependency not declared");
                return None;
            };
            let source = matched.source_id()?;
            let Some(entry) = self.store.entry(source.as_str()) else {
                debug!(source = %source, key = ?declaration.key, "dependency not cached yet");
                return None;
            };
            if !entry.is_settled() {
                debug!(source = %source, loading = entry.loading, error = entry.error, "dependency not settled");
                return None;
            }
            dependencies.push(Dependency {
                name: requirement.name().to_string(),
                payload: matched.apply_transform(entry.state.clone(), &lookup),
                source,
            });
        }
        Some(dependencies)
    }

    fn produce(&self, declaration: &Declaration, dependencies: &[Dependency]) -> Option<DeclarationSet> {
        match &declaration.source {
            SourceSpec::Derived(source) => {
                let payloads: Vec<Value> = dependencies.iter().map(|dependency| dependency.payload.clone()).collect();
                Some(source(&payloads))
            }
            SourceSpec::Template(template) => {
                let lookup = |name: &str| {
                    dependencies
                        .iter()
                        .find(|dependency| dependency.name == name)
                        .map(|dependency| dependency.payload.clone())
                };
                match render_template(template, &lookup) {
                    Ok(source) => Some(DeclarationSet::from(source)),
                    Err(error) => {
                        debug!(template = %template, error = %error, "template source not resolvable yet");
                        None
                    }
                }
            }
            SourceSpec::Static(_) => None,
        }
    }
}

/// First declaration in `scope` that has a concrete source and satisfies `predicate`.
fn find_concrete<'d>(scope: &[&'d Declaration], predicate: impl Fn(&Declaration) -> bool) -> Option<&'d Declaration> {
    scope
        .iter()
        .copied()
        .find(|candidate| matches!(candidate.source, SourceSpec::Static(_)) && predicate(*candidate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sluice_types::StoreAction;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn keys(resolution: &Resolution) -> Vec<Option<String>> {
        resolution.declarations.iter().map(|declaration| declaration.key.clone()).collect()
    }

    fn user_posts() -> DeclarationSet {
        DeclarationSet::from(vec![
            Declaration::new("/api/user").key("user"),
            Declaration::derived(|deps: &[Value]| DeclarationSet::from(format!("/api/user/{}/posts", deps[0]["id"])))
                .requires("user")
                .key("user.posts"),
        ])
    }

    #[test]
    fn dependent_waits_for_loading_dependency() {
        let store = CacheStore::new();
        let location = Location::default();
        let resolver = Resolver::new(&store, &location);

        let resolution = resolver.resolve(user_posts());
        assert_eq!(keys(&resolution), vec![Some("user".to_string())]);

        store.dispatch(StoreAction::Request {
            source: SourceId::normalize("/api/user"),
        });
        assert_eq!(resolver.resolve(user_posts()).declarations.len(), 1);

        store.set_entry(SourceId::normalize("/api/user"), json!({ "id": 5 }));
        let resolution = resolver.resolve(user_posts());
        assert_eq!(keys(&resolution), vec![Some("user".to_string()), Some("user.posts".to_string())]);
        assert_eq!(resolution.declarations[1].source_id().unwrap().as_str(), "api/user/5/posts");
        assert_eq!(resolution.discovered().len(), 1);
    }

    #[test]
    fn errored_dependency_drops_dependent() {
        let store = CacheStore::new();
        let source = SourceId::normalize("/api/user");
        store.set_entry(source.clone(), json!({ "id": 5 }));
        store.dispatch(StoreAction::AddError {
            record: sluice_types::ErrorRecord::new(source, sluice_types::FailureKind::ServerError, Some(500), None),
        });
        let location = Location::default();
        assert_eq!(Resolver::new(&store, &location).resolve(user_posts()).declarations.len(), 1);
    }

    #[test]
    fn unmatched_requirement_drops_dependent() {
        let store = CacheStore::new();
        let location = Location::default();
        let set = DeclarationSet::from(Declaration::derived(|_: &[Value]| DeclarationSet::from("/x")).requires("nobody"));
        assert!(Resolver::new(&store, &location).resolve(set).declarations.is_empty());
    }

    #[test]
    fn default_requirement_matches_keyless_declaration_and_transform_applies() {
        let store = CacheStore::new();
        store.set_entry(SourceId::normalize("/api/session"), json!({ "account": { "id": "acc-1" } }));
        let location = Location::default();
        let set = DeclarationSet::from(vec![
            Declaration::new("/api/session").transform(|value, _| value["account"].clone()),
            Declaration::derived(|deps: &[Value]| DeclarationSet::from(format!("/api/accounts/{}", deps[0]["id"].as_str().unwrap_or_default())))
                .requires_default()
                .key("account"),
        ]);
        let resolution = Resolver::new(&store, &location).resolve(set);
        assert_eq!(resolution.declarations[1].source_id().unwrap().as_str(), "api/accounts/acc-1");
        // Transforms work on copies.
        assert_eq!(store.entry("api/session").unwrap().state, json!({ "account": { "id": "acc-1" } }));
    }

    #[test]
    fn nested_dependents_see_earlier_expansions() {
        let store = CacheStore::new();
        store.set_entry(SourceId::normalize("/api/user"), json!({ "id": 1, "org": "acme" }));
        store.set_entry(SourceId::normalize("/api/orgs/acme"), json!({ "plan": "pro" }));
        let location = Location::default();

        let set = DeclarationSet::from(vec![
            Declaration::new("/api/user").key("user"),
            Declaration::derived(|deps: &[Value]| {
                let org = deps[0]["org"].as_str().unwrap_or_default().to_string();
                DeclarationSet::from(vec![
                    Declaration::new(format!("/api/orgs/{org}")).key("org"),
                    Declaration::derived(|deps: &[Value]| {
                        DeclarationSet::from(format!("/api/plans/{}", deps[0]["plan"].as_str().unwrap_or_default()))
                    })
                    .requires("org")
                    .key("plan"),
                ])
            })
            .requires("user"),
        ]);

        let resolution = Resolver::new(&store, &location).resolve(set);
        let sources: Vec<String> = resolution.sources().iter().map(ToString::to_string).collect();
        assert_eq!(sources, vec!["api/user", "api/orgs/acme", "api/plans/pro"]);
    }

    #[test]
    fn template_sources_render_against_dependencies() {
        let store = CacheStore::new();
        store.set_entry(SourceId::normalize("/api/user"), json!({ "id": 9 }));
        let location = Location::default();
        let set = DeclarationSet::from(vec![
            Declaration::new("/api/user").key("user"),
            Declaration::template("/api/user/${{ user.id }}/posts").requires("user").key("user.posts"),
        ]);
        let resolution = Resolver::new(&store, &location).resolve(set);
        assert_eq!(resolution.declarations[1].source_id().unwrap().as_str(), "api/user/9/posts");
        assert_eq!(resolution.declarations[1].key.as_deref(), Some("user.posts"));
    }

    #[test]
    fn self_reproducing_derivation_terminates() {
        let store = CacheStore::new();
        store.set_entry(SourceId::normalize("/seed"), json!({ "n": 1 }));
        let location = Location::default();
        let calls = Arc::new(AtomicUsize::new(0));

        fn looping(calls: Arc<AtomicUsize>) -> Declaration {
            Declaration::derived(move |_: &[Value]| {
                calls.fetch_add(1, Ordering::SeqCst);
                DeclarationSet::from(looping(Arc::clone(&calls)))
            })
            .requires("seed")
        }

        let set = DeclarationSet::from(vec![Declaration::new("/seed").key("seed"), looping(Arc::clone(&calls))]);
        let resolution = Resolver::new(&store, &location).resolve(set);
        assert_eq!(resolution.declarations.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), MAX_EXPANSION_DEPTH);
    }

    #[test]
    fn identical_closure_cycle_is_cut_by_visited_set() {
        let store = CacheStore::new();
        store.set_entry(SourceId::normalize("/seed"), json!({}));
        let location = Location::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let slot: Arc<std::sync::OnceLock<Declaration>> = Arc::new(std::sync::OnceLock::new());
        let inner_slot = Arc::clone(&slot);
        let counter = Arc::clone(&calls);
        let declaration = Declaration::derived(move |_: &[Value]| {
            counter.fetch_add(1, Ordering::SeqCst);
            inner_slot.get().cloned().map(DeclarationSet::from).unwrap_or_default()
        })
        .requires("seed");
        let _ = slot.set(declaration.clone());

        let set = DeclarationSet::from(vec![Declaration::new("/seed").key("seed"), declaration]);
        Resolver::new(&store, &location).resolve(set);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sibling_derivations_are_not_mistaken_for_cycles() {
        let store = CacheStore::new();
        store.set_entry(SourceId::normalize("/a"), json!({ "id": 1 }));
        let location = Location::default();

        let mut set = DeclarationSet::from(Declaration::new("/a").key("a"));
        for index in 0..50 {
            set.push(
                Declaration::derived(move |_: &[Value]| {
                    DeclarationSet::from(
                        Declaration::derived(move |_: &[Value]| DeclarationSet::from(format!("/leaf/{index}"))).requires("a"),
                    )
                })
                .requires("a"),
            );
        }

        let resolution = Resolver::new(&store, &location).resolve(set);
        assert_eq!(resolution.sources().len(), 51);
        assert_eq!(resolution.discovered().len(), 50);
    }

    #[test]
    fn route_params_apply_before_resolution() {
        let store = CacheStore::new();
        let location = Location::new("/users/3").with_param("id", "3");
        let resolution = Resolver::new(&store, &location).resolve("/api/users/:id");
        assert_eq!(resolution.declarations[0].source_id().unwrap().as_str(), "api/users/3");
    }
}
