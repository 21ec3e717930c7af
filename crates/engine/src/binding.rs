//! Consumer bindings: the link between a mounted consumer and the cache.
//!
//! A binding resolves its consumer's declarations, loads what is missing,
//! and keeps a local data tree built from the cache entries those
//! declarations point at. The tree is rebuilt only when an entry's `updated`
//! stamp differs from the one the tree reflects, or on a navigation marker.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map as JsonMap, Value};
use sluice_types::{CacheEntry, CacheSnapshot, Location, SourceId, StoreAction};
use tokio::{
    task::JoinHandle,
    time::{Instant, interval_at},
};
use tracing::{debug, trace};

use crate::{
    declaration::{Declaration, DeclarationSet},
    engine::EngineShared,
    resolver::Resolution,
    store::Subscription,
};

/// A unit of UI (or any other party) that reads data from sources.
pub trait Consumer: Send + Sync {
    /// Declarations for the given navigation location.
    fn sources(&self, location: &Location) -> DeclarationSet;

    /// Called with the rebuilt local data tree.
    fn on_data(&self, _data: &Value) {}
}

pub(crate) struct BindingInner {
    consumer: Arc<dyn Consumer>,
    engine: Arc<EngineShared>,
    local: Mutex<Value>,
    recomputes: AtomicU64,
}

impl BindingInner {
    fn expand(&self) -> Resolution {
        let location = self.engine.location();
        self.engine.expand(self.consumer.sources(&location), &location)
    }

    /// Resolve this consumer's declarations and load any newly discovered sources.
    pub(crate) fn resolve(&self) -> Resolution {
        let location = self.engine.location();
        self.engine.resolve(self.consumer.sources(&location), &location)
    }

    fn on_action(&self, action: &StoreAction) {
        if !self.update(action.is_marker()) {
            trace!(source = ?action.source().map(SourceId::as_str), "binding unaffected by store action");
        }
    }

    /// Re-resolve and rebuild the tree if forced or stale, then load what the
    /// pass discovered. Returns whether the tree was rebuilt.
    ///
    /// Resolution and rebuild happen under the local lock against one
    /// snapshot, so a pass never overwrites a tree built from newer entries.
    /// Loading and the consumer callback run after the lock is released.
    fn update(&self, force: bool) -> bool {
        let (resolution, rebuilt) = {
            let mut local = self.local.lock().expect("local state lock");
            let resolution = self.expand();
            let snapshot = self.engine.store.snapshot();
            let rebuilt = (force || is_stale(&local, &resolution.declarations, &snapshot)).then(|| {
                let tree = build_local_state(&resolution.declarations, &snapshot);
                *local = tree.clone();
                tree
            });
            (resolution, rebuilt)
        };

        if let Some(tree) = &rebuilt {
            self.recomputes.fetch_add(1, Ordering::Relaxed);
            self.consumer.on_data(tree);
        }
        if !resolution.discovered.is_empty() {
            self.engine.load(resolution.discovered(), false);
        }
        rebuilt.is_some()
    }
}

/// Whether any declared entry's `updated` stamp differs from the one `local` reflects.
fn is_stale(local: &Value, declarations: &[Declaration], snapshot: &CacheSnapshot) -> bool {
    declarations.iter().any(|declaration| {
        let Some(source) = declaration.source_id() else {
            return false;
        };
        let reflected = node_at(local, declaration.key.as_deref()).and_then(|node| node.get("updated"));
        match (snapshot.sources.get(&source), reflected) {
            (Some(entry), Some(updated)) => stamp(&entry.updated) != *updated,
            (None, None) => false,
            _ => true,
        }
    })
}

/// Handle for a mounted consumer. Dropping it unmounts the consumer.
pub struct ConsumerBinding {
    id: u64,
    inner: Arc<BindingInner>,
    subscription: Option<Subscription>,
    timers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for ConsumerBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerBinding")
            .field("id", &self.id)
            .field("refresh_timers", &self.timers.len())
            .field("recomputes", &self.recompute_count())
            .finish()
    }
}

impl ConsumerBinding {
    pub(crate) fn mount(engine: Arc<EngineShared>, consumer: Arc<dyn Consumer>) -> Self {
        let inner = Arc::new(BindingInner {
            consumer,
            engine: Arc::clone(&engine),
            local: Mutex::new(Value::Object(JsonMap::new())),
            recomputes: AtomicU64::new(0),
        });

        // Listen before loading so completions that land mid-mount are seen.
        let listener = Arc::downgrade(&inner);
        let subscription = engine.store.subscribe(Arc::new(move |action: &StoreAction| {
            if let Some(inner) = listener.upgrade() {
                inner.on_action(action);
            }
        }));
        let id = engine.registry.register(&inner);

        let resolution = inner.expand();
        engine.load(resolution.sources(), false);

        let timers = resolution
            .declarations
            .iter()
            .filter_map(|declaration| Some((declaration.source_id()?, declaration.refresh?)))
            .filter_map(|(source, period)| spawn_refresh_timer(&engine, &inner, source, period))
            .collect::<Vec<_>>();

        debug!(binding_id = id, sources = resolution.declarations.len(), refresh_timers = timers.len(), "consumer mounted");
        inner.update(true);

        Self {
            id,
            inner,
            subscription: Some(subscription),
            timers,
        }
    }

    /// Registry id of this binding.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The most recently computed local data tree.
    pub fn data(&self) -> Value {
        self.inner.local.lock().expect("local state lock").clone()
    }

    /// How many times the local data tree has been rebuilt.
    pub fn recompute_count(&self) -> u64 {
        self.inner.recomputes.load(Ordering::Relaxed)
    }

    pub fn refresh_timer_count(&self) -> usize {
        self.timers.len()
    }

    /// Stop listening, cancel refresh timers, and leave the registry.
    pub fn unmount(self) {}
}

impl Drop for ConsumerBinding {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        for timer in self.timers.drain(..) {
            timer.abort();
        }
        self.inner.engine.registry.unregister(self.id);
        debug!(binding_id = self.id, "consumer unmounted");
    }
}

fn spawn_refresh_timer(
    engine: &Arc<EngineShared>,
    inner: &Arc<BindingInner>,
    source: SourceId,
    period: Duration,
) -> Option<JoinHandle<()>> {
    if period.is_zero() {
        debug!(source = %source, "ignoring zero refresh interval");
        return None;
    }
    let binding = Arc::downgrade(inner);
    let dispatcher = engine.dispatcher.clone();
    Some(engine.runtime.spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            if binding.strong_count() == 0 {
                break;
            }
            trace!(source = %source, "refresh timer fired");
            dispatcher.fetch(&source);
        }
    }))
}

/// Timestamp representation stored in the local data tree.
fn stamp(updated: &DateTime<Utc>) -> Value {
    Value::String(updated.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

fn entry_node(entry: &CacheEntry, state: Value) -> Value {
    let mut node = JsonMap::new();
    node.insert("source".into(), Value::String(entry.source.to_string()));
    node.insert("state".into(), state);
    node.insert("loading".into(), Value::Bool(entry.loading));
    node.insert("error".into(), Value::Bool(entry.error));
    node.insert("updated".into(), stamp(&entry.updated));
    Value::Object(node)
}

/// Build a consumer's local data tree from resolved declarations.
///
/// The keyless declaration fills the root; keyed ones are written at their
/// dot path in lexicographic key order, so `user` is written before
/// `user.details` and the nested write lands inside the parent node.
pub fn build_local_state(declarations: &[Declaration], snapshot: &CacheSnapshot) -> Value {
    let lookup = |key: &str| -> Option<Value> {
        let source = declarations
            .iter()
            .find(|declaration| declaration.key.as_deref() == Some(key))?
            .source_id()?;
        snapshot.sources.get(&source).map(|entry| entry.state.clone())
    };

    let mut ordered: Vec<&Declaration> = declarations.iter().collect();
    ordered.sort_by(|left, right| left.key.cmp(&right.key));

    let mut root = Value::Object(JsonMap::new());
    for declaration in ordered {
        let Some(source) = declaration.source_id() else {
            continue;
        };
        let Some(entry) = snapshot.sources.get(&source) else {
            continue;
        };
        let node = entry_node(entry, declaration.apply_transform(entry.state.clone(), &lookup));
        match declaration.key.as_deref() {
            None => root = node,
            Some(key) => set_path(&mut root, key, node),
        }
    }
    root
}

fn set_path(root: &mut Value, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').filter(|segment| !segment.is_empty()).collect();
    let Some((last, parents)) = segments.split_last() else {
        *root = value;
        return;
    };

    let mut current = root;
    for segment in parents {
        if !current.is_object() {
            *current = Value::Object(JsonMap::new());
        }
        current = match current {
            Value::Object(map) => map.entry(segment.to_string()).or_insert_with(|| Value::Object(JsonMap::new())),
            _ => return,
        };
    }
    if !current.is_object() {
        *current = Value::Object(JsonMap::new());
    }
    if let Value::Object(map) = current {
        map.insert(last.to_string(), value);
    }
}

fn node_at<'v>(root: &'v Value, path: Option<&str>) -> Option<&'v Value> {
    let Some(path) = path else {
        return Some(root);
    };
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(root, |current, segment| current.get(segment))
}
