//! The coordinator that ties the cache, the dispatcher, and mounted consumers
//! together, and reacts to navigation.

use std::{
    fmt,
    sync::{Arc, Mutex},
};

use indexmap::IndexSet;
use serde_json::Value;
use sluice_types::{CacheEntry, CacheSnapshot, Location, SourceId, StoreAction};
use sluice_util::{
    ConfigError, EngineConfig,
    http::{ReqwestTransport, Transport, TransportError},
    validate_config,
};
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::{
    binding::{BindingInner, Consumer, ConsumerBinding},
    declaration::{Declaration, DeclarationSet, SourceTransformer},
    dispatch::{RedirectHandler, RequestDispatcher},
    registry::SubscriberRegistry,
    resolver::{Resolution, Resolver},
    store::{CacheStore, Subscription},
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("the engine must be built inside a tokio runtime")]
    NoRuntime,
}

/// A cross-cutting feature that hooks into engine construction.
///
/// Capabilities run once, in registration order, right after the engine is
/// built.
pub trait Bootstrappable: Send + Sync {
    fn on_bootstrap(&self, engine: &Engine);
}

pub(crate) struct EngineShared {
    pub(crate) store: Arc<CacheStore>,
    pub(crate) dispatcher: RequestDispatcher,
    pub(crate) registry: SubscriberRegistry<BindingInner>,
    pub(crate) runtime: Handle,
    config: EngineConfig,
    location: Mutex<Location>,
    source_transformer: Option<SourceTransformer>,
}

impl EngineShared {
    pub(crate) fn location(&self) -> Location {
        self.location.lock().expect("location lock").clone()
    }

    /// Resolve against the cache and load whatever expansion discovered.
    /// Expand against the current cache without loading anything.
    pub(crate) fn expand(&self, declarations: DeclarationSet, location: &Location) -> Resolution {
        Resolver::new(&self.store, location)
            .with_transformer(self.source_transformer.as_ref())
            .resolve(declarations)
    }

    pub(crate) fn resolve(&self, declarations: DeclarationSet, location: &Location) -> Resolution {
        let resolution = self.expand(declarations, location);
        if !resolution.discovered.is_empty() {
            self.load(resolution.discovered(), false);
        }
        resolution
    }

    /// Fetch each source once. Without `force`, cached sources are skipped.
    pub(crate) fn load(&self, sources: impl IntoIterator<Item = SourceId>, force: bool) -> usize {
        let sources: IndexSet<SourceId> = sources.into_iter().collect();
        let mut started = 0;
        for source in &sources {
            if !force && self.store.entry(source.as_str()).is_some() {
                debug!(source = %source, "source cached; skipping fetch");
                continue;
            }
            if self.dispatcher.fetch(source).is_some() {
                started += 1;
            }
        }
        started
    }
}

/// Configures and builds an [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    transport: Option<Arc<dyn Transport>>,
    source_transformer: Option<SourceTransformer>,
    redirect_handler: Option<RedirectHandler>,
    capabilities: Vec<Box<dyn Bootstrappable>>,
    location: Location,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            transport: None,
            source_transformer: None,
            redirect_handler: None,
            capabilities: Vec::new(),
            location: Location::default(),
        }
    }

    /// Use a custom transport instead of the reqwest one.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn source_transformer(mut self, transformer: impl Fn(Declaration, &Location) -> Declaration + Send + Sync + 'static) -> Self {
        self.source_transformer = Some(Arc::new(transformer));
        self
    }

    /// Called with the new location whenever a fetch is redirected.
    pub fn redirect_handler(mut self, handler: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.redirect_handler = Some(Arc::new(handler));
        self
    }

    pub fn capability(mut self, capability: impl Bootstrappable + 'static) -> Self {
        self.capabilities.push(Box::new(capability));
        self
    }

    /// Location in effect before the first navigation.
    pub fn location(mut self, location: Location) -> Self {
        self.location = location;
        self
    }

    /// Build the engine. Must be called from within a tokio runtime.
    pub fn build(self) -> Result<Engine, EngineError> {
        validate_config(&self.config)?;
        let runtime = Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(&self.config.transport_settings())?),
        };

        let store = Arc::new(CacheStore::new());
        let dispatcher = RequestDispatcher::new(
            Arc::clone(&store),
            transport,
            self.config.clone(),
            self.redirect_handler,
            runtime.clone(),
        );
        let engine = Engine {
            shared: Arc::new(EngineShared {
                store,
                dispatcher,
                registry: SubscriberRegistry::new(),
                runtime,
                config: self.config,
                location: Mutex::new(self.location),
                source_transformer: self.source_transformer,
            }),
        };

        for capability in &self.capabilities {
            capability.on_bootstrap(&engine);
        }
        debug!(capabilities = self.capabilities.len(), "engine built");
        Ok(engine)
    }
}

/// Entry point for loading sources, mounting consumers, and navigation.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("store", &self.shared.store)
            .field("consumers", &self.shared.registry.len())
            .field("location", &self.shared.location())
            .finish()
    }
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.shared.store
    }

    pub fn dispatcher(&self) -> &RequestDispatcher {
        &self.shared.dispatcher
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Load raw sources. `force` refetches sources that are already cached.
    ///
    /// Returns the number of requests actually started.
    pub fn load_state<I, S>(&self, sources: I, force: bool) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.shared
            .load(sources.into_iter().map(|source| SourceId::normalize(source.as_ref())), force)
    }

    pub fn get_cached_state(&self, source: &str) -> Option<Arc<CacheEntry>> {
        self.shared.store.entry(SourceId::normalize(source).as_str())
    }

    /// Seed or override a cache entry without a network request.
    pub fn set_state(&self, source: &str, payload: Value) {
        self.shared.store.set_entry(SourceId::normalize(source), payload);
    }

    pub fn set_states<I, S>(&self, states: I)
    where
        I: IntoIterator<Item = (S, Value)>,
        S: AsRef<str>,
    {
        for (source, payload) in states {
            self.set_state(source.as_ref(), payload);
        }
    }

    pub fn subscribe(&self, listener: impl Fn(&StoreAction) + Send + Sync + 'static) -> Subscription {
        self.shared.store.subscribe(Arc::new(listener))
    }

    pub fn snapshot(&self) -> Arc<CacheSnapshot> {
        self.shared.store.snapshot()
    }

    pub fn remove_error(&self, index: usize) -> bool {
        self.shared.store.dispatch(StoreAction::RemoveError { index })
    }

    pub fn reset_errors(&self) -> bool {
        self.shared.store.dispatch(StoreAction::ResetErrors)
    }

    pub fn reset_store(&self) -> bool {
        self.shared.store.dispatch(StoreAction::ResetStore)
    }

    /// Resolve declarations at the current location and load discovered sources.
    pub fn resolve(&self, declarations: impl Into<DeclarationSet>) -> Resolution {
        let location = self.shared.location();
        self.shared.resolve(declarations.into(), &location)
    }

    pub fn mount(&self, consumer: Arc<dyn Consumer>) -> ConsumerBinding {
        ConsumerBinding::mount(Arc::clone(&self.shared), consumer)
    }

    pub fn active_consumers(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn location(&self) -> Location {
        self.shared.location()
    }

    /// Normalized path of the current location followed by its query string.
    pub fn current_uri(&self) -> String {
        self.shared.location().uri()
    }

    /// Record a location change and re-resolve every mounted consumer.
    pub fn navigate(&self, location: Location) -> IndexSet<SourceId> {
        info!(path = %location.path, "navigation");
        *self.shared.location.lock().expect("location lock") = location;
        self.transition(false)
    }

    /// Load the union of all mounted consumers' sources, then publish the
    /// navigation marker so every consumer rebuilds its local state.
    ///
    /// Returns the sources that were requested from the cache.
    pub fn transition(&self, force: bool) -> IndexSet<SourceId> {
        let consumers = self.shared.registry.list_active();
        let sources: IndexSet<SourceId> = consumers
            .iter()
            .flat_map(|(_, binding)| binding.resolve().sources())
            .collect();

        let started = self.shared.load(sources.iter().cloned(), force);
        info!(consumers = consumers.len(), sources = sources.len(), started, force, "transition");
        self.shared.store.dispatch(StoreAction::Transition);
        sources
    }

    /// Refetch everything mounted consumers use and evict everything else.
    ///
    /// Returns the evicted sources.
    pub fn refresh_sources(&self) -> Vec<SourceId> {
        let listened = self.transition(true);
        let unlistened: Vec<SourceId> = self
            .snapshot()
            .sources
            .keys()
            .filter(|source| !listened.contains(*source))
            .cloned()
            .collect();
        for source in &unlistened {
            self.shared.store.evict(source.clone());
        }
        debug!(evicted = unlistened.len(), "refresh evicted unlistened sources");
        unlistened
    }

    /// Wait until every fetch (including ones started by consumers reacting
    /// to earlier results) has finished.
    pub async fn wait_idle(&self) {
        self.shared.dispatcher.wait_idle().await;
    }
}
