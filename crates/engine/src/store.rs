//! The keyed source cache.
//!
//! All mutation goes through [`reduce`], a pure function from the current
//! snapshot and an action to the next snapshot. [`CacheStore`] serializes
//! dispatches, swaps the snapshot, and publishes the action to subscribers.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use sluice_types::{CacheEntry, CacheSnapshot, ErrorRecord, SourceId, StoreAction};
use tracing::{debug, trace};

/// Callback invoked once for every published action.
pub type Listener = Arc<dyn Fn(&StoreAction) + Send + Sync>;

type ListenerList = Arc<Mutex<Vec<(u64, Listener)>>>;

/// Compute the snapshot that follows `action`.
///
/// Returns `None` when the action leaves the cache untouched; such actions
/// are not published. Entries are always replaced, never edited in place.
pub fn reduce(state: &CacheSnapshot, action: &StoreAction, now: DateTime<Utc>) -> Option<CacheSnapshot> {
    match action {
        StoreAction::Request { source } => {
            let entry = CacheEntry::loading(source.clone(), state.sources.get(source).map(Arc::as_ref), now);
            Some(with_entry(state, entry))
        }
        StoreAction::Receive { source, payload } => Some(with_entry(state, CacheEntry::received(source.clone(), payload.clone(), now))),
        StoreAction::AddError { record } => {
            let mut next = match state.sources.get(&record.source) {
                Some(existing) => with_entry(state, existing.errored(now)),
                None => state.clone(),
            };
            next.errors.push(record.clone());
            Some(next)
        }
        StoreAction::RemoveError { index } => {
            if *index >= state.errors.len() {
                return None;
            }
            let mut next = state.clone();
            next.errors.remove(*index);
            Some(next)
        }
        StoreAction::ResetErrors => {
            if state.errors.is_empty() {
                return None;
            }
            Some(CacheSnapshot {
                sources: state.sources.clone(),
                errors: Vec::new(),
            })
        }
        StoreAction::RemoveState { source } => {
            if !state.sources.contains_key(source) {
                return None;
            }
            let mut next = state.clone();
            next.sources.shift_remove(source);
            Some(next)
        }
        StoreAction::ResetStore => {
            if state.sources.is_empty() && state.errors.is_empty() {
                return None;
            }
            Some(CacheSnapshot::default())
        }
        StoreAction::Transition => None,
    }
}

fn with_entry(state: &CacheSnapshot, entry: CacheEntry) -> CacheSnapshot {
    let mut next = state.clone();
    next.sources.insert(entry.source.clone(), Arc::new(entry));
    next
}

struct StoreState {
    snapshot: Arc<CacheSnapshot>,
    last_stamp: DateTime<Utc>,
}

impl StoreState {
    /// Wall-clock time, bumped so that two transitions never share a stamp.
    fn next_stamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        self.last_stamp = if now > self.last_stamp {
            now
        } else {
            self.last_stamp + TimeDelta::microseconds(1)
        };
        self.last_stamp
    }
}

/// Shared source cache with a publish/subscribe channel.
///
/// Listeners run synchronously on the dispatching thread, in subscription
/// order, once per published action. An action dispatched from inside a
/// listener is applied immediately and published after the current round
/// of listeners finishes, so every listener sees actions in the same order.
pub struct CacheStore {
    state: Mutex<StoreState>,
    listeners: ListenerList,
    next_listener_id: AtomicU64,
    queue: Mutex<VecDeque<StoreAction>>,
    publishing: AtomicBool,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("CacheStore")
            .field("sources", &snapshot.sources.len())
            .field("errors", &snapshot.errors.len())
            .finish()
    }
}

impl CacheStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState {
                snapshot: Arc::new(CacheSnapshot::default()),
                last_stamp: DateTime::<Utc>::MIN_UTC,
            }),
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener_id: AtomicU64::new(1),
            queue: Mutex::new(VecDeque::new()),
            publishing: AtomicBool::new(false),
        }
    }

    /// Apply `action` and publish it when it changed the cache.
    ///
    /// [`StoreAction::Transition`] never changes the cache but is always
    /// published. Returns whether listeners were (or will be) notified.
    pub fn dispatch(&self, action: StoreAction) -> bool {
        {
            let mut state = self.state.lock().expect("store lock");
            let now = state.next_stamp();
            match reduce(&state.snapshot, &action, now) {
                Some(next) => state.snapshot = Arc::new(next),
                None if action.is_marker() => {}
                None => {
                    trace!(?action, "store action left cache unchanged");
                    return false;
                }
            }
            debug!(source = ?action.source().map(SourceId::as_str), marker = action.is_marker(), "store action applied");
            // Enqueue before releasing the store lock so publish order matches apply order.
            self.queue.lock().expect("publish queue lock").push_back(action);
        }

        self.publish_pending();
        true
    }

    fn publish_pending(&self) {
        loop {
            if self.publishing.swap(true, Ordering::AcqRel) {
                return;
            }
            while let Some(action) = self.next_queued() {
                let listeners: Vec<Listener> = self
                    .listeners
                    .lock()
                    .expect("listeners lock")
                    .iter()
                    .map(|(_, listener)| Arc::clone(listener))
                    .collect();
                for listener in listeners {
                    listener(&action);
                }
            }
            self.publishing.store(false, Ordering::Release);
            if self.queue.lock().expect("publish queue lock").is_empty() {
                return;
            }
        }
    }

    fn next_queued(&self) -> Option<StoreAction> {
        self.queue.lock().expect("publish queue lock").pop_front()
    }

    /// The current cache contents.
    pub fn snapshot(&self) -> Arc<CacheSnapshot> {
        Arc::clone(&self.state.lock().expect("store lock").snapshot)
    }

    pub fn entry(&self, source: &str) -> Option<Arc<CacheEntry>> {
        self.state.lock().expect("store lock").snapshot.sources.get(source).cloned()
    }

    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.snapshot().errors.clone()
    }

    /// Write a payload directly, bypassing the network.
    pub fn set_entry(&self, source: SourceId, payload: Value) {
        self.dispatch(StoreAction::Receive { source, payload });
    }

    pub fn evict(&self, source: SourceId) -> bool {
        self.dispatch(StoreAction::RemoveState { source })
    }

    pub fn subscribe(&self, listener: Listener) -> Subscription {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().expect("listeners lock").push((id, listener));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().expect("listeners lock").len()
    }
}

/// Handle returned by [`CacheStore::subscribe`].
///
/// Dropping the handle keeps the listener registered; call
/// [`Subscription::unsubscribe`] to remove it.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    listeners: Weak<Mutex<Vec<(u64, Listener)>>>,
}

impl Subscription {
    pub fn unsubscribe(self) -> bool {
        let Some(listeners) = self.listeners.upgrade() else {
            return false;
        };
        let mut listeners = listeners.lock().expect("listeners lock");
        let before = listeners.len();
        listeners.retain(|(id, _)| *id != self.id);
        before != listeners.len()
    }
}
