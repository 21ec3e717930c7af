//! Network fetches for normalized sources.
//!
//! [`RequestDispatcher::fetch`] is fire-and-forget: it marks the source as
//! loading, spawns one task per request, and the task writes its result back
//! into the [`CacheStore`]. At most one request per source is in flight; the
//! slot is released as soon as the response status is known.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use serde_json::Value;
use sluice_types::{ErrorRecord, FailureKind, SourceId, StoreAction, absolutize, failure::SUCCESS_STATUS};
use sluice_util::{
    EngineConfig,
    http::{RequestOptions, TransportResponse, container_payload, parse_response_json_strict, transport::Transport},
};
use tokio::{runtime::Handle, sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::store::CacheStore;

/// Header some transports set when they cannot report the final URL directly.
pub const REQUEST_URL_HEADER: &str = "x-request-url";

/// Receives the new location when a fetch was redirected.
pub type RedirectHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Result of one fetch task.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// Payload written to the cache.
    Received(Value),
    /// The server answered from another location; nothing was cached.
    Redirected(String),
    /// Classified failure recorded in the error list.
    Failed(FetchFailure),
    /// A newer request for the same source was issued; this result was dropped.
    Superseded,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchFailure {
    pub kind: FailureKind,
    pub status: Option<u16>,
    pub response: Option<Value>,
    /// Diagnostic detail for logs; not shown to users.
    pub detail: String,
}

impl FetchFailure {
    fn new(kind: FailureKind, status: Option<u16>, response: Option<Value>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            status,
            response,
            detail: detail.into(),
        }
    }
}

#[derive(Default)]
struct FetchLedger {
    in_flight: HashSet<SourceId>,
    latest: HashMap<SourceId, u64>,
}

struct DispatcherInner {
    store: Arc<CacheStore>,
    transport: Arc<dyn Transport>,
    config: EngineConfig,
    redirect_handler: Option<RedirectHandler>,
    ledger: Mutex<FetchLedger>,
    next_sequence: AtomicU64,
    active_tasks: watch::Sender<usize>,
    runtime: Handle,
}

/// Issues network requests on behalf of the cache.
#[derive(Clone)]
pub struct RequestDispatcher {
    inner: Arc<DispatcherInner>,
}

impl fmt::Debug for RequestDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestDispatcher")
            .field("identifier_suffix", &self.inner.config.identifier_suffix)
            .field("active_tasks", &*self.inner.active_tasks.borrow())
            .finish()
    }
}

impl RequestDispatcher {
    pub fn new(
        store: Arc<CacheStore>,
        transport: Arc<dyn Transport>,
        config: EngineConfig,
        redirect_handler: Option<RedirectHandler>,
        runtime: Handle,
    ) -> Self {
        let (active_tasks, _) = watch::channel(0);
        Self {
            inner: Arc::new(DispatcherInner {
                store,
                transport,
                config,
                redirect_handler,
                ledger: Mutex::new(FetchLedger::default()),
                next_sequence: AtomicU64::new(1),
                active_tasks,
                runtime,
            }),
        }
    }

    /// Start fetching `source` unless a request for it is already in flight.
    ///
    /// Returns `None` when the call was deduplicated. The returned handle
    /// resolves after the result has been written to the cache.
    pub fn fetch(&self, source: &SourceId) -> Option<JoinHandle<FetchOutcome>> {
        let sequence = {
            let mut ledger = self.inner.ledger.lock().expect("fetch ledger lock");
            if ledger.in_flight.contains(source) {
                debug!(source = %source, "fetch already in flight");
                return None;
            }
            let sequence = self.inner.next_sequence.fetch_add(1, Ordering::Relaxed);
            ledger.in_flight.insert(source.clone());
            ledger.latest.insert(source.clone(), sequence);
            sequence
        };

        self.inner.active_tasks.send_modify(|count| *count += 1);
        let guard = ActiveTask(Arc::clone(&self.inner));
        self.inner.store.dispatch(StoreAction::Request { source: source.clone() });

        let inner = Arc::clone(&self.inner);
        let source = source.clone();
        Some(self.inner.runtime.spawn(async move {
            let _guard = guard;
            let outcome = inner.run(&source, sequence).await;
            inner.apply(&source, sequence, outcome)
        }))
    }

    pub fn is_in_flight(&self, source: &SourceId) -> bool {
        self.inner.ledger.lock().expect("fetch ledger lock").in_flight.contains(source)
    }

    /// Number of fetch tasks that have not yet written their result.
    pub fn active_tasks(&self) -> usize {
        *self.inner.active_tasks.borrow()
    }

    /// Wait until no fetch task is running.
    ///
    /// Fetches started by listeners while results are being written keep the
    /// dispatcher busy, so this also waits for dependent sources discovered
    /// along the way.
    pub async fn wait_idle(&self) {
        let mut receiver = self.inner.active_tasks.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = receiver.wait_for(|count| *count == 0).await;
    }

    /// The URL actually requested for `source`, including the marker.
    pub fn request_url(&self, source: &SourceId) -> String {
        self.inner.request_url(source)
    }
}

/// Decrements the active task count when a fetch task ends, even on panic.
struct ActiveTask(Arc<DispatcherInner>);

impl Drop for ActiveTask {
    fn drop(&mut self) {
        self.0.active_tasks.send_modify(|count| *count = count.saturating_sub(1));
    }
}

impl DispatcherInner {
    fn request_url(&self, source: &SourceId) -> String {
        let base = match &self.config.origin {
            Some(origin) => absolutize(source.as_str(), Some(origin)).to_string(),
            None => source.to_string(),
        };
        let separator = if base.contains('?') { '&' } else { '?' };
        format!("{base}{separator}{}", self.config.identifier_suffix)
    }

    fn release(&self, source: &SourceId, sequence: u64) {
        let mut ledger = self.ledger.lock().expect("fetch ledger lock");
        if ledger.latest.get(source) == Some(&sequence) {
            ledger.in_flight.remove(source);
        }
    }

    async fn run(&self, source: &SourceId, sequence: u64) -> FetchOutcome {
        let url = self.request_url(source);
        let options = RequestOptions {
            include_credentials: self.config.include_credentials(&url),
        };
        debug!(source = %source, url = %url, request_sequence = sequence, "fetch started");

        let response = self.transport.issue_request(&url, &options).await;
        self.release(source, sequence);

        match response {
            Ok(response) => self.complete(source, response).await,
            Err(error) => FetchOutcome::Failed(FetchFailure::new(FailureKind::Unknown, None, None, error.to_string())),
        }
    }

    async fn complete(&self, source: &SourceId, response: TransportResponse) -> FetchOutcome {
        let status = response.head.status;
        let effective = response
            .head
            .url
            .clone()
            .or_else(|| response.head.header(REQUEST_URL_HEADER).map(str::to_string));

        if let Some(effective) = effective {
            let location = strip_marker(&effective, &self.config.identifier_suffix);
            let origin = self.config.origin.as_ref();
            if absolutize(&location, origin) != absolutize(source.as_str(), origin) {
                return FetchOutcome::Redirected(location);
            }
        }

        let text = match response.body.text().await {
            Ok(text) => text,
            Err(error) => {
                return FetchOutcome::Failed(FetchFailure::new(FailureKind::Unknown, Some(status), None, error.to_string()));
            }
        };
        let parsed = parse_response_json_strict(&text, Some(status));

        if status != SUCCESS_STATUS {
            let detail = format!("unexpected status {status}");
            let response = parsed.ok().map(container_payload);
            return FetchOutcome::Failed(FetchFailure::new(FailureKind::from_status(status), Some(status), response, detail));
        }

        match parsed {
            Ok(payload) => FetchOutcome::Received(container_payload(payload)),
            Err(error) => FetchOutcome::Failed(FetchFailure::new(error.failure_kind(), Some(status), None, error.to_string())),
        }
    }

    fn apply(&self, source: &SourceId, sequence: u64, outcome: FetchOutcome) -> FetchOutcome {
        let latest = self.ledger.lock().expect("fetch ledger lock").latest.get(source).copied();
        if latest != Some(sequence) {
            debug!(source = %source, request_sequence = sequence, latest_sequence = ?latest, "discarding stale fetch result");
            return FetchOutcome::Superseded;
        }

        match &outcome {
            FetchOutcome::Received(payload) => {
                info!(source = %source, request_sequence = sequence, "fetch completed");
                self.store.dispatch(StoreAction::Receive {
                    source: source.clone(),
                    payload: payload.clone(),
                });
            }
            FetchOutcome::Failed(failure) => {
                warn!(
                    source = %source,
                    status = ?failure.status,
                    kind = ?failure.kind,
                    detail = %failure.detail,
                    "fetch failed"
                );
                self.store.dispatch(StoreAction::AddError {
                    record: ErrorRecord::new(source.clone(), failure.kind, failure.status, failure.response.clone()),
                });
            }
            FetchOutcome::Redirected(location) => {
                info!(source = %source, location = %location, "fetch redirected");
                match &self.redirect_handler {
                    Some(handler) => handler(location),
                    None => warn!(source = %source, location = %location, "redirect ignored: no redirect handler installed"),
                }
            }
            FetchOutcome::Superseded => {}
        }
        outcome
    }
}

/// Remove the `suffix` marker from the query of `url`.
///
/// The query is parsed into pairs so the marker is found wherever the server
/// placed it and regardless of its length.
pub fn strip_marker(url: &str, suffix: &str) -> String {
    let (base, fragment) = match url.split_once('#') {
        Some((base, fragment)) => (base, Some(fragment)),
        None => (url, None),
    };
    let Some((path, query)) = base.split_once('?') else {
        return url.to_string();
    };

    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| {
            let key = pair.split_once('=').map(|(key, _)| key).unwrap_or(pair);
            !pair.is_empty() && key != suffix
        })
        .collect();

    let mut stripped = path.to_string();
    if !kept.is_empty() {
        stripped.push('?');
        stripped.push_str(&kept.join("&"));
    }
    if let Some(fragment) = fragment {
        stripped.push('#');
        stripped.push_str(fragment);
    }
    stripped
}
