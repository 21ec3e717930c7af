#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;
use sluice_engine::{Consumer, DeclarationSet, Engine, dispatch::strip_marker};
use sluice_types::{Location, SourceId};
use sluice_util::{
    EngineConfig,
    http::{RequestOptions, ResponseBody, ResponseHead, Transport, TransportError, TransportResponse},
};
use tokio::sync::oneshot;

#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub body: String,
    pub url: Option<String>,
    pub headers: IndexMap<String, String>,
}

impl Reply {
    pub fn json(status: u16, body: Value) -> Self {
        Self::text(status, body.to_string())
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            url: None,
            headers: IndexMap::new(),
        }
    }

    pub fn from_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }
}

struct GatedBody {
    text: String,
    gate: oneshot::Receiver<()>,
}

#[async_trait]
impl ResponseBody for GatedBody {
    async fn text(self: Box<Self>) -> Result<String, TransportError> {
        let _ = self.gate.await;
        Ok(self.text)
    }
}

/// In-memory transport keyed by normalized source.
///
/// Routes answer immediately. Gates hold the next request for a source until
/// the test sends a reply; body gates return the head at once but hold the
/// body.
#[derive(Default)]
pub struct ScriptedTransport {
    calls: Mutex<Vec<String>>,
    credentials: Mutex<Vec<bool>>,
    routes: Mutex<HashMap<String, Reply>>,
    gates: Mutex<HashMap<String, VecDeque<oneshot::Receiver<Reply>>>>,
    body_gates: Mutex<HashMap<String, VecDeque<oneshot::Receiver<()>>>>,
}

fn route_key(url: &str) -> String {
    SourceId::normalize(&strip_marker(url, "sluice")).to_string()
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, source: &str, reply: Reply) {
        self.routes.lock().unwrap().insert(SourceId::normalize(source).to_string(), reply);
    }

    pub fn gate(&self, source: &str) -> oneshot::Sender<Reply> {
        let (sender, receiver) = oneshot::channel();
        self.gates
            .lock()
            .unwrap()
            .entry(SourceId::normalize(source).to_string())
            .or_default()
            .push_back(receiver);
        sender
    }

    pub fn gate_body(&self, source: &str) -> oneshot::Sender<()> {
        let (sender, receiver) = oneshot::channel();
        self.body_gates
            .lock()
            .unwrap()
            .entry(SourceId::normalize(source).to_string())
            .or_default()
            .push_back(receiver);
        sender
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for(&self, source: &str) -> usize {
        let key = SourceId::normalize(source).to_string();
        self.calls.lock().unwrap().iter().filter(|url| route_key(url) == key).count()
    }

    pub fn credentials(&self) -> Vec<bool> {
        self.credentials.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn issue_request(&self, url: &str, options: &RequestOptions) -> Result<TransportResponse, TransportError> {
        self.calls.lock().unwrap().push(url.to_string());
        self.credentials.lock().unwrap().push(options.include_credentials);
        let key = route_key(url);

        let gate = self.gates.lock().unwrap().get_mut(&key).and_then(VecDeque::pop_front);
        let reply = match gate {
            Some(gate) => gate.await.map_err(|_| TransportError::Network("gate dropped".into()))?,
            None => self
                .routes
                .lock()
                .unwrap()
                .get(&key)
                .cloned()
                .ok_or_else(|| TransportError::Network(format!("no route for {key}")))?,
        };

        let head = ResponseHead {
            status: reply.status,
            url: reply.url,
            headers: reply.headers,
        };
        let body_gate = self.body_gates.lock().unwrap().get_mut(&key).and_then(VecDeque::pop_front);
        Ok(match body_gate {
            Some(gate) => TransportResponse {
                head,
                body: Box::new(GatedBody { text: reply.body, gate }),
            },
            None => TransportResponse::buffered(head, reply.body),
        })
    }
}

pub fn engine(transport: &Arc<ScriptedTransport>) -> Engine {
    engine_with_config(transport, EngineConfig::default())
}

pub fn engine_with_config(transport: &Arc<ScriptedTransport>, config: EngineConfig) -> Engine {
    Engine::builder(config)
        .transport(Arc::clone(transport) as Arc<dyn Transport>)
        .build()
        .expect("engine builds")
}

type SourcesFn = Box<dyn Fn(&Location) -> DeclarationSet + Send + Sync>;

/// Consumer that records every local data tree it receives.
pub struct RecordingConsumer {
    sources: SourcesFn,
    updates: Mutex<Vec<Value>>,
}

impl RecordingConsumer {
    pub fn new(sources: impl Fn(&Location) -> DeclarationSet + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            sources: Box::new(sources),
            updates: Mutex::new(Vec::new()),
        })
    }

    pub fn update_count(&self) -> usize {
        self.updates.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<Value> {
        self.updates.lock().unwrap().last().cloned()
    }
}

impl Consumer for RecordingConsumer {
    fn sources(&self, location: &Location) -> DeclarationSet {
        (self.sources)(location)
    }

    fn on_data(&self, data: &Value) {
        self.updates.lock().unwrap().push(data.clone());
    }
}
