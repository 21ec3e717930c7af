//! Transport abstraction used by the request dispatcher.
//!
//! The engine owns redirect detection, error classification and caching; a
//! transport only moves bytes. Responses are split into a head (status,
//! effective URL, headers) that is available as soon as the server answers,
//! and a body that is read afterwards. The dispatcher relies on that split to
//! release its in-flight slot before body parsing starts.

use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use reqwest::{Client, header};
use thiserror::Error;
use tracing::debug;

const DEFAULT_USER_AGENT: &str = concat!("sluice/", env!("CARGO_PKG_VERSION"));

/// Per-request options supplied by the dispatcher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Attach cookies and other ambient credentials.
    pub include_credentials: bool,
}

/// Status line, effective URL and headers of a response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    /// Final URL after transparent redirects, when the transport can report it.
    pub url: Option<String>,
    /// Header names are stored lowercase.
    pub headers: IndexMap<String, String>,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Lazily read response body.
#[async_trait]
pub trait ResponseBody: Send {
    async fn text(self: Box<Self>) -> Result<String, TransportError>;
}

/// A body that is already in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticBody(pub String);

#[async_trait]
impl ResponseBody for StaticBody {
    async fn text(self: Box<Self>) -> Result<String, TransportError> {
        Ok(self.0)
    }
}

pub struct TransportResponse {
    pub head: ResponseHead,
    pub body: Box<dyn ResponseBody>,
}

impl TransportResponse {
    /// Build a response whose body is already available.
    pub fn buffered(head: ResponseHead, body: impl Into<String>) -> Self {
        Self {
            head,
            body: Box::new(StaticBody(body.into())),
        }
    }
}

/// Failures that happen before a status is known or while reading the body.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("failed to read response body: {0}")]
    Body(String),

    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

/// Issues requests on behalf of the dispatcher.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn issue_request(&self, url: &str, options: &RequestOptions) -> Result<TransportResponse, TransportError>;
}

/// Settings for [`ReqwestTransport`].
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub user_agent: String,
    pub timeout: Option<Duration>,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: None,
        }
    }
}

/// reqwest-backed transport.
///
/// Two clients are kept so that credential policy can be decided per request:
/// one with a cookie store and one without.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    with_credentials: Client,
    without_credentials: Client,
}

impl ReqwestTransport {
    pub fn new(settings: &TransportSettings) -> Result<Self, TransportError> {
        Ok(Self {
            with_credentials: build_client(settings, true)?,
            without_credentials: build_client(settings, false)?,
        })
    }
}

fn build_client(settings: &TransportSettings, cookies: bool) -> Result<Client, TransportError> {
    let mut default_headers = header::HeaderMap::new();
    default_headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));

    let mut builder = Client::builder()
        .gzip(true)
        .brotli(true)
        .cookie_store(cookies)
        .user_agent(settings.user_agent.as_str())
        .default_headers(default_headers);
    if let Some(timeout) = settings.timeout {
        builder = builder.timeout(timeout);
    }
    builder.build().map_err(|error| TransportError::Client(error.to_string()))
}

struct ReqwestBody(reqwest::Response);

#[async_trait]
impl ResponseBody for ReqwestBody {
    async fn text(self: Box<Self>) -> Result<String, TransportError> {
        self.0.text().await.map_err(|error| TransportError::Body(error.to_string()))
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn issue_request(&self, url: &str, options: &RequestOptions) -> Result<TransportResponse, TransportError> {
        let client = if options.include_credentials {
            &self.with_credentials
        } else {
            &self.without_credentials
        };

        let response = client
            .get(url)
            .send()
            .await
            .map_err(|error| TransportError::Network(error.to_string()))?;

        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|value| (name.as_str().to_ascii_lowercase(), value.to_string())))
            .collect();
        let head = ResponseHead {
            status: response.status().as_u16(),
            url: Some(response.url().to_string()),
            headers,
        };
        debug!(url = %url, status = head.status, "response head received");

        Ok(TransportResponse {
            head,
            body: Box::new(ReqwestBody(response)),
        })
    }
}
