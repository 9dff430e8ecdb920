//! # pwakit Net
//!
//! Request/response types and the network seam used by the pwakit service worker.
//!
//! ## Design Goals
//!
//! 1. **Async fetch**: every network access is a future the caller can run
//!    alongside other in-flight fetches
//! 2. **Swappable network**: the worker only sees the [`Fetcher`] trait, so
//!    hosts can plug in `reqwest`, a test double, or a browser bridge
//! 3. **Fully buffered bodies**: a [`Response`] always carries its complete
//!    body, so an aborted transfer surfaces as an error rather than a
//!    truncated response

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use http::header::{ACCEPT, CONTENT_TYPE};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use mime::Mime;
use thiserror::Error;
use url::Url;

pub mod loader;

pub use loader::{LoaderConfig, ResourceLoader};

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Network unreachable: {0}")]
    Offline(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

impl From<NetError> for pwakit_common::PwaError {
    fn from(err: NetError) -> Self {
        match err {
            NetError::Timeout(after) => Self::Timeout(after),
            NetError::Cancelled => Self::Cancelled,
            NetError::InvalidUrl(url) => Self::InvalidArgument(url),
            other => Self::network_with_source("fetch failed", other),
        }
    }
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub timeout: Option<Duration>,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
        }
    }

    /// Create a POST request.
    pub fn post(url: Url, body: Bytes) -> Self {
        Self {
            method: Method::POST,
            body: Some(body),
            ..Self::get(url)
        }
    }

    /// Parse `url` and create a GET request.
    pub fn parse(url: &str) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|e| NetError::InvalidUrl(format!("{url}: {e}")))?;
        Ok(Self::get(url))
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the `Accept` header.
    pub fn accept(self, value: &'static str) -> Self {
        self.header(ACCEPT, HeaderValue::from_static(value))
    }

    /// Set timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Whether the `Accept` header mentions the given media type.
    pub fn accepts(&self, media_type: &str) -> bool {
        self.headers
            .get_all(ACCEPT)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.contains(media_type))
    }

    /// Whether the request targets an http(s) URL.
    pub fn is_http(&self) -> bool {
        matches!(self.url.scheme(), "http" | "https")
    }

    /// Create a copy of this request with a fresh id, for background refetches.
    pub fn duplicate(&self) -> Self {
        Self {
            id: RequestId::new(),
            ..self.clone()
        }
    }
}

/// HTTP response with a fully buffered body.
#[derive(Debug, Clone)]
pub struct Response {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// The final URL differs from the requested one.
    pub redirected: bool,
}

impl Response {
    /// Create a response.
    pub fn new(url: Url, status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            url,
            status,
            headers,
            body: body.into(),
            redirected: false,
        }
    }

    /// Mark the response as the result of following redirects.
    pub fn with_redirected(mut self, redirected: bool) -> Self {
        self.redirected = redirected;
        self
    }

    /// Create a 200 response with the given content type.
    pub fn ok_with(url: Url, content_type: &'static str, body: impl Into<Bytes>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        Self::new(url, StatusCode::OK, headers, body)
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Whether the response may be stored under the request's key: a 2xx
    /// that was not reached through a redirect.
    pub fn cacheable(&self) -> bool {
        self.ok() && !self.redirected
    }

    /// Get a header value as a string.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Parsed `Content-Type`.
    pub fn content_type(&self) -> Option<Mime> {
        self.header(CONTENT_TYPE.as_str())
            .and_then(|s| s.parse::<Mime>().ok())
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }

    /// Get the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, NetError> {
        serde_json::from_slice(&self.body).map_err(|e| NetError::RequestFailed(e.to_string()))
    }
}

/// Something that can perform a network fetch.
///
/// Implementations must return `Err` when the body could not be read in full;
/// a partially received body is never handed back as a response.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response, NetError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let url = Url::parse("https://example.com").unwrap();
        let request = Request::get(url.clone())
            .accept("application/json")
            .timeout(Duration::from_secs(10));

        assert_eq!(request.url, url);
        assert_eq!(request.method, Method::GET);
        assert!(request.accepts("application/json"));
        assert!(!request.accepts("text/html"));
        assert_eq!(request.timeout, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_request_accepts_html_in_list() {
        let request = Request::parse("https://example.com/dashboard.html")
            .unwrap()
            .accept("text/html,application/xhtml+xml;q=0.9,*/*;q=0.8");
        assert!(request.accepts("text/html"));
    }

    #[test]
    fn test_request_parse_invalid() {
        assert!(matches!(
            Request::parse("not a url"),
            Err(NetError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_request_is_http() {
        assert!(Request::parse("http://example.com/").unwrap().is_http());
        assert!(!Request::parse("chrome-extension://abc/x.js").unwrap().is_http());
    }

    #[test]
    fn test_request_id_uniqueness() {
        let request = Request::parse("https://example.com/").unwrap();
        let copy = request.duplicate();
        assert_ne!(request.id, copy.id);
        assert_eq!(request.url, copy.url);
    }

    #[test]
    fn test_response_helpers() {
        let url = Url::parse("https://example.com/data.json").unwrap();
        let response = Response::ok_with(url, "application/json", r#"{"n":1}"#);

        assert!(response.ok());
        assert_eq!(response.content_type(), Some(mime::APPLICATION_JSON));
        let value: serde_json::Value = response.json().unwrap();
        assert_eq!(value["n"], 1);
    }
}
