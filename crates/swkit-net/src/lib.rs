//! # swkit Net
//!
//! Request and response types seen by the service worker, plus the
//! [`NetworkFetcher`] seam it uses to reach the live network.
//!
//! ## Design Goals
//!
//! 1. **Plain values**: requests and responses are fully buffered and cheap to clone
//! 2. **Injectable network**: the worker only sees `dyn NetworkFetcher`
//! 3. **Unmodified pass-through**: fetched responses reach the page as received

use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method};
use thiserror::Error;
use url::Url;

pub mod loader;

pub use loader::{HttpFetcher, LoaderConfig};

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// An intercepted HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
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
        }
    }

    /// Parse `url` and create a GET request for it.
    pub fn parse_get(url: &str) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|e| NetError::InvalidUrl(e.to_string()))?;
        Ok(Self::get(url))
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// URL path, used for routing.
    pub fn path(&self) -> &str {
        self.url.path()
    }
}

/// A fully buffered response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Final URL, if the response came from the network or a cache.
    pub url: Option<Url>,
    /// Status code. `0` marks a network error.
    pub status: u16,
    pub status_text: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    /// A synthetic `200 OK` plain-text response.
    pub fn plain_text(body: impl Into<String>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain;charset=UTF-8"),
        );
        Self {
            url: None,
            status: 200,
            status_text: "OK".to_string(),
            headers,
            body: Bytes::from(body.into()),
        }
    }

    /// The response a page sees when the fetch was rejected.
    pub fn network_error() -> Self {
        Self {
            url: None,
            status: 0,
            status_text: "Network Error".to_string(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Check if the status is 2xx.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_network_error(&self) -> bool {
        self.status == 0
    }

    /// Body decoded as UTF-8, lossily.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Access to the live network.
#[async_trait]
pub trait NetworkFetcher: Send + Sync {
    /// Perform the request. A non-2xx status is still `Ok`.
    async fn fetch(&self, request: &Request) -> Result<Response, NetError>;
}
