//! Transport abstraction used by the crawl orchestrator.
//!
//! The orchestrator never talks to an HTTP stack directly: it hands a
//! [`FetchRequest`] to a [`Fetcher`] and classifies whatever comes back. Two
//! tiers exist, a lightweight HTTP client and a heavier browser-automation
//! client, and both satisfy the same trait.

pub mod reqwest_fetcher;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use http::header::CONTENT_TYPE;
use serde::Serialize;
use thiserror::Error;
use url::Url;

pub use reqwest_fetcher::ReqwestFetcher;

/// Which fetcher produced a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchTier {
    Http,
    Browser,
}

impl fmt::Display for FetchTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchTier::Http => write!(f, "http"),
            FetchTier::Browser => write!(f, "browser"),
        }
    }
}

/// A single outbound request.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: Url,
    pub headers: HeaderMap,
    pub timeout: Duration,
    /// Proxy endpoints to route through. More than one entry asks the
    /// transport to chain them; transports that cannot chain use the first.
    pub proxies: Vec<String>,
}

impl FetchRequest {
    pub fn new(url: Url, timeout: Duration) -> Self {
        Self {
            url,
            headers: HeaderMap::new(),
            timeout,
            proxies: Vec::new(),
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_proxies(mut self, proxies: Vec<String>) -> Self {
        self.proxies = proxies;
        self
    }
}

/// Response returned by a fetcher.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub elapsed: Duration,
    /// Final URL after redirects.
    pub url: Url,
}

impl FetchResponse {
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Coarse error category used for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    Timeout,
    Connection,
    Other,
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchErrorKind::Timeout => write!(f, "timeout"),
            FetchErrorKind::Connection => write!(f, "connection"),
            FetchErrorKind::Other => write!(f, "other"),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("failed to convert header '{0}'")]
    InvalidHeader(String),
    #[error("fetch tier unavailable: {0}")]
    Unavailable(String),
}

impl FetchError {
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            FetchError::Timeout(_) => FetchErrorKind::Timeout,
            FetchError::Connection(_) => FetchErrorKind::Connection,
            FetchError::Transport(message) => classify_message(message),
            FetchError::InvalidHeader(_) | FetchError::Unavailable(_) => FetchErrorKind::Other,
        }
    }
}

/// Fallback classification for transports that only report strings.
fn classify_message(message: &str) -> FetchErrorKind {
    let lower = message.to_ascii_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        FetchErrorKind::Timeout
    } else if ["connection", "connect", "refused", "reset", "closed", "dns", "unreachable"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        FetchErrorKind::Connection
    } else {
        FetchErrorKind::Other
    }
}

/// Contract shared by the HTTP and browser tiers.
///
/// Implementations must honour `request.timeout` and should keep cookies
/// between calls so the session behaves consistently.
#[async_trait]
pub trait Fetcher: Send + Sync {
    fn tier(&self) -> FetchTier;

    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError>;

    /// Drop pooled clients/cookies so the next request starts a fresh identity.
    async fn reset(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_messages_map_to_kinds() {
        assert_eq!(
            FetchError::Transport("operation timed out".into()).kind(),
            FetchErrorKind::Timeout
        );
        assert_eq!(
            FetchError::Transport("Connection reset by peer".into()).kind(),
            FetchErrorKind::Connection
        );
        assert_eq!(
            FetchError::Transport("invalid chunk".into()).kind(),
            FetchErrorKind::Other
        );
        assert_eq!(
            FetchError::Timeout(Duration::from_secs(1)).kind(),
            FetchErrorKind::Timeout
        );
    }
}
