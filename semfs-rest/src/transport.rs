//! HTTP transport for REST-backed content
//!
//! The provider only ever needs three verbs, so the transport is a narrow
//! trait. [`HttpTransport`] implements it over a blocking `reqwest` client.

use bytes::Bytes;
use chrono::DateTime;
use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, ETAG, LAST_MODIFIED};
use reqwest::StatusCode;
use semfs_core::{RemoteState, SemanticError};
use std::time::Duration;
use url::Url;

/// Default request timeout of [`HttpTransport::new`]
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Transport-level failures
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP client setup failed: {0}")]
    Client(String),

    #[error("request to {url} failed: {message}")]
    Connect { url: String, message: String },

    #[error("{url} answered HTTP {status}")]
    Status { url: String, status: u16 },
}

impl From<TransportError> for SemanticError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Status { url, status } if status == StatusCode::NOT_FOUND.as_u16() => {
                SemanticError::RemoteResourceNotFound(url)
            }
            TransportError::Status { url, status } => SemanticError::RemoteConnectException {
                uri: url,
                message: format!("HTTP {}", status),
            },
            TransportError::Connect { url, message } => {
                SemanticError::RemoteConnectException { uri: url, message }
            }
            TransportError::Client(message) => SemanticError::RemoteConnectException {
                uri: String::new(),
                message,
            },
        }
    }
}

/// The verbs a REST provider needs from its server
pub trait RestTransport: Send + Sync {
    /// Remote state of `url`, `None` if the server does not know it
    fn head(&self, url: &Url) -> Result<Option<RemoteState>, TransportError>;

    fn get(&self, url: &Url) -> Result<(Bytes, RemoteState), TransportError>;

    /// Replace the resource at `url`; returns the state the server reports afterwards
    fn put(&self, url: &Url, content: Bytes) -> Result<RemoteState, TransportError>;
}

/// Remote state from `ETag` and `Last-Modified`
///
/// A missing or unparsable `Last-Modified` leaves the timestamp unknown.
pub fn state_from_headers(headers: &HeaderMap) -> RemoteState {
    let etag = headers
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    let timestamp = headers
        .get(LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| DateTime::parse_from_rfc2822(v.trim()).ok())
        .map(|d| d.timestamp_millis());
    if timestamp.is_none() {
        tracing::debug!(etag = ?etag, "no usable Last-Modified header");
    }
    RemoteState { timestamp, etag }
}

/// Blocking HTTP transport
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, TransportError> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("semfs/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Client(e.to_string()))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn check(url: &Url, response: Response) -> Result<Response, TransportError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(TransportError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            })
        }
    }
}

fn connect_error(url: &Url, e: reqwest::Error) -> TransportError {
    TransportError::Connect {
        url: url.to_string(),
        message: e.to_string(),
    }
}

impl RestTransport for HttpTransport {
    fn head(&self, url: &Url) -> Result<Option<RemoteState>, TransportError> {
        let response = self
            .client
            .head(url.clone())
            .send()
            .map_err(|e| connect_error(url, e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check(url, response)?;
        Ok(Some(state_from_headers(response.headers())))
    }

    fn get(&self, url: &Url) -> Result<(Bytes, RemoteState), TransportError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .map_err(|e| connect_error(url, e))?;
        let response = Self::check(url, response)?;
        let state = state_from_headers(response.headers());
        let content = response.bytes().map_err(|e| connect_error(url, e))?;
        tracing::debug!(%url, bytes = content.len(), "downloaded");
        Ok((content, state))
    }

    fn put(&self, url: &Url, content: Bytes) -> Result<RemoteState, TransportError> {
        let size = content.len();
        let response = self
            .client
            .put(url.clone())
            .body(content)
            .send()
            .map_err(|e| connect_error(url, e))?;
        let response = Self::check(url, response)?;
        tracing::debug!(%url, bytes = size, "uploaded");
        Ok(state_from_headers(response.headers()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_state_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(ETAG, HeaderValue::from_static("\"abc\""));
        headers.insert(LAST_MODIFIED, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));

        let state = state_from_headers(&headers);
        assert_eq!(state.etag.as_deref(), Some("\"abc\""));
        assert_eq!(state.timestamp, Some(1_445_412_480_000));
    }

    #[test]
    fn test_state_without_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(LAST_MODIFIED, HeaderValue::from_static("yesterday"));

        let state = state_from_headers(&headers);
        assert_eq!(state.etag, None);
        assert_eq!(state.timestamp, None);
        assert_eq!(state_from_headers(&HeaderMap::new()).timestamp, None);
    }

    #[test]
    fn test_error_mapping() {
        let missing: SemanticError = TransportError::Status {
            url: "http://h/x".to_string(),
            status: 404,
        }
        .into();
        assert!(matches!(missing, SemanticError::RemoteResourceNotFound(url) if url == "http://h/x"));

        let refused: SemanticError = TransportError::Connect {
            url: "http://h/x".to_string(),
            message: "connection refused".to_string(),
        }
        .into();
        assert!(matches!(refused, SemanticError::RemoteConnectException { .. }));
    }
}
