//! SemFS REST provider
//!
//! A content provider whose resources are addressed by URIs:
//! - URIs set explicitly or derived from the parent's URI
//! - GET/PUT synchronization with ETag and Last-Modified
//! - Pluggable transport, with a blocking HTTP client by default

pub mod provider;
pub mod transport;

pub use provider::{parse_uri, RestContentProvider};
pub use transport::{state_from_headers, HttpTransport, RestTransport, TransportError, DEFAULT_TIMEOUT};
