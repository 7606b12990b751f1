//! Error taxonomy for the semantic file system

use std::fmt;

/// Result type for semantic file system operations
pub type Result<T> = std::result::Result<T, SemanticError>;

/// Optional provider capability, named in `MethodNotSupported` errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Local,
    Remote,
    Rest,
    Federation,
    Locking,
}

impl Capability {
    pub fn name(&self) -> &'static str {
        match self {
            Capability::Local => "Local",
            Capability::Remote => "Remote",
            Capability::Rest => "REST",
            Capability::Federation => "Federation",
            Capability::Locking => "Locking",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors that can occur in the tree, the providers or the cache
#[derive(Debug, thiserror::Error)]
pub enum SemanticError {
    #[error("Unknown content provider id: {0}")]
    UnknownProviderId(String),

    #[error("Resource already exists: {0}")]
    ResourceAlreadyExists(String),

    #[error("Resource exists with other type: {path} is a {existing}")]
    ResourceWithOtherTypeExists { path: String, existing: String },

    #[error("Parent of resource does not exist: {0}")]
    ResourceParentMissing(String),

    #[error("Invalid resource type for {path}: {kind}")]
    InvalidResourceType { path: String, kind: String },

    #[error("Method {method} not supported: provider {provider} does not implement the {capability} capability")]
    MethodNotSupported {
        capability: Capability,
        method: &'static str,
        provider: String,
    },

    #[error("Store not found: {0}")]
    StoreNotFound(String),

    #[error("Lock conflict: {0}")]
    LockConflict(String),

    #[error("Cached content not found: {0}")]
    CachedContentNotFound(String),

    #[error("Remote resource not found: {0}")]
    RemoteResourceNotFound(String),

    #[error("Remote connect exception for {uri}: {message}")]
    RemoteConnectException { uri: String, message: String },

    #[error("Invalid URI syntax: {0}")]
    InvalidUriSyntax(String),

    #[error("Invalid resource name: {0:?}")]
    InvalidResourceName(String),

    #[error("Invalid property key: {0:?}")]
    InvalidPropertyKey(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Cache error: {0}")]
    Cache(String),
}

impl SemanticError {
    pub(crate) fn not_supported(
        capability: Capability,
        method: &'static str,
        provider: &str,
    ) -> Self {
        SemanticError::MethodNotSupported {
            capability,
            method,
            provider: provider.to_string(),
        }
    }
}

impl From<serde_json::Error> for SemanticError {
    fn from(e: serde_json::Error) -> Self {
        SemanticError::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for SemanticError {
    fn from(e: bincode::Error) -> Self {
        SemanticError::Serialization(e.to_string())
    }
}
