//! Structured status results and cancellation
//!
//! Validation calls and capability-gated delegations return a [`Status`]
//! instead of failing. Tree walks collect per-resource outcomes into a
//! [`MultiStatus`] so one failing child never aborts its siblings.

use crate::error::SemanticError;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Severity of a status entry, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Ok,
    Info,
    Warning,
    Error,
    Cancel,
}

/// Outcome of a single operation on a single resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub severity: Severity,
    pub message: String,
    pub path: Option<String>,
}

impl Status {
    pub fn ok() -> Self {
        Self {
            severity: Severity::Ok,
            message: String::new(),
            path: None,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::with(Severity::Info, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::with(Severity::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::with(Severity::Error, message)
    }

    pub fn cancel() -> Self {
        Self::with(Severity::Cancel, "Operation cancelled")
    }

    fn with(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            path: None,
        }
    }

    pub fn from_error(path: &str, error: &SemanticError) -> Self {
        let severity = match error {
            SemanticError::Cancelled => Severity::Cancel,
            _ => Severity::Error,
        };
        Self {
            severity,
            message: error.to_string(),
            path: Some(path.to_string()),
        }
    }

    pub fn at(mut self, path: &str) -> Self {
        self.path = Some(path.to_string());
        self
    }

    pub fn is_ok(&self) -> bool {
        self.severity == Severity::Ok
    }

    /// True for `Ok`, `Info` and `Warning`
    pub fn is_acceptable(&self) -> bool {
        self.severity < Severity::Error
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "[{:?}] {}: {}", self.severity, path, self.message),
            None => write!(f, "[{:?}] {}", self.severity, self.message),
        }
    }
}

/// Aggregate of statuses collected during a tree walk
#[derive(Debug, Clone, Default)]
pub struct MultiStatus {
    entries: Vec<Status>,
}

impl MultiStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, status: Status) {
        if status.severity != Severity::Ok {
            self.entries.push(status);
        }
    }

    pub fn add_error(&mut self, path: &str, error: &SemanticError) {
        tracing::debug!(path, %error, "recording failure in aggregate status");
        self.add(Status::from_error(path, error));
    }

    pub fn merge(&mut self, other: MultiStatus) {
        self.entries.extend(other.entries);
    }

    /// Most severe entry, `Ok` when empty
    pub fn severity(&self) -> Severity {
        self.entries
            .iter()
            .map(|s| s.severity)
            .max()
            .unwrap_or(Severity::Ok)
    }

    pub fn is_ok(&self) -> bool {
        self.severity() < Severity::Error
    }

    pub fn entries(&self) -> &[Status] {
        &self.entries
    }

    pub fn errors(&self) -> impl Iterator<Item = &Status> {
        self.entries.iter().filter(|s| s.severity >= Severity::Error)
    }
}

/// Cooperative cancellation flag checked by long traversals
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancelled
    pub fn check(&self) -> Result<(), SemanticError> {
        if self.is_cancelled() {
            Err(SemanticError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multistatus_severity() {
        let mut status = MultiStatus::new();
        assert!(status.is_ok());
        status.add(Status::ok());
        assert!(status.entries().is_empty());

        status.add(Status::warning("stale").at("/p/a"));
        assert!(status.is_ok());
        status.add_error("/p/b", &SemanticError::RemoteResourceNotFound("/p/b".into()));
        assert_eq!(status.severity(), Severity::Error);
        assert!(!status.is_ok());
        assert_eq!(status.errors().count(), 1);
    }

    #[test]
    fn test_cancellation_token_is_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(clone.check().is_ok());
        token.cancel();
        assert!(matches!(clone.check(), Err(SemanticError::Cancelled)));
    }
}
