// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the request engine.
//!
//! Two layers of errors exist:
//!
//! - [`ServiceError`] is produced at the invoker boundary. It carries a closed
//!   [`ErrorKind`] that is decided once, when the remote failure is mapped, and
//!   is the only thing the retry policy ever looks at.
//! - [`EngineError`] is what the engine's own API returns to callers.
//!
//! # Error Kinds
//!
//! | Kind | Transient | Ambiguous write | Description |
//! |------|-----------|-----------------|-------------|
//! | `Competition` | Yes | Yes | Row/resource contention on the server |
//! | `Deadlock` | Yes | Yes | Server-side deadlock victim |
//! | `Timeout` | Yes | Yes | Request timed out, outcome unknown |
//! | `Network` | Yes | No | Connection reset, DNS, TLS, 5xx gateway |
//! | `Authorization` | No | No | Session expired or missing permission |
//! | `BusinessRule` | No | No | Validation or business-rule rejection |
//! | `UnexpectedResult` | No | No | Response could not be understood |
//!
//! "Ambiguous write" kinds are never retried for transactional operations: the
//! server may have applied the write before failing.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Closed classification of remote failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Resource competition (lock wait, row in use).
    Competition,
    /// The request was chosen as a deadlock victim.
    Deadlock,
    /// The request timed out before an answer arrived.
    Timeout,
    /// Generic transient network failure.
    Network,
    /// Authentication or authorization failure.
    Authorization,
    /// Validation or business-rule rejection.
    BusinessRule,
    /// The response was malformed or otherwise unexpected.
    UnexpectedResult,
}

impl ErrorKind {
    /// Whether a retry may succeed without the caller changing anything.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Competition | Self::Deadlock | Self::Timeout | Self::Network
        )
    }

    /// Whether the failure leaves the outcome of a write unknown.
    pub fn is_ambiguous_write(&self) -> bool {
        matches!(self, Self::Competition | Self::Deadlock | Self::Timeout)
    }

    /// Stable label used for logs and metric tags.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Competition => "competition",
            Self::Deadlock => "deadlock",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::Authorization => "authorization",
            Self::BusinessRule => "business_rule",
            Self::UnexpectedResult => "unexpected_result",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure reported by an external service invoker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} error: {message}")]
pub struct ServiceError {
    /// Classification used by the retry policy.
    pub kind: ErrorKind,
    /// Human-readable detail from the remote side.
    pub message: String,
}

impl ServiceError {
    /// Create a new service error.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn competition(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Competition, message)
    }

    pub fn deadlock(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Deadlock, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn authorization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authorization, message)
    }

    pub fn business_rule(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BusinessRule, message)
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnexpectedResult, message)
    }

    /// Shortcut for `self.kind.is_transient()`.
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

/// Errors returned by the engine's public API.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The instance was disposed and no longer accepts work.
    #[error("instance has been disposed")]
    Disposed,

    /// No registry entry exists for the handle (or it has another type).
    #[error("no instance registered for handle {0}")]
    NotFound(uuid::Uuid),

    /// A paged fetch failed while loading a page.
    ///
    /// Raised to the consumer after every item decoded before the failure
    /// has been yielded.
    #[error("paged request failed at page {page}: {source}")]
    PagedRequest {
        page: u32,
        #[source]
        source: ServiceError,
    },

    /// A paged fetch exceeded its timeout.
    #[error("paged request timed out after {elapsed:?} (limit {limit:?})")]
    Timeout { elapsed: Duration, limit: Duration },

    /// A remote call failed outside of the batching/paging engines.
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A background worker could not be started or joined.
    #[error("worker error: {0}")]
    Worker(String),
}

impl EngineError {
    /// The underlying service error, if any.
    pub fn service_error(&self) -> Option<&ServiceError> {
        match self {
            Self::PagedRequest { source, .. } => Some(source),
            Self::Service(e) => Some(e),
            _ => None,
        }
    }

    /// Check if retrying the whole operation may help.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::PagedRequest { source, .. } => source.is_transient(),
            Self::Service(e) => e.is_transient(),
            Self::Timeout { .. } => true,
            Self::Disposed => false,
            Self::NotFound(_) => false,
            Self::Config(_) => false,
            Self::Worker(_) => false,
        }
    }
}
