//! Error types for the storage lifecycle engine
//!
//! Provides structured error types for the state machine engine, the
//! backend adapter contract, the orchestrator and the reconciliation manager.

use crate::domain::entity::EntityKind;
use std::time::Duration;
use thiserror::Error;

/// Unified error type for the lifecycle engine
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // =========================================================================
    // State Machine Errors
    // =========================================================================
    #[error("Illegal transition for {kind} {entity_id}: no edge for event {event} from state {state}")]
    IllegalTransition {
        kind: EntityKind,
        entity_id: String,
        state: String,
        event: String,
    },

    #[error("Concurrent modification of {kind} {entity_id}: expected update sequence {expected_sequence}")]
    ConcurrentModification {
        kind: EntityKind,
        entity_id: String,
        expected_sequence: u64,
    },

    #[error("Duplicate transition in {kind} table: ({from}, {event}) maps to both {existing} and {conflicting}")]
    DuplicateTransition {
        kind: EntityKind,
        from: String,
        event: String,
        existing: String,
        conflicting: String,
    },

    #[error("Unsound {kind} transition table: {reason}")]
    UnsoundTransitionTable { kind: EntityKind, reason: String },

    // =========================================================================
    // Persistence Errors
    // =========================================================================
    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    #[error("Resource in use: {kind}/{name}: {reason}")]
    ResourceInUse {
        kind: String,
        name: String,
        reason: String,
    },

    // =========================================================================
    // Backend Errors
    // =========================================================================
    #[error("Backend unavailable: {backend}: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    #[error("Backend operation failed: {backend} - {operation}: {reason}")]
    BackendOperationFailed {
        backend: String,
        operation: String,
        reason: String,
    },

    #[error("Backend operation timed out: {backend} - {operation} after {timeout:?}")]
    BackendTimeout {
        backend: String,
        operation: String,
        timeout: Duration,
    },

    #[error("Ambiguous physical state of {object} on {backend}: {reason}")]
    AmbiguousPhysicalState {
        backend: String,
        object: String,
        reason: String,
    },

    // =========================================================================
    // Reconciliation Errors
    // =========================================================================
    #[error("Object {path} is not eligible for import: {reason}")]
    IneligibleForReconciliation { path: String, reason: String },

    #[error("No reachable host for storage pool {pool_id}: {reason}")]
    NoReachableHost { pool_id: String, reason: String },

    #[error("Host agent error on {host}: {reason}")]
    HostAgent { host: String, reason: String },

    // =========================================================================
    // Accounting Errors
    // =========================================================================
    #[error("Resource limit exceeded for account {account_id}: {resource} limit {limit}, requested total {requested}")]
    ResourceLimitExceeded {
        account_id: String,
        resource: String,
        limit: u64,
        requested: u64,
    },

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action a caller should take on error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Reload the entity and issue the request again
    ReloadAndRetry,
    /// Re-query the backend after a pause before deciding
    PollBackend(Duration),
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Don't retry; the request is rejected
    Reject,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Lost the optimistic-write race
            Error::ConcurrentModification { .. } => ErrorAction::ReloadAndRetry,

            // Backend truth unknown - poll before escalating
            Error::AmbiguousPhysicalState { .. } => {
                ErrorAction::PollBackend(Duration::from_secs(30))
            }

            // Transient errors - retry with backoff
            Error::BackendUnavailable { .. }
            | Error::BackendTimeout { .. }
            | Error::NoReachableHost { .. }
            | Error::HostAgent { .. }
            | Error::Http(_) => ErrorAction::RetryWithBackoff,

            // Caller/state mismatch and policy failures - reject
            Error::IllegalTransition { .. }
            | Error::IneligibleForReconciliation { .. }
            | Error::ResourceLimitExceeded { .. }
            | Error::ResourceNotFound { .. }
            | Error::ResourceExists { .. }
            | Error::ResourceInUse { .. }
            | Error::InvalidRequest(_)
            | Error::Configuration(_)
            | Error::DuplicateTransition { .. }
            | Error::UnsoundTransitionTable { .. } => ErrorAction::Reject,

            _ => ErrorAction::RetryWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::Reject)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::BackendUnavailable { .. }
                | Error::BackendTimeout { .. }
                | Error::HostAgent { .. }
                | Error::Http(_)
        )
    }
}

/// Result type alias for the lifecycle engine
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::ConcurrentModification {
            kind: EntityKind::Volume,
            entity_id: "vol-1".into(),
            expected_sequence: 3,
        };
        assert_eq!(err.action(), ErrorAction::ReloadAndRetry);

        let err = Error::AmbiguousPhysicalState {
            backend: "simulated".into(),
            object: "vol-1".into(),
            reason: "read-back failed".into(),
        };
        assert_eq!(
            err.action(),
            ErrorAction::PollBackend(Duration::from_secs(30))
        );

        let err = Error::IllegalTransition {
            kind: EntityKind::Volume,
            entity_id: "vol-1".into(),
            state: "Expunged".into(),
            event: "ResizeRequested".into(),
        };
        assert_eq!(err.action(), ErrorAction::Reject);
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::BackendUnavailable {
            backend: "simulated".into(),
            reason: "connection refused".into(),
        };
        assert!(transient.is_retryable());
        assert!(transient.is_transient());

        let ineligible = Error::IneligibleForReconciliation {
            path: "/pool/disk-1".into(),
            reason: "locked".into(),
        };
        assert!(!ineligible.is_retryable());
        assert!(!ineligible.is_transient());
    }

    #[test]
    fn test_ambiguous_is_distinct_from_unavailable() {
        let ambiguous = Error::AmbiguousPhysicalState {
            backend: "simulated".into(),
            object: "vol-1".into(),
            reason: "read-back failed".into(),
        };
        assert!(ambiguous.is_retryable());
        assert!(!ambiguous.is_transient());
    }
}
