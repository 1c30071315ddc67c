//! Error types for the reconciler crate.
//!
//! Provider failures are not errors at this level: they are classified into
//! an [`OperationOutcome`](crate::types::OperationOutcome) and absorbed by the
//! phase machine. What remains here is bookkeeping failure.

use std::fmt;

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reconciler error types.
#[derive(Debug, Clone)]
pub enum Error {
    /// The record store could not complete an operation.
    StoreFailed { operation: String, reason: String },
    /// Record not found.
    RecordNotFound { id: String },
    /// A record with the same id is already queued.
    DuplicateRecord { id: String },
    /// The caller no longer holds the lease on the record.
    LeaseLost { id: String, owner: String },
    /// The planned call does not belong to the record's phase.
    InvalidTransition { phase: String, call: String },
    /// Invalid configuration.
    InvalidConfig { reason: String },
    /// The provider call permits were closed.
    PermitsClosed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StoreFailed { operation, reason } => {
                write!(f, "record store '{operation}' failed: {reason}")
            }
            Self::RecordNotFound { id } => {
                write!(f, "record '{id}' not found")
            }
            Self::DuplicateRecord { id } => {
                write!(f, "record '{id}' is already queued for deletion")
            }
            Self::LeaseLost { id, owner } => {
                write!(f, "lease on record '{id}' is not held by '{owner}'")
            }
            Self::InvalidTransition { phase, call } => {
                write!(f, "call '{call}' is not valid in phase {phase}")
            }
            Self::InvalidConfig { reason } => {
                write!(f, "invalid configuration: {reason}")
            }
            Self::PermitsClosed => {
                write!(f, "provider call permits closed")
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<teardown_core::Error> for Error {
    fn from(err: teardown_core::Error) -> Self {
        Self::store_failed("io", err.to_string())
    }
}

impl Error {
    /// Create a store failed error.
    pub fn store_failed(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StoreFailed {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a record not found error.
    pub fn record_not_found(id: impl Into<String>) -> Self {
        Self::RecordNotFound { id: id.into() }
    }

    /// Create a duplicate record error.
    pub fn duplicate_record(id: impl Into<String>) -> Self {
        Self::DuplicateRecord { id: id.into() }
    }

    /// Create a lease lost error.
    pub fn lease_lost(id: impl Into<String>, owner: impl Into<String>) -> Self {
        Self::LeaseLost {
            id: id.into(),
            owner: owner.into(),
        }
    }

    /// Create an invalid transition error.
    pub fn invalid_transition(phase: impl Into<String>, call: impl Into<String>) -> Self {
        Self::InvalidTransition {
            phase: phase.into(),
            call: call.into(),
        }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::store_failed("commit", "disk full");
        assert!(err.to_string().contains("commit"));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_lease_lost_names_owner() {
        let err = Error::lease_lost("vm-1", "worker-a");
        assert!(err.to_string().contains("vm-1"));
        assert!(err.to_string().contains("worker-a"));
    }

    #[test]
    fn test_core_error_converts_to_store_failure() {
        let err: Error = teardown_core::Error::file_write_failed("/tmp/x", "denied").into();
        assert!(matches!(err, Error::StoreFailed { .. }));
    }
}
