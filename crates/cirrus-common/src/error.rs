//! Error types for the Cirrus compute engine
//!
//! Errors carry enough context (resource names, backend operations, status
//! codes) to be actionable from a log line or a status message. `Yield`
//! propagates through `?` like any other early return; callers check
//! [`Error::is_yield`] and requeue instead of reporting a failure.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Cirrus operations
#[derive(Debug, Error)]
pub enum Error {
    /// An asynchronous dependency has not settled yet; retry later
    #[error("yielding: {reason}")]
    Yield {
        /// What is being waited on
        reason: String,
    },

    /// Backend data already violates an invariant the engine relies on
    #[error("consistency error for {resource}: {message}")]
    Consistency {
        /// Resource whose backend state is inconsistent
        resource: String,
        /// Description of the violated invariant
        message: String,
    },

    /// An upstream dependency reported a status the engine does not recognize
    #[error("{kind} {id} reported unrecognized status '{status}'")]
    DependencyStatus {
        /// Dependency kind (identity, network)
        kind: String,
        /// Backend identifier of the dependency
        id: String,
        /// The raw status string
        status: String,
    },

    /// A backend responded outside the expected status-code contract
    #[error("backend returned status {code} for {operation}")]
    BackendStatus {
        /// The backend operation that was attempted (e.g. "create server")
        operation: String,
        /// The HTTP status code received
        code: u16,
    },

    /// Transport failure talking to a backend (connection, TLS, decoding)
    #[error("transport error during {operation}: {message}")]
    Transport {
        /// The backend operation that was attempted
        operation: String,
        /// Description of what failed
        message: String,
    },

    /// Optimistic concurrency conflict or a conflicting request
    #[error("conflict on {resource}: {message}")]
    Conflict {
        /// Resource that conflicted
        resource: String,
        /// Description of the conflict
        message: String,
    },

    /// A requested object does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Kind of the missing object
        kind: String,
        /// Name or identifier of the missing object
        name: String,
    },

    /// Request or spec validation failed
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Resource with invalid configuration
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.workloadPools[0].name")
        field: Option<String>,
    },

    /// An eviction failed part way; `deleted` lists machines already removed
    #[error("eviction failed after deleting {deleted:?}: {source}")]
    EvictionFailed {
        /// Server IDs whose backend deletion was accepted before the failure
        deleted: Vec<String>,
        /// The failure that aborted the eviction
        source: Box<Error>,
    },

    /// A saga step failed and at least one compensation also failed
    #[error("{source} (compensations failed: {})", .failures.join("; "))]
    CompensationFailed {
        /// Messages from the failed compensations, in unwind order
        failures: Vec<String>,
        /// The original step failure
        source: Box<Error>,
    },

    /// The pass deadline elapsed or the pass was cancelled
    #[error("cancelled during {operation}")]
    Cancelled {
        /// The operation that was interrupted
        operation: String,
    },

    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a yield signal
    pub fn yield_for(reason: impl Into<String>) -> Self {
        Self::Yield {
            reason: reason.into(),
        }
    }

    /// Create a consistency error
    pub fn consistency(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Consistency {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a dependency status error
    pub fn dependency_status(
        kind: impl Into<String>,
        id: impl Into<String>,
        status: impl Into<String>,
    ) -> Self {
        Self::DependencyStatus {
            kind: kind.into(),
            id: id.into(),
            status: status.into(),
        }
    }

    /// Create a backend status error
    pub fn backend_status(operation: impl Into<String>, code: u16) -> Self {
        Self::BackendStatus {
            operation: operation.into(),
            code,
        }
    }

    /// Create a transport error
    pub fn transport(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context and field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether this is a yield signal rather than a failure
    pub fn is_yield(&self) -> bool {
        matches!(self, Self::Yield { .. })
    }

    /// Whether this is an optimistic concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Whether this is a not-found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether the scheduler should retry this error with backoff
    ///
    /// Validation failures need a spec change before a retry can succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Validation { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            message: e.to_string(),
            kind: None,
        }
    }
}
