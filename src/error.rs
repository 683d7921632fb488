//! Error types for the trellis reconciliation engine.
//!
//! This module provides a comprehensive error hierarchy for all stages of
//! the reconciliation lifecycle: configuration, graph construction, state
//! management, adapter calls, and plan application.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the trellis reconciliation engine.
#[derive(Debug, Error)]
pub enum TrellisError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Dependency graph errors.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Resource adapter errors.
    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    /// Plan application errors.
    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The manifest file was not found.
    #[error("Manifest file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The manifest file could not be parsed.
    #[error("Failed to parse manifest: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Manifest validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// Duplicate resource declaration.
    #[error("Duplicate resource declaration: {identity}")]
    DuplicateResource {
        /// The duplicated `type.name` identity.
        identity: String,
    },
}

/// Dependency graph errors.
///
/// These fail a plan before any adapter call is made.
#[derive(Debug, Error)]
pub enum GraphError {
    /// A reference points at a resource that is not declared.
    #[error("Unresolved reference in {from}: no declared resource matches '{reference}'")]
    UnresolvedReference {
        /// Identity of the declaring resource.
        from: String,
        /// The reference that failed to resolve.
        reference: String,
    },

    /// Circular references between resources.
    #[error("Dependency cycle detected: {cycle}")]
    Cycle {
        /// The cycle path, rendered `a.b -> c.d -> a.b`.
        cycle: String,
    },

    /// A reference marker that does not follow `${type.name.attribute}`.
    #[error("Invalid reference '{marker}' in {from}: {reason}")]
    InvalidReference {
        /// Identity of the declaring resource.
        from: String,
        /// The malformed marker text.
        marker: String,
        /// Why the marker could not be parsed.
        reason: String,
    },
}

/// State management errors.
///
/// These are fatal: a run aborts rather than continue against a state
/// store it cannot trust.
#[derive(Debug, Error)]
pub enum StateError {
    /// State file not found.
    #[error("State file not found: {path}")]
    NotFound {
        /// Path to the missing state file.
        path: PathBuf,
    },

    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Resource adapter errors.
///
/// An adapter failure is isolated to the resource it occurred on; the
/// executor reports the transitive dependents as blocked and continues
/// with independent work.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Authentication failed.
    #[error("Adapter authentication failed: {message}")]
    AuthenticationFailed {
        /// Description of the auth failure.
        message: String,
    },

    /// Remote request failed.
    #[error("Adapter request failed: {status} - {message}")]
    RequestFailed {
        /// HTTP status code.
        status: u16,
        /// Error message from the endpoint.
        message: String,
    },

    /// Rate limited.
    #[error("Adapter rate limited, retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// Resource not found on the remote side.
    #[error("Resource not found: {identity}")]
    NotFound {
        /// The missing `type.name` identity.
        identity: String,
    },

    /// No adapter registered for a resource type.
    #[error("No adapter registered for resource type: {kind}")]
    UnsupportedKind {
        /// The unhandled resource type.
        kind: String,
    },

    /// Network error.
    #[error("Network error communicating with adapter endpoint: {message}")]
    NetworkError {
        /// Description of the network error.
        message: String,
    },

    /// Invalid response from the remote endpoint.
    #[error("Invalid response from adapter endpoint: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },

    /// Timeout on an adapter operation.
    #[error("Timeout during {operation} of {identity}")]
    Timeout {
        /// The `type.name` identity.
        identity: String,
        /// The operation that timed out.
        operation: String,
    },
}

/// Plan application errors.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// An operation failed against the adapter.
    #[error("Failed to {operation} {identity}: {reason}")]
    OperationFailed {
        /// The operation that failed (create, update, delete).
        operation: String,
        /// The `type.name` identity.
        identity: String,
        /// Reason for failure.
        reason: String,
    },

    /// Maximum convergence attempts exceeded.
    #[error("Maximum convergence attempts ({attempts}) exceeded, {pending} resources still pending")]
    MaxAttemptsExceeded {
        /// Number of attempts made.
        attempts: u32,
        /// Resources still not converged.
        pending: usize,
    },

    /// A reference could not be resolved against live outputs.
    #[error("Unresolved output for {identity}: {reference}")]
    UnresolvedOutput {
        /// Identity of the resource being applied.
        identity: String,
        /// The reference whose target produced no such attribute.
        reference: String,
    },

    /// The run was aborted.
    #[error("Run aborted: {reason}")]
    Aborted {
        /// Reason for abort.
        reason: String,
    },
}

/// Result type alias for trellis operations.
pub type Result<T> = std::result::Result<T, TrellisError>;

impl TrellisError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Adapter(
                AdapterError::RateLimited { .. } | AdapterError::NetworkError { .. }
            ) | Self::State(StateError::LockFailed { .. })
        )
    }

    /// Returns the suggested retry delay in seconds, if applicable.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::Adapter(AdapterError::RateLimited { retry_after_secs }) => {
                Some(*retry_after_secs)
            }
            Self::Adapter(AdapterError::NetworkError { .. }) => Some(5),
            Self::State(StateError::LockFailed { .. }) => Some(2),
            _ => None,
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

impl AdapterError {
    /// Creates a request error from an HTTP status and message.
    #[must_use]
    pub fn request(status: u16, message: impl Into<String>) -> Self {
        Self::RequestFailed {
            status,
            message: message.into(),
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError {
            message: message.into(),
        }
    }

    /// Returns true if the failure is transient and worth retrying.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::NetworkError { .. } | Self::Timeout { .. }
        )
    }
}
