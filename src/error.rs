//! Error types for the Hemmer reconciliation engine.

use crate::schema::Diagnostic;
use crate::state::InstanceAddress;
use thiserror::Error;

/// Errors returned by a [`ResourceProvider`](crate::provider::ResourceProvider).
///
/// The provider classifies its own failures. The engine never inspects error
/// messages to decide whether something is worth retrying.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// The remote object does not exist.
    ///
    /// Used for drift detection and as the idempotence signal for deletes.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// A transient condition such as rate limiting or eventual consistency.
    #[error("Retryable error: {0}")]
    Retryable(String),

    /// A permanent failure. The action fails and its dependents are skipped.
    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl ProviderError {
    /// Get the error message as a string.
    pub fn message(&self) -> &str {
        match self {
            Self::NotFound(msg) => msg,
            Self::Retryable(msg) => msg,
            Self::Fatal(msg) => msg,
        }
    }

    /// Returns `true` if the error should be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    /// Returns `true` if the remote object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Errors raised by the engine itself.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A configured attribute is not part of the resource schema, or cannot
    /// be set from configuration.
    #[error("Schema mismatch for {address}: {reason}")]
    SchemaMismatch {
        /// The offending instance.
        address: InstanceAddress,
        /// What did not match.
        reason: String,
    },

    /// Configuration failed schema validation.
    #[error("Validation failed for {address}: {}", summarize(.diagnostics))]
    Validation {
        /// The offending instance.
        address: InstanceAddress,
        /// The validation errors.
        diagnostics: Vec<Diagnostic>,
    },

    /// The dependency graph contains a cycle.
    #[error("Cyclic dependency between: {}", join_addresses(.0))]
    CyclicDependency(Vec<InstanceAddress>),

    /// The state snapshot changed underneath us.
    #[error("State conflict: expected version {expected}, found {found}")]
    StateConflict {
        /// The version the writer based its change on.
        expected: u64,
        /// The version currently stored.
        found: u64,
    },

    /// Another process holds the state lock.
    #[error("State is locked by {holder} (lock {lock_id})")]
    StateLocked {
        /// Who holds the lock.
        holder: String,
        /// The lock identifier.
        lock_id: String,
    },

    /// The resource type has no registered schema.
    #[error("Unknown resource type: {0}")]
    UnknownResource(String),

    /// A schema was registered twice with different definitions.
    #[error("Schema error: {0}")]
    Schema(String),

    /// A provider call failed for an instance.
    #[error("Provider error for {address}: {source}")]
    Provider {
        /// The instance the call was made for.
        address: InstanceAddress,
        /// The provider's error.
        #[source]
        source: ProviderError,
    },

    /// The task running an action died before reporting a result.
    #[error("Action for {address} aborted: {reason}")]
    ActionAborted {
        /// The instance the action was for.
        address: InstanceAddress,
        /// Whether the task panicked or was cancelled.
        reason: String,
    },

    /// An instance address is already present in state.
    #[error("Resource already managed: {0}")]
    AlreadyManaged(InstanceAddress),

    /// The run was cancelled before it could finish.
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid engine configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// The instance this error is about, if any.
    pub fn address(&self) -> Option<&InstanceAddress> {
        match self {
            Self::SchemaMismatch { address, .. }
            | Self::Validation { address, .. }
            | Self::Provider { address, .. }
            | Self::ActionAborted { address, .. }
            | Self::AlreadyManaged(address) => Some(address),
            _ => None,
        }
    }

    /// Returns `true` if the caller should re-read state and re-plan.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::StateConflict { .. } | Self::StateLocked { .. })
    }
}

/// Result alias used throughout the engine.
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

fn summarize(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .map(|d| match &d.attribute {
            Some(attr) => format!("{} ({})", d.summary, attr),
            None => d.summary.clone(),
        })
        .collect::<Vec<_>>()
        .join("; ")
}

fn join_addresses(addresses: &[InstanceAddress]) -> String {
    addresses
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
