//! Error types for receipt intake.

use std::time::Duration;

use crate::access::{Permission, Principal};

/// Top-level error type for the intake service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Parameter error: {0}")]
    Parameter(#[from] ParameterError),

    #[error("Invocation error: {0}")]
    Invoke(#[from] InvokeError),

    #[error("Routing error: {0}")]
    Route(#[from] RouteError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    #[error("Cost monitor error: {0}")]
    Cost(#[from] CostError),
}

/// A principal attempted an action outside its granted scope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Access denied: {principal} may not {permission} on {resource}")]
pub struct AccessDenied {
    pub principal: Principal,
    pub permission: Permission,
    pub resource: String,
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors (libSQL backend).
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Artifact store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Artifact not found: {key}")]
    NotFound { key: String },

    #[error(transparent)]
    AccessDenied(#[from] AccessDenied),

    #[error("Failed to write artifact {key}: {reason}")]
    WriteFailure { key: String, reason: String },

    #[error("Invalid artifact key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Storage backend error: {0}")]
    Backend(#[from] DatabaseError),
}

/// Secret/allow-list parameter errors.
#[derive(Debug, thiserror::Error)]
pub enum ParameterError {
    #[error("Parameter not found: {path}")]
    NotFound { path: String },

    #[error(transparent)]
    AccessDenied(#[from] AccessDenied),
}

/// Processor invocation errors.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("Concurrency budget of {limit} exhausted, retry after {retry_after:?}")]
    ConcurrencyExhausted { limit: usize, retry_after: Duration },

    #[error("Invocation for {key} timed out after {timeout:?}")]
    Timeout { key: String, timeout: Duration },

    #[error("Invocation for {key} failed: {source}")]
    Failed {
        key: String,
        #[source]
        source: ProcessorError,
    },

    #[error("Invocation for {key} succeeded but tagging failed: {source}")]
    TagFailed {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    AccessDenied(#[from] AccessDenied),
}

impl InvokeError {
    /// Whether the caller may retry the same dispatch later.
    ///
    /// Only throttling is retryable by the caller; timeouts and failures go to
    /// external reprocessing.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyExhausted { .. })
    }

    /// Suggested backoff for retryable errors.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::ConcurrencyExhausted { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Errors raised by the processing collaborator.
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Parameter error: {0}")]
    Parameter(#[from] ParameterError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Extraction failed: {0}")]
    Extraction(String),
}

/// A single action in a routing chain failed.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("Store write failed: {0}")]
    StoreWriteFailure(#[source] StoreError),

    #[error("Invoke failed: {0}")]
    Invoke(#[from] InvokeError),

    #[error("Action {action} requires a stored artifact but none was produced")]
    MissingArtifact { action: String },
}

/// Routing errors raised before any action runs.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("No routing rule for recipient {recipient}")]
    NoMatchingRule { recipient: String },

    #[error("Invalid relay message id {id:?}")]
    InvalidMessageId { id: String },
}

/// Outbound email and pub/sub errors.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Failed to send email: {reason}")]
    SendFailed { reason: String },

    #[error("Failed to publish to topic {topic}: {reason}")]
    PublishFailed { topic: String, reason: String },

    #[error(transparent)]
    AccessDenied(#[from] AccessDenied),
}

/// Cost monitoring errors.
#[derive(Debug, thiserror::Error)]
pub enum CostError {
    #[error("Invalid cost check schedule: {0}")]
    Schedule(String),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}
