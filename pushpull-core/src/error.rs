//! Error types for PUSHPULL operations

use serde_json::Value;
use thiserror::Error;

use crate::function::InvalidFunctionName;

/// An error reported by the backend itself.
///
/// The bridge never rewrites these: whatever the backend rejected with is what
/// the caller observes.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,
    /// Structured application data attached to the error, if any.
    pub data: Option<Value>,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(message: impl Into<String>, data: Value) -> Self {
        Self {
            message: message.into(),
            data: Some(data),
        }
    }
}

/// Malformed arguments passed to key building.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ArgumentShapeError {
    #[error("Arguments must be a record, got {found}")]
    NotARecord { found: String },

    #[error("Arguments could not be serialized: {reason}")]
    Unserializable { reason: String },
}

/// A backend subscription failed or ended abnormally.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SubscriptionError {
    #[error("Failed to open subscription to {function}: {source}")]
    OpenFailed {
        function: String,
        #[source]
        source: BackendError,
    },

    #[error("Subscription to {function} terminated: {source}")]
    Terminated {
        function: String,
        #[source]
        source: BackendError,
    },

    #[error("Subscription {query_hash} was released before it produced a value")]
    Released { query_hash: String },

    #[error("Gave up resubscribing to {function} after {attempts} attempts")]
    RetriesExhausted { function: String, attempts: u32 },
}

/// A one-shot action or mutation failed.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum InvocationError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Result of {function} did not match the declared return type: {reason}")]
    Decode { function: String, reason: String },
}

/// The bridge was used before `connect()`.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("Query bridge used before connect(): call connect() with the query client first")]
pub struct NotConnectedError;

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// The outcome of a failed cache fetch.
///
/// Query functions installed into the pull cache resolve with this type, so
/// it is what a cache entry's error state holds.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error(transparent)]
    Invocation(#[from] InvocationError),

    #[error(transparent)]
    ArgumentShape(#[from] ArgumentShapeError),

    #[error("Skipped query {query_hash} should not actually be run, it should be disabled")]
    Skipped { query_hash: String },

    #[error("Query {query_hash} does not belong to the bridge and no other query function was given")]
    ForeignKey { query_hash: String },

    #[error("No query function available for {query_hash}")]
    MissingQueryFn { query_hash: String },

    #[error("Query bridge has been dropped or disconnected")]
    Disconnected,

    #[error("Cached value does not match the declared return type: {reason}")]
    Decode { reason: String },
}

impl FetchError {
    /// Whether retrying the same fetch could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Subscription(SubscriptionError::Terminated { .. })
                | FetchError::Subscription(SubscriptionError::OpenFailed { .. })
                | FetchError::Invocation(InvocationError::Backend(_))
        )
    }
}

/// Master error type for all PUSHPULL errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BridgeError {
    #[error(transparent)]
    NotConnected(#[from] NotConnectedError),

    #[error("Query bridge is already connected to a different query client")]
    AlreadyConnected,

    #[error(transparent)]
    FunctionName(#[from] InvalidFunctionName),

    #[error("Argument error: {0}")]
    ArgumentShape(#[from] ArgumentShapeError),

    #[error("Subscription error: {0}")]
    Subscription(#[from] SubscriptionError),

    #[error("Invocation error: {0}")]
    Invocation(#[from] InvocationError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Bridge lock poisoned")]
    LockPoisoned,
}

/// Result type alias for PUSHPULL operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

// =============================================================================
// TESTS
// =============================================================================
