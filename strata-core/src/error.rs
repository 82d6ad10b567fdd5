//! Error types for STRATA operations

use thiserror::Error;

/// Record store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Load failed for record {key}: {reason}")]
    LoadFailed { key: String, reason: String },

    #[error("Merge failed: {reason}")]
    MergeFailed { reason: String },

    #[error("Remove failed for record {key}: {reason}")]
    RemoveFailed { key: String, reason: String },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

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
    ParseFailed { reason: String },
}

/// Master error type for all STRATA errors.
///
/// This is the only error that crosses a call's async boundary; it is
/// delivered through the call's failure event.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StrataError {
    /// Data required by the operation is not in the store.
    #[error("Cache miss for {operation}: {reason}")]
    CacheMiss { operation: String, reason: String },

    /// A response body or cached tree did not match the expected shape.
    #[error("Parse error: {reason}")]
    Parse { reason: String },

    /// Transport-level failure with no usable response.
    #[error("Network error: {reason}")]
    Network { reason: String },

    /// Non-2xx response with a body present.
    #[error("HTTP {status} {message}")]
    Http {
        status: u16,
        message: String,
        body: Option<String>,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Call canceled: {operation}")]
    Canceled { operation: String },

    #[error("Illegal state: {reason}")]
    IllegalState { reason: String },
}

impl StrataError {
    pub fn cache_miss(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CacheMiss {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn parse(reason: impl Into<String>) -> Self {
        Self::Parse {
            reason: reason.into(),
        }
    }

    pub fn illegal_state(reason: impl Into<String>) -> Self {
        Self::IllegalState {
            reason: reason.into(),
        }
    }

    pub fn is_cache_miss(&self) -> bool {
        matches!(self, Self::CacheMiss { .. })
    }

    /// Whether a multi-branch fetch policy may recover from this error by
    /// consulting the other source.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::CacheMiss { .. }
                | Self::Network { .. }
                | Self::Http { .. }
                | Self::Parse { .. }
                | Self::Storage(_)
        )
    }
}

/// Result type alias for STRATA operations.
pub type StrataResult<T> = Result<T, StrataError>;

// =============================================================================
// TESTS
// =============================================================================
