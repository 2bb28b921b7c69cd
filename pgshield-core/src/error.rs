//! Error types for the migration safety core.

use thiserror::Error;

use crate::port::{DbError, DbErrorKind};
use crate::transaction::TransactionStatus;
use crate::verify::IntegrityViolation;

/// Result type alias for pgshield operations.
pub type GuardResult<T> = Result<T, GuardError>;

/// Errors that can occur while validating, planning, executing or verifying
/// a migration.
#[derive(Debug, Error)]
pub enum GuardError {
    /// Malformed snapshot or missing required fields. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Planning failed for a reason other than a dependency cycle.
    #[error("Planning error: {0}")]
    Planning(String),

    /// The operations form a dependency cycle and cannot be ordered.
    #[error("Cyclic dependency between operations: {}", operations.join(" -> "))]
    CyclicDependency {
        /// Descriptions of the operations left unordered.
        operations: Vec<String>,
    },

    /// A statement failed inside a transaction.
    #[error("Transaction error{}: {source}", code.as_deref().map(|c| format!(" [{c}]")).unwrap_or_default())]
    Transaction {
        /// SQLSTATE reported by the driver, if any.
        code: Option<String>,
        /// Underlying driver error.
        #[source]
        source: DbError,
    },

    /// A deadlock or serialization failure persisted through every retry.
    #[error("Deadlock retries exhausted after {retries} retries: {source}")]
    DeadlockExhausted {
        /// Number of retries actually attempted.
        retries: u32,
        /// The last deadlock error observed.
        #[source]
        source: DbError,
    },

    /// A savepoint could not be created, released or rolled back to.
    #[error("Savepoint '{name}' failed: {reason}")]
    Savepoint {
        /// Savepoint name.
        name: String,
        /// Why the savepoint operation failed.
        reason: String,
    },

    /// The transaction has already terminated.
    #[error("Transaction '{id}' is {status} and cannot be used")]
    TransactionClosed {
        /// Transaction id.
        id: String,
        /// Terminal status.
        status: TransactionStatus,
    },

    /// An operation exceeded its caller-supplied timeout.
    #[error("Operation '{operation}' timed out after {timeout_ms}ms")]
    Timeout {
        /// What was running.
        operation: String,
        /// The timeout that elapsed.
        timeout_ms: u64,
    },

    /// Integrity probes found violating rows (strict verification only).
    #[error("{} integrity violation(s) found", violations.len())]
    IntegrityViolations {
        /// Every violation found.
        violations: Vec<IntegrityViolation>,
    },

    /// The post-migration checksum does not match the expected one.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: String,
        /// Computed checksum.
        actual: String,
    },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// File system error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GuardError {
    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a planning error.
    pub fn planning(msg: impl Into<String>) -> Self {
        Self::Planning(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a savepoint error.
    pub fn savepoint(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Savepoint {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Wrap a driver error raised inside a transaction, keeping its code.
    pub fn transaction(source: DbError) -> Self {
        Self::Transaction {
            code: source.code.clone(),
            source,
        }
    }

    /// The driver error behind this error, if any.
    pub fn db_error(&self) -> Option<&DbError> {
        match self {
            Self::Transaction { source, .. } | Self::DeadlockExhausted { source, .. } => {
                Some(source)
            }
            _ => None,
        }
    }

    /// Check if this error belongs to the deadlock/serialization class.
    pub fn is_deadlock(&self) -> bool {
        match self {
            Self::Transaction { source, .. } => source.kind.is_retryable(),
            Self::DeadlockExhausted { .. } => true,
            _ => false,
        }
    }

    /// Check if another attempt could succeed.
    ///
    /// Exhausted deadlock retries are not retryable: the retry budget is spent.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transaction { source, .. } if source.kind.is_retryable())
    }

    /// Check if this is a timeout, either caller-side or server-side.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Transaction { source, .. } => matches!(
                source.kind,
                DbErrorKind::LockTimeout | DbErrorKind::QueryCanceled
            ),
            _ => false,
        }
    }
}

impl From<DbError> for GuardError {
    fn from(err: DbError) -> Self {
        Self::transaction(err)
    }
}

impl From<toml::de::Error> for GuardError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("failed to parse configuration: {err}"))
    }
}
