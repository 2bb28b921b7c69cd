//! Error types for PostgreSQL operations.

use pgshield_core::{DbError, DbErrorKind, GuardError, classify_sqlstate};
use thiserror::Error;

/// Result type for PostgreSQL operations.
pub type PgResult<T> = Result<T, PgError>;

/// Errors that can occur during PostgreSQL operations.
#[derive(Error, Debug)]
pub enum PgError {
    /// Connection pool error.
    #[error("pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// PostgreSQL error.
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Connection error.
    #[error("connection error: {0}")]
    Connection(String),

    /// Catalog rows could not be turned into a snapshot.
    #[error("introspection error: {0}")]
    Introspection(String),

    /// Timeout error.
    #[error("operation timed out after {0}ms")]
    Timeout(u64),
}

impl PgError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Create an introspection error.
    pub fn introspection(message: impl Into<String>) -> Self {
        Self::Introspection(message.into())
    }

    /// SQLSTATE reported by the server, if any.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Self::Postgres(e) => e.code().map(|c| c.code()),
            _ => None,
        }
    }

    /// Check if this is a connection error.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Pool(_) | Self::Connection(_))
            || self.sqlstate().is_some_and(|c| c.starts_with("08"))
    }

    /// Check if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl From<PgError> for DbError {
    fn from(err: PgError) -> Self {
        match &err {
            PgError::Postgres(e) => {
                let message = e
                    .as_db_error()
                    .map(|db| db.message().to_string())
                    .unwrap_or_else(|| e.to_string());
                DbError::new(
                    classify_sqlstate(err.sqlstate(), &message),
                    err.sqlstate().map(str::to_string),
                    message,
                )
            }
            PgError::Pool(_) | PgError::Connection(_) => DbError::connection(err.to_string()),
            PgError::Timeout(_) => {
                DbError::new(DbErrorKind::QueryCanceled, None, err.to_string())
            }
            PgError::Config(_) | PgError::Introspection(_) => DbError::other(err.to_string()),
        }
    }
}

impl From<PgError> for GuardError {
    fn from(err: PgError) -> Self {
        match err {
            PgError::Config(msg) => GuardError::config(msg),
            PgError::Introspection(msg) => GuardError::validation(msg),
            PgError::Timeout(ms) => GuardError::timeout("postgres", ms),
            other => GuardError::transaction(other.into()),
        }
    }
}
