//! Ports the core calls into: database connections, schema sources and a clock.
//!
//! The core never talks to a driver directly. A host supplies:
//!
//! - a [`Connector`] handing out [`Connection`]s able to run parameterized SQL,
//!   transactions and savepoints;
//! - one or more [`SchemaSource`]s producing [`SchemaSnapshot`]s, so that the
//!   declared schema and the introspected one share a shape;
//! - a [`Clock`] for timestamps and durations.
//!
//! Driver errors cross the boundary as [`DbError`], already classified into a
//! closed set of [`DbErrorKind`]s by [`classify_sqlstate`].

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::GuardResult;
use crate::snapshot::SchemaSnapshot;
use crate::transaction::TransactionOptions;

/// Closed classification of driver errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbErrorKind {
    /// Deadlock detected (SQLSTATE 40P01).
    Deadlock,
    /// Serialization failure (SQLSTATE 40001).
    SerializationFailure,
    /// `lock_timeout` elapsed (SQLSTATE 55P03).
    LockTimeout,
    /// Statement canceled, usually by `statement_timeout` (SQLSTATE 57014).
    QueryCanceled,
    /// Unique violation (SQLSTATE 23505).
    UniqueViolation,
    /// Foreign key violation (SQLSTATE 23503).
    ForeignKeyViolation,
    /// Check violation (SQLSTATE 23514).
    CheckViolation,
    /// Not-null violation (SQLSTATE 23502).
    NotNullViolation,
    /// Connection-level failure (SQLSTATE class 08, pool errors).
    Connection,
    /// Anything else.
    Other,
}

impl DbErrorKind {
    /// Deadlocks and serialization failures are the only retryable kinds.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Deadlock | Self::SerializationFailure)
    }
}

/// Error reported by a database port.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DbError {
    /// Classified kind.
    pub kind: DbErrorKind,
    /// Raw SQLSTATE code, when the driver reported one.
    pub code: Option<String>,
    /// Driver message.
    pub message: String,
}

impl DbError {
    /// Create a new database error.
    pub fn new(kind: DbErrorKind, code: Option<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
        }
    }

    /// Build an error from a raw SQLSTATE and message.
    pub fn from_sqlstate(code: Option<&str>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: classify_sqlstate(code, &message),
            code: code.map(str::to_string),
            message,
        }
    }

    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(DbErrorKind::Connection, None, message)
    }

    /// Create an unclassified error.
    pub fn other(message: impl Into<String>) -> Self {
        Self::new(DbErrorKind::Other, None, message)
    }
}

/// Classify a driver error. This is the only place raw codes are inspected.
pub fn classify_sqlstate(code: Option<&str>, message: &str) -> DbErrorKind {
    let kind = match code {
        Some("40P01") => DbErrorKind::Deadlock,
        Some("40001") => DbErrorKind::SerializationFailure,
        Some("55P03") => DbErrorKind::LockTimeout,
        Some("57014") => DbErrorKind::QueryCanceled,
        Some("23505") => DbErrorKind::UniqueViolation,
        Some("23503") => DbErrorKind::ForeignKeyViolation,
        Some("23514") => DbErrorKind::CheckViolation,
        Some("23502") => DbErrorKind::NotNullViolation,
        Some(c) if c.starts_with("08") => DbErrorKind::Connection,
        _ => DbErrorKind::Other,
    };

    if kind == DbErrorKind::Other && message.to_lowercase().contains("deadlock") {
        DbErrorKind::Deadlock
    } else {
        kind
    }
}

/// A parameter value passed through the connection port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    /// SQL NULL.
    Null,
    /// Boolean.
    Bool(bool),
    /// 64-bit integer.
    Int(i64),
    /// Double precision float.
    Float(f64),
    /// Text.
    Text(String),
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// A single database connection.
///
/// Exactly one [`Transaction`](crate::transaction::Transaction) owns a
/// connection at a time; nothing else issues statements on it meanwhile.
#[async_trait]
pub trait Connection: Send {
    /// Execute a statement and return the number of affected rows.
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, DbError>;

    /// Run a query returning a single integer (e.g. `SELECT COUNT(*)`).
    async fn query_count(&mut self, sql: &str, params: &[SqlValue]) -> Result<i64, DbError>;

    /// Execute one or more statements without parameters.
    async fn batch_execute(&mut self, sql: &str) -> Result<(), DbError>;

    /// Begin a transaction.
    async fn begin(&mut self, options: &TransactionOptions) -> Result<(), DbError> {
        self.batch_execute(&options.to_begin_sql()).await
    }

    /// Commit the open transaction.
    async fn commit(&mut self) -> Result<(), DbError> {
        self.batch_execute("COMMIT").await
    }

    /// Roll back the open transaction.
    async fn rollback(&mut self) -> Result<(), DbError> {
        self.batch_execute("ROLLBACK").await
    }

    /// Create a savepoint.
    async fn savepoint(&mut self, name: &str) -> Result<(), DbError> {
        self.batch_execute(&format!("SAVEPOINT {}", name)).await
    }

    /// Release a savepoint.
    async fn release_savepoint(&mut self, name: &str) -> Result<(), DbError> {
        self.batch_execute(&format!("RELEASE SAVEPOINT {}", name))
            .await
    }

    /// Roll back to a savepoint.
    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), DbError> {
        self.batch_execute(&format!("ROLLBACK TO SAVEPOINT {}", name))
            .await
    }

    /// Mark the session unusable.
    ///
    /// Called when a transaction is dropped without a successful `COMMIT` or
    /// `ROLLBACK`. The session may still be inside `BEGIN`, so a pooled
    /// implementation must not hand it out again.
    fn discard(&mut self) {}
}

/// Hands out connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connection type produced by this connector.
    type Connection: Connection + 'static;

    /// Acquire a connection.
    async fn connect(&self) -> Result<Self::Connection, DbError>;
}

/// Produces schema snapshots, from a live database or a declared schema.
#[async_trait]
pub trait SchemaSource: Send + Sync {
    /// Capture a fresh snapshot.
    async fn snapshot(&self) -> GuardResult<SchemaSnapshot>;
}

/// Source of wall-clock time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A declared schema held in memory.
#[derive(Debug, Clone)]
pub struct StaticSchemaSource {
    snapshot: SchemaSnapshot,
}

impl StaticSchemaSource {
    /// Wrap an already-built snapshot.
    pub fn new(snapshot: SchemaSnapshot) -> Self {
        Self { snapshot }
    }
}

#[async_trait]
impl SchemaSource for StaticSchemaSource {
    async fn snapshot(&self) -> GuardResult<SchemaSnapshot> {
        self.snapshot.validate()?;
        Ok(self.snapshot.clone())
    }
}

/// A declared schema persisted as JSON.
#[derive(Debug, Clone)]
pub struct JsonSchemaSource {
    path: PathBuf,
}

impl JsonSchemaSource {
    /// Read snapshots from the given file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SchemaSource for JsonSchemaSource {
    async fn snapshot(&self) -> GuardResult<SchemaSnapshot> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        let snapshot: SchemaSnapshot = serde_json::from_str(&content)?;
        snapshot.validate()?;
        Ok(snapshot)
    }
}
