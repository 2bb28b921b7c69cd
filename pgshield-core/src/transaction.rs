//! Transactions with savepoints and deadlock retry.
//!
//! [`TransactionManager::begin`] acquires a connection from the
//! [`Connector`] and returns an owned [`Transaction`]. The transaction holds
//! that connection until [`Transaction::commit`] or [`Transaction::rollback`]
//! consumes it; no other handle issues statements on the connection
//! meanwhile.
//!
//! Savepoints form a stack. Rolling back to a savepoint keeps it and discards
//! every savepoint created after it; releasing a savepoint removes it and
//! everything after it.
//!
//! ```rust,ignore
//! let manager = TransactionManager::new(connector, ExecutorConfig::new());
//!
//! let outcome = manager
//!     .execute_in_transaction(|tx| {
//!         Box::pin(async move {
//!             tx.execute("ALTER TABLE users ADD COLUMN bio TEXT", &[]).await?;
//!             Ok(())
//!         })
//!     })
//!     .await?;
//! println!("committed after {} retries", outcome.retry_count);
//! ```

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{GuardError, GuardResult};
use crate::port::{Clock, Connection, Connector, SqlValue, SystemClock};
use crate::retry::{RetryConfig, Retried, retry_on_deadlock};

/// PostgreSQL's practical ceiling on open savepoints per transaction.
pub const MAX_SAVEPOINTS: usize = 32;

/// Longest identifier PostgreSQL keeps without truncation.
const MAX_IDENTIFIER_LEN: usize = 63;

/// Transaction isolation levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Read uncommitted; PostgreSQL treats it as read committed.
    ReadUncommitted,
    /// Read committed.
    #[default]
    ReadCommitted,
    /// Repeatable read.
    RepeatableRead,
    /// Serializable.
    Serializable,
}

impl IsolationLevel {
    /// Get the SQL clause for this isolation level.
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

/// Access mode for transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    /// Read-write access.
    #[default]
    ReadWrite,
    /// Read-only access.
    ReadOnly,
}

impl AccessMode {
    /// Get the SQL clause for this access mode.
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadWrite => "READ WRITE",
            Self::ReadOnly => "READ ONLY",
        }
    }
}

/// Options for a single transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionOptions {
    /// Isolation level.
    pub isolation: IsolationLevel,
    /// Access mode.
    pub access_mode: AccessMode,
    /// `SET LOCAL lock_timeout`.
    pub lock_timeout: Option<Duration>,
    /// `SET LOCAL statement_timeout`.
    pub statement_timeout: Option<Duration>,
}

impl TransactionOptions {
    /// Create default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the isolation level.
    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = level;
        self
    }

    /// Make the transaction read-only.
    pub fn read_only(mut self) -> Self {
        self.access_mode = AccessMode::ReadOnly;
        self
    }

    /// Set the lock timeout.
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Set the statement timeout.
    pub fn statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = Some(timeout);
        self
    }

    /// Generate the BEGIN SQL.
    pub fn to_begin_sql(&self) -> String {
        format!(
            "BEGIN ISOLATION LEVEL {} {}",
            self.isolation.as_sql(),
            self.access_mode.as_sql()
        )
    }

    /// `SET LOCAL` statements issued right after BEGIN.
    pub fn set_local_statements(&self) -> Vec<String> {
        let mut statements = Vec::new();
        if let Some(timeout) = self.lock_timeout {
            statements.push(format!("SET LOCAL lock_timeout = '{}ms'", timeout.as_millis()));
        }
        if let Some(timeout) = self.statement_timeout {
            statements.push(format!(
                "SET LOCAL statement_timeout = '{}ms'",
                timeout.as_millis()
            ));
        }
        statements
    }
}

/// Executor settings, read from `[executor]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Isolation level for migration transactions.
    pub isolation: IsolationLevel,
    /// Savepoint ceiling per transaction.
    pub max_savepoints: usize,
    /// `lock_timeout` applied to every transaction, in milliseconds.
    pub lock_timeout_ms: Option<u64>,
    /// `statement_timeout` applied to every transaction, in milliseconds.
    pub statement_timeout_ms: Option<u64>,
    /// Deadlock retry settings.
    pub retry: RetryConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::ReadCommitted,
            max_savepoints: MAX_SAVEPOINTS,
            lock_timeout_ms: None,
            statement_timeout_ms: None,
            retry: RetryConfig::default(),
        }
    }
}

impl ExecutorConfig {
    /// Create a new configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the isolation level.
    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = level;
        self
    }

    /// Set the savepoint ceiling.
    pub fn max_savepoints(mut self, n: usize) -> Self {
        self.max_savepoints = n;
        self
    }

    /// Set the lock timeout.
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Set the statement timeout.
    pub fn statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Set the retry configuration.
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Options for transactions begun with this configuration.
    pub fn transaction_options(&self) -> TransactionOptions {
        TransactionOptions {
            isolation: self.isolation,
            access_mode: AccessMode::ReadWrite,
            lock_timeout: self.lock_timeout_ms.map(Duration::from_millis),
            statement_timeout: self.statement_timeout_ms.map(Duration::from_millis),
        }
    }

    /// Reject out-of-range values.
    pub fn validate(&self) -> GuardResult<()> {
        if self.max_savepoints == 0 || self.max_savepoints > MAX_SAVEPOINTS {
            return Err(GuardError::config(format!(
                "executor.max_savepoints must be between 1 and {}",
                MAX_SAVEPOINTS
            )));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(GuardError::config(
                "executor.retry.max_delay_ms must not be below base_delay_ms",
            ));
        }
        Ok(())
    }
}

/// Lifecycle of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Open.
    Active,
    /// Committed.
    Committed,
    /// Rolled back.
    RolledBack,
    /// COMMIT or ROLLBACK failed.
    Error,
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Serializable view of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInfo {
    /// Transaction id.
    pub id: String,
    /// Isolation level.
    pub isolation: IsolationLevel,
    /// Open savepoints, oldest first.
    pub savepoints: Vec<String>,
    /// Current status.
    pub status: TransactionStatus,
    /// When the transaction began.
    pub started_at: DateTime<Utc>,
}

/// How a transaction ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionSummary {
    /// Transaction id.
    pub id: String,
    /// Terminal status.
    pub status: TransactionStatus,
    /// Wall-clock duration.
    pub duration_ms: u64,
    /// Rollback reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Check that a savepoint name is a plain SQL identifier.
pub fn validate_savepoint_name(name: &str) -> GuardResult<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if !valid_start || !valid_rest {
        return Err(GuardError::savepoint(name, "not a valid identifier"));
    }
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(GuardError::savepoint(
            name,
            format!("longer than {} bytes", MAX_IDENTIFIER_LEN),
        ));
    }
    Ok(())
}

struct TxState<C: Connection> {
    id: String,
    isolation: IsolationLevel,
    savepoints: Vec<String>,
    status: TransactionStatus,
    started_at: DateTime<Utc>,
    started: Instant,
    next_savepoint: u32,
    max_savepoints: usize,
    conn: C,
}

impl<C: Connection> TxState<C> {
    fn ensure_active(&self) -> GuardResult<()> {
        if self.status == TransactionStatus::Active {
            Ok(())
        } else {
            Err(GuardError::TransactionClosed {
                id: self.id.clone(),
                status: self.status,
            })
        }
    }

    fn position(&self, name: &str) -> GuardResult<usize> {
        self.savepoints
            .iter()
            .rposition(|s| s == name)
            .ok_or_else(|| GuardError::savepoint(name, "no such savepoint"))
    }

    fn info(&self) -> TransactionInfo {
        TransactionInfo {
            id: self.id.clone(),
            isolation: self.isolation,
            savepoints: self.savepoints.clone(),
            status: self.status,
            started_at: self.started_at,
        }
    }

    fn summary(&self, reason: Option<String>) -> TransactionSummary {
        TransactionSummary {
            id: self.id.clone(),
            status: self.status,
            duration_ms: self.started.elapsed().as_millis() as u64,
            reason,
        }
    }
}

impl<C: Connection> Drop for TxState<C> {
    fn drop(&mut self) {
        if matches!(self.status, TransactionStatus::Active | TransactionStatus::Error) {
            warn!(tx = %self.id, status = %self.status, "Transaction dropped while open; discarding connection");
            self.conn.discard();
        }
    }
}

type Shared<C> = Arc<tokio::sync::Mutex<TxState<C>>>;

/// An open transaction owning one connection.
pub struct Transaction<C: Connection> {
    id: String,
    inner: Shared<C>,
}

impl<C: Connection> fmt::Debug for Transaction<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction").field("id", &self.id).finish()
    }
}

impl<C: Connection> Transaction<C> {
    /// Transaction id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current state.
    pub async fn info(&self) -> TransactionInfo {
        self.inner.lock().await.info()
    }

    /// Current status.
    pub async fn status(&self) -> TransactionStatus {
        self.inner.lock().await.status
    }

    /// Execute a statement and return the number of affected rows.
    pub async fn execute(&self, sql: &str, params: &[SqlValue]) -> GuardResult<u64> {
        let mut state = self.inner.lock().await;
        state.ensure_active()?;
        debug!(tx = %state.id, sql = %sql, "Executing statement");
        Ok(state.conn.execute(sql, params).await?)
    }

    /// Run a count query.
    pub async fn query_count(&self, sql: &str, params: &[SqlValue]) -> GuardResult<i64> {
        let mut state = self.inner.lock().await;
        state.ensure_active()?;
        debug!(tx = %state.id, sql = %sql, "Executing count query");
        Ok(state.conn.query_count(sql, params).await?)
    }

    /// Execute statements without parameters.
    pub async fn batch_execute(&self, sql: &str) -> GuardResult<()> {
        let mut state = self.inner.lock().await;
        state.ensure_active()?;
        debug!(tx = %state.id, sql = %sql, "Executing batch");
        Ok(state.conn.batch_execute(sql).await?)
    }

    /// Open a savepoint. Without a name, `sp_<n>` is generated.
    pub async fn savepoint(&self, name: Option<&str>) -> GuardResult<String> {
        let mut state = self.inner.lock().await;
        state.ensure_active()?;

        let name = match name {
            Some(name) => name.to_string(),
            None => {
                state.next_savepoint += 1;
                format!("sp_{}", state.next_savepoint)
            }
        };
        validate_savepoint_name(&name)?;

        if state.savepoints.len() >= state.max_savepoints {
            return Err(GuardError::savepoint(
                name,
                format!("limit of {} savepoints reached", state.max_savepoints),
            ));
        }
        if state.savepoints.contains(&name) {
            return Err(GuardError::savepoint(name, "already exists"));
        }

        state
            .conn
            .savepoint(&name)
            .await
            .map_err(|e| GuardError::savepoint(&name, e.to_string()))?;
        state.savepoints.push(name.clone());
        debug!(tx = %state.id, savepoint = %name, "Created savepoint");
        Ok(name)
    }

    /// Roll back to a savepoint, discarding every later savepoint.
    pub async fn rollback_to(&self, name: &str) -> GuardResult<()> {
        let mut state = self.inner.lock().await;
        state.ensure_active()?;
        let pos = state.position(name)?;

        state
            .conn
            .rollback_to_savepoint(name)
            .await
            .map_err(|e| GuardError::savepoint(name, e.to_string()))?;
        state.savepoints.truncate(pos + 1);
        debug!(tx = %state.id, savepoint = %name, "Rolled back to savepoint");
        Ok(())
    }

    /// Release a savepoint and every later savepoint.
    pub async fn release(&self, name: &str) -> GuardResult<()> {
        let mut state = self.inner.lock().await;
        state.ensure_active()?;
        let pos = state.position(name)?;

        state
            .conn
            .release_savepoint(name)
            .await
            .map_err(|e| GuardError::savepoint(name, e.to_string()))?;
        state.savepoints.truncate(pos);
        debug!(tx = %state.id, savepoint = %name, "Released savepoint");
        Ok(())
    }

    /// Run `operation` under a fresh savepoint.
    ///
    /// On failure the transaction is rolled back to the savepoint, the
    /// savepoint is released and the original error is returned. Work done
    /// before the savepoint survives.
    pub async fn with_savepoint<T, F>(&self, name: Option<&str>, operation: F) -> GuardResult<T>
    where
        F: for<'a> FnOnce(&'a Transaction<C>) -> BoxFuture<'a, GuardResult<T>>,
    {
        let savepoint = self.savepoint(name).await?;
        match operation(self).await {
            Ok(value) => {
                self.release(&savepoint).await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback_to(&savepoint).await {
                    warn!(savepoint = %savepoint, error = %rollback_err, "Failed to roll back to savepoint");
                } else if let Err(release_err) = self.release(&savepoint).await {
                    warn!(savepoint = %savepoint, error = %release_err, "Failed to release savepoint");
                }
                Err(err)
            }
        }
    }

    /// Commit and close the transaction.
    pub async fn commit(self) -> GuardResult<TransactionSummary> {
        let mut state = self.inner.lock().await;
        state.ensure_active()?;

        if let Err(err) = state.conn.commit().await {
            state.status = TransactionStatus::Error;
            warn!(tx = %state.id, error = %err, "Commit failed");
            return Err(err.into());
        }

        state.status = TransactionStatus::Committed;
        state.savepoints.clear();
        let summary = state.summary(None);
        info!(tx = %summary.id, duration_ms = summary.duration_ms, "Transaction committed");
        Ok(summary)
    }

    /// Roll back and close the transaction.
    pub async fn rollback(self, reason: impl Into<String>) -> GuardResult<TransactionSummary> {
        let reason = reason.into();
        let mut state = self.inner.lock().await;
        state.ensure_active()?;

        if let Err(err) = state.conn.rollback().await {
            state.status = TransactionStatus::Error;
            warn!(tx = %state.id, error = %err, "Rollback failed");
            return Err(err.into());
        }

        state.status = TransactionStatus::RolledBack;
        state.savepoints.clear();
        let summary = state.summary(Some(reason));
        info!(
            tx = %summary.id,
            duration_ms = summary.duration_ms,
            reason = summary.reason.as_deref().unwrap_or_default(),
            "Transaction rolled back"
        );
        Ok(summary)
    }
}

/// Begins transactions and runs operations inside them.
pub struct TransactionManager<K: Connector> {
    connector: K,
    config: ExecutorConfig,
    clock: Arc<dyn Clock>,
    open: parking_lot::Mutex<Vec<Weak<tokio::sync::Mutex<TxState<K::Connection>>>>>,
}

impl<K: Connector> fmt::Debug for TransactionManager<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("config", &self.config)
            .field("open", &self.open_transactions())
            .finish()
    }
}

impl<K: Connector> TransactionManager<K> {
    /// Create a manager.
    pub fn new(connector: K, config: ExecutorConfig) -> Self {
        Self {
            connector,
            config,
            clock: Arc::new(SystemClock),
            open: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Use a different clock for timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The manager's configuration.
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// The connector transactions draw connections from.
    pub fn connector(&self) -> &K {
        &self.connector
    }

    /// Number of transactions whose handles are still alive.
    pub fn open_transactions(&self) -> usize {
        self.open
            .lock()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    /// Begin a transaction with the configured options.
    pub async fn begin(&self) -> GuardResult<Transaction<K::Connection>> {
        self.begin_with(&self.config.transaction_options()).await
    }

    /// Begin a transaction with explicit options.
    pub async fn begin_with(
        &self,
        options: &TransactionOptions,
    ) -> GuardResult<Transaction<K::Connection>> {
        let mut conn = self.connector.connect().await?;
        conn.begin(options).await?;

        for statement in options.set_local_statements() {
            if let Err(err) = conn.batch_execute(&statement).await {
                if let Err(rollback_err) = conn.rollback().await {
                    warn!(error = %rollback_err, "Rollback after failed SET LOCAL failed");
                    conn.discard();
                }
                return Err(err.into());
            }
        }

        let id = Uuid::new_v4().to_string();
        let state = TxState {
            id: id.clone(),
            isolation: options.isolation,
            savepoints: Vec::new(),
            status: TransactionStatus::Active,
            started_at: self.clock.now(),
            started: Instant::now(),
            next_savepoint: 0,
            max_savepoints: self.config.max_savepoints,
            conn,
        };
        let inner = Arc::new(tokio::sync::Mutex::new(state));

        {
            let mut open = self.open.lock();
            open.retain(|w| w.strong_count() > 0);
            open.push(Arc::downgrade(&inner));
        }

        info!(tx = %id, isolation = options.isolation.as_sql(), "Transaction started");
        Ok(Transaction { id, inner })
    }

    /// Run `operation`, retrying deadlocks with backoff.
    pub async fn execute_with_deadlock_retry<T, F, Fut>(
        &self,
        operation: F,
    ) -> GuardResult<Retried<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GuardResult<T>>,
    {
        retry_on_deadlock(&self.config.retry, "operation", operation).await
    }

    /// Run `operation` in a transaction, committing on success.
    ///
    /// Any failure rolls the transaction back before the error is returned.
    /// Deadlocks restart the whole transaction, since PostgreSQL aborts it.
    pub async fn execute_in_transaction<T, F>(&self, operation: F) -> GuardResult<Retried<T>>
    where
        F: for<'a> FnMut(&'a Transaction<K::Connection>) -> BoxFuture<'a, GuardResult<T>>,
    {
        let operation = parking_lot::Mutex::new(operation);
        let operation = &operation;

        retry_on_deadlock(&self.config.retry, "transaction", move || async move {
            let tx = self.begin().await?;
            let attempt = {
                let mut op = operation.lock();
                (*op)(&tx)
            };

            match attempt.await {
                Ok(value) => {
                    tx.commit().await?;
                    Ok(value)
                }
                Err(err) => {
                    if let Err(rollback_err) = tx.rollback(err.to_string()).await {
                        warn!(error = %rollback_err, "Rollback after failed operation failed");
                    }
                    Err(err)
                }
            }
        })
        .await
    }

    /// Roll back every transaction still active.
    ///
    /// Failures are logged, not returned. Returns how many were rolled back.
    pub async fn shutdown(&self) -> usize {
        let open: Vec<_> = self
            .open
            .lock()
            .drain(..)
            .filter_map(|w| w.upgrade())
            .collect();

        let mut rolled_back = 0;
        for shared in open {
            let mut state = shared.lock().await;
            if state.status != TransactionStatus::Active {
                continue;
            }
            match state.conn.rollback().await {
                Ok(()) => {
                    state.status = TransactionStatus::RolledBack;
                    state.savepoints.clear();
                    rolled_back += 1;
                    info!(tx = %state.id, "Rolled back on shutdown");
                }
                Err(err) => {
                    state.status = TransactionStatus::Error;
                    warn!(tx = %state.id, error = %err, "Rollback on shutdown failed");
                }
            }
        }
        rolled_back
    }
}

/// Run `operation` in a transaction from `manager`, committing on success.
pub async fn execute_in_transaction<K, T, F>(
    manager: &TransactionManager<K>,
    operation: F,
) -> GuardResult<Retried<T>>
where
    K: Connector,
    F: for<'a> FnMut(&'a Transaction<K::Connection>) -> BoxFuture<'a, GuardResult<T>>,
{
    manager.execute_in_transaction(operation).await
}

/// Run `operation` under a generated savepoint of `tx`.
pub async fn execute_with_savepoint<C, T, F>(tx: &Transaction<C>, operation: F) -> GuardResult<T>
where
    C: Connection,
    F: for<'a> FnOnce(&'a Transaction<C>) -> BoxFuture<'a, GuardResult<T>>,
{
    tx.with_savepoint(None, operation).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{DbError, DbErrorKind};
    use crate::testing::ScriptedConnection;
    use pretty_assertions::assert_eq;

    fn manager(conn: &ScriptedConnection) -> TransactionManager<ScriptedConnection> {
        let config = ExecutorConfig::new().retry(
            RetryConfig::new()
                .base_delay(Duration::from_millis(1))
                .jitter(false),
        );
        TransactionManager::new(conn.clone(), config)
    }

    #[test]
    fn test_begin_sql() {
        let options = TransactionOptions::new().isolation(IsolationLevel::Serializable);
        assert_eq!(options.to_begin_sql(), "BEGIN ISOLATION LEVEL SERIALIZABLE READ WRITE");
        assert_eq!(
            TransactionOptions::new().read_only().to_begin_sql(),
            "BEGIN ISOLATION LEVEL READ COMMITTED READ ONLY"
        );
    }

    #[test]
    fn test_set_local_statements() {
        let options = TransactionOptions::new()
            .lock_timeout(Duration::from_secs(5))
            .statement_timeout(Duration::from_millis(250));
        assert_eq!(
            options.set_local_statements(),
            vec![
                "SET LOCAL lock_timeout = '5000ms'".to_string(),
                "SET LOCAL statement_timeout = '250ms'".to_string(),
            ]
        );
    }

    #[test]
    fn test_savepoint_name_validation() {
        assert!(validate_savepoint_name("sp_1").is_ok());
        assert!(validate_savepoint_name("_batch").is_ok());
        assert!(validate_savepoint_name("1sp").is_err());
        assert!(validate_savepoint_name("sp; DROP TABLE users").is_err());
        assert!(validate_savepoint_name("").is_err());
        assert!(validate_savepoint_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_executor_config_validation() {
        assert!(ExecutorConfig::new().validate().is_ok());
        assert!(ExecutorConfig::new().max_savepoints(0).validate().is_err());
        assert!(ExecutorConfig::new().max_savepoints(33).validate().is_err());
        let bad_retry = RetryConfig::new()
            .base_delay(Duration::from_secs(2))
            .max_delay(Duration::from_secs(1));
        assert!(ExecutorConfig::new().retry(bad_retry).validate().is_err());
    }

    #[tokio::test]
    async fn test_rollback_to_discards_later_savepoints() {
        let conn = ScriptedConnection::new();
        let manager = manager(&conn);
        let tx = manager.begin().await.unwrap();

        tx.savepoint(Some("sp1")).await.unwrap();
        tx.savepoint(Some("sp2")).await.unwrap();
        tx.rollback_to("sp1").await.unwrap();

        let info = tx.info().await;
        assert_eq!(info.savepoints, vec!["sp1".to_string()]);
        assert_eq!(info.status, TransactionStatus::Active);
        tx.commit().await.unwrap();

        assert!(conn.statements().contains(&"ROLLBACK TO SAVEPOINT sp1".to_string()));
    }

    #[tokio::test]
    async fn test_release_removes_savepoint_and_later() {
        let conn = ScriptedConnection::new();
        let tx = manager(&conn).begin().await.unwrap();

        let first = tx.savepoint(None).await.unwrap();
        let second = tx.savepoint(None).await.unwrap();
        assert_eq!((first.as_str(), second.as_str()), ("sp_1", "sp_2"));

        tx.release(&first).await.unwrap();
        assert!(tx.info().await.savepoints.is_empty());
    }

    #[tokio::test]
    async fn test_savepoint_limit() {
        let conn = ScriptedConnection::new();
        let manager = TransactionManager::new(conn.clone(), ExecutorConfig::new().max_savepoints(2));
        let tx = manager.begin().await.unwrap();
        tx.savepoint(None).await.unwrap();
        tx.savepoint(None).await.unwrap();
        let err = tx.savepoint(Some("third")).await.unwrap_err();
        assert!(matches!(err, GuardError::Savepoint { name, .. } if name == "third"));
    }

    #[tokio::test]
    async fn test_unknown_savepoint_is_error() {
        let conn = ScriptedConnection::new();
        let tx = manager(&conn).begin().await.unwrap();
        let err = tx.rollback_to("missing").await.unwrap_err();
        assert!(matches!(err, GuardError::Savepoint { .. }));
    }

    #[tokio::test]
    async fn test_commit_summary() {
        let conn = ScriptedConnection::new();
        let tx = manager(&conn).begin().await.unwrap();
        let id = tx.id().to_string();
        let summary = tx.commit().await.unwrap();
        assert_eq!(summary.id, id);
        assert_eq!(summary.status, TransactionStatus::Committed);
        assert_eq!(summary.reason, None);
    }

    #[tokio::test]
    async fn test_failed_commit_marks_error() {
        let conn = ScriptedConnection::new();
        conn.fail_on("COMMIT", DbError::connection("connection reset"));
        let manager = manager(&conn);
        let tx = manager.begin().await.unwrap();
        let shared = Arc::clone(&tx.inner);
        assert!(tx.commit().await.is_err());
        assert_eq!(shared.lock().await.status, TransactionStatus::Error);
    }

    #[tokio::test]
    async fn test_with_savepoint_keeps_prior_work() {
        let conn = ScriptedConnection::new();
        conn.fail_on("INSERT INTO broken", DbError::other("boom"));
        let tx = manager(&conn).begin().await.unwrap();

        tx.execute("INSERT INTO ok VALUES (1)", &[]).await.unwrap();
        let err = execute_with_savepoint(&tx, |tx| {
            Box::pin(async move {
                tx.execute("INSERT INTO broken VALUES (1)", &[]).await?;
                Ok(())
            })
        })
        .await
        .unwrap_err();
        assert!(matches!(err, GuardError::Transaction { .. }));
        assert!(tx.info().await.savepoints.is_empty());
        tx.commit().await.unwrap();

        let statements = conn.statements();
        assert!(statements.contains(&"ROLLBACK TO SAVEPOINT sp_1".to_string()));
        assert!(statements.contains(&"RELEASE SAVEPOINT sp_1".to_string()));
        assert_eq!(statements.last().map(String::as_str), Some("COMMIT"));
    }

    #[tokio::test]
    async fn test_execute_in_transaction_retries_whole_transaction() {
        let conn = ScriptedConnection::new();
        conn.fail_times(
            "UPDATE accounts",
            2,
            DbError::from_sqlstate(Some("40P01"), "deadlock detected"),
        );
        let manager = manager(&conn);

        let outcome = manager
            .execute_in_transaction(|tx| {
                Box::pin(async move { tx.execute("UPDATE accounts SET n = 1", &[]).await })
            })
            .await
            .unwrap();
        assert_eq!(outcome.retry_count, 2);

        let statements = conn.statements();
        assert_eq!(statements.iter().filter(|s| s.starts_with("BEGIN")).count(), 3);
        assert_eq!(statements.iter().filter(|s| *s == "ROLLBACK").count(), 2);
        assert_eq!(statements.last().map(String::as_str), Some("COMMIT"));
    }

    #[tokio::test]
    async fn test_execute_in_transaction_rolls_back_on_error() {
        let conn = ScriptedConnection::new();
        conn.fail_on(
            "ALTER TABLE",
            DbError::new(DbErrorKind::LockTimeout, Some("55P03".into()), "lock timeout"),
        );
        let manager = manager(&conn);

        let err = manager
            .execute_in_transaction(|tx| {
                Box::pin(async move { tx.execute("ALTER TABLE users ADD COLUMN x INT", &[]).await })
            })
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(conn.statements().last().map(String::as_str), Some("ROLLBACK"));
    }

    #[tokio::test]
    async fn test_closed_transaction_rejects_statements() {
        let conn = ScriptedConnection::new();
        let manager = manager(&conn);
        let tx = manager.begin().await.unwrap();
        let shared = Arc::clone(&tx.inner);
        tx.rollback("test").await.unwrap();

        let reopened = Transaction {
            id: "reopened".to_string(),
            inner: shared,
        };
        let err = reopened.execute("SELECT 1", &[]).await.unwrap_err();
        assert!(matches!(
            err,
            GuardError::TransactionClosed {
                status: TransactionStatus::RolledBack,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_shutdown_rolls_back_active() {
        let conn = ScriptedConnection::new();
        let manager = manager(&conn);
        let a = manager.begin().await.unwrap();
        let b = manager.begin().await.unwrap();
        b.commit().await.unwrap();
        assert_eq!(manager.open_transactions(), 1);

        assert_eq!(manager.shutdown().await, 1);
        assert_eq!(a.status().await, TransactionStatus::RolledBack);
        assert_eq!(manager.open_transactions(), 0);
    }

    #[tokio::test]
    async fn test_dropped_open_transaction_discards_connection() {
        let conn = ScriptedConnection::new();
        let manager = manager(&conn);

        let committed = manager.begin().await.unwrap();
        committed.commit().await.unwrap();
        let rolled_back = manager.begin().await.unwrap();
        rolled_back.rollback("done").await.unwrap();
        assert_eq!(conn.discarded(), 0);

        let abandoned = manager.begin().await.unwrap();
        abandoned.execute("UPDATE accounts SET balance = 0", &[]).await.unwrap();
        drop(abandoned);
        assert_eq!(conn.discarded(), 1);
        assert_eq!(
            conn.statements().last().map(String::as_str),
            Some("UPDATE accounts SET balance = 0")
        );
        assert_eq!(manager.open_transactions(), 0);

        conn.fail_on("COMMIT", DbError::connection("gone"));
        let failed = manager.begin().await.unwrap();
        assert!(failed.commit().await.is_err());
        assert_eq!(conn.discarded(), 2);
    }

    #[tokio::test]
    async fn test_failed_set_local_rollback_discards_connection() {
        let conn = ScriptedConnection::new();
        conn.fail_on("SET LOCAL", DbError::other("bad setting"));
        conn.fail_on("ROLLBACK", DbError::connection("gone"));
        let manager = TransactionManager::new(
            conn.clone(),
            ExecutorConfig::new().lock_timeout(Duration::from_millis(100)),
        );

        assert!(manager.begin().await.is_err());
        assert_eq!(conn.discarded(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_tolerates_rollback_failure() {
        let conn = ScriptedConnection::new();
        let manager = manager(&conn);
        let tx = manager.begin().await.unwrap();
        conn.fail_on("ROLLBACK", DbError::connection("gone"));

        assert_eq!(manager.shutdown().await, 0);
        assert_eq!(tx.status().await, TransactionStatus::Error);
    }
}
