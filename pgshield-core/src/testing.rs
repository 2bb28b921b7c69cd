//! Test doubles for the connection and clock ports.
//!
//! [`ScriptedConnection`] records every statement it receives and replays
//! scripted failures and counts. Clones share their script and log, so a test
//! can hand one clone to a manager (it also implements [`Connector`]) and
//! inspect the log through another.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::port::{Clock, Connection, Connector, DbError, SqlValue};

#[derive(Debug)]
struct ScriptedFailure {
    prefix: String,
    remaining: Option<u32>,
    error: DbError,
}

#[derive(Debug, Default)]
struct Script {
    statements: Vec<String>,
    failures: Vec<ScriptedFailure>,
    counts: Vec<(String, i64)>,
    connect_failure: Option<DbError>,
    connections: usize,
    discarded: usize,
}

impl Script {
    fn record(&mut self, sql: &str) -> Result<(), DbError> {
        self.statements.push(sql.to_string());

        let hit = self.failures.iter_mut().find(|f| {
            sql.starts_with(&f.prefix) && f.remaining.is_none_or(|n| n > 0)
        });
        match hit {
            Some(failure) => {
                if let Some(n) = failure.remaining.as_mut() {
                    *n -= 1;
                }
                Err(failure.error.clone())
            }
            None => Ok(()),
        }
    }
}

/// In-memory connection that records statements.
#[derive(Debug, Clone, Default)]
pub struct ScriptedConnection {
    script: Arc<Mutex<Script>>,
}

impl ScriptedConnection {
    /// Create a connection that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every statement starting with `prefix`.
    pub fn fail_on(&self, prefix: impl Into<String>, error: DbError) -> &Self {
        self.script.lock().failures.push(ScriptedFailure {
            prefix: prefix.into(),
            remaining: None,
            error,
        });
        self
    }

    /// Fail the next `times` statements starting with `prefix`.
    pub fn fail_times(&self, prefix: impl Into<String>, times: u32, error: DbError) -> &Self {
        self.script.lock().failures.push(ScriptedFailure {
            prefix: prefix.into(),
            remaining: Some(times),
            error,
        });
        self
    }

    /// Answer count queries containing `fragment` with `count`. Unmatched
    /// count queries return zero.
    pub fn respond_count(&self, fragment: impl Into<String>, count: i64) -> &Self {
        self.script.lock().counts.push((fragment.into(), count));
        self
    }

    /// Make [`Connector::connect`] fail.
    pub fn fail_connect(&self, error: DbError) -> &Self {
        self.script.lock().connect_failure = Some(error);
        self
    }

    /// Every statement received so far, in order.
    pub fn statements(&self) -> Vec<String> {
        self.script.lock().statements.clone()
    }

    /// Whether any statement started with `prefix`.
    pub fn executed(&self, prefix: &str) -> bool {
        self.script
            .lock()
            .statements
            .iter()
            .any(|s| s.starts_with(prefix))
    }

    /// Number of connections handed out.
    pub fn connections(&self) -> usize {
        self.script.lock().connections
    }

    /// Number of times a connection was discarded mid-transaction.
    pub fn discarded(&self) -> usize {
        self.script.lock().discarded
    }

    /// Forget recorded statements, keeping the script.
    pub fn clear(&self) {
        self.script.lock().statements.clear();
    }
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn execute(&mut self, sql: &str, _params: &[SqlValue]) -> Result<u64, DbError> {
        self.script.lock().record(sql)?;
        Ok(0)
    }

    async fn query_count(&mut self, sql: &str, _params: &[SqlValue]) -> Result<i64, DbError> {
        let mut script = self.script.lock();
        script.record(sql)?;
        Ok(script
            .counts
            .iter()
            .find(|(fragment, _)| sql.contains(fragment.as_str()))
            .map(|(_, count)| *count)
            .unwrap_or(0))
    }

    async fn batch_execute(&mut self, sql: &str) -> Result<(), DbError> {
        self.script.lock().record(sql)
    }

    fn discard(&mut self) {
        self.script.lock().discarded += 1;
    }
}

#[async_trait]
impl Connector for ScriptedConnection {
    type Connection = ScriptedConnection;

    async fn connect(&self) -> Result<Self::Connection, DbError> {
        let mut script = self.script.lock();
        if let Some(err) = &script.connect_failure {
            return Err(err.clone());
        }
        script.connections += 1;
        Ok(self.clone())
    }
}

/// Clock frozen at one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
