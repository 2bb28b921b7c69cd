//! PostgreSQL connection wrapper.

use async_trait::async_trait;
use deadpool_postgres::Object;
use pgshield_core::{Connection, DbError, SqlValue};
use tokio_postgres::Row;
use tracing::{debug, warn};

use crate::error::{PgError, PgResult};
use crate::types::{param_refs, to_params};

/// A pooled PostgreSQL connection.
///
/// Transaction control is plain SQL issued through [`Connection::batch_execute`],
/// so `BEGIN`, savepoints and `COMMIT` all run on the same session.
///
/// A discarded connection is detached from the pool and closed, so a session
/// left inside `BEGIN` is never handed out again.
pub struct PgConnection {
    client: Option<Object>,
}

impl PgConnection {
    pub(crate) fn new(client: Object) -> Self {
        Self {
            client: Some(client),
        }
    }

    fn client(&self) -> PgResult<&Object> {
        self.client
            .as_ref()
            .ok_or_else(|| PgError::connection("connection was discarded"))
    }

    /// Execute a query and return all rows.
    pub async fn query(&self, sql: &str, params: &[SqlValue]) -> PgResult<Vec<Row>> {
        debug!(sql = %sql, "Executing query");
        let params = to_params(params);
        let rows = self.client()?.query(sql, &param_refs(&params)).await?;
        Ok(rows)
    }

    /// Get the underlying client, unless the connection was discarded.
    pub fn inner(&self) -> Option<&Object> {
        self.client.as_ref()
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, DbError> {
        debug!(sql = %sql, "Executing statement");
        let params = to_params(params);
        self.client()?
            .execute(sql, &param_refs(&params))
            .await
            .map_err(|e| PgError::from(e).into())
    }

    async fn query_count(&mut self, sql: &str, params: &[SqlValue]) -> Result<i64, DbError> {
        debug!(sql = %sql, "Executing count query");
        let params = to_params(params);
        let row = self
            .client()?
            .query_one(sql, &param_refs(&params))
            .await
            .map_err(PgError::from)?;
        row.try_get::<_, i64>(0)
            .map_err(|e| PgError::from(e).into())
    }

    async fn batch_execute(&mut self, sql: &str) -> Result<(), DbError> {
        debug!(sql = %sql, "Executing batch");
        self.client()?
            .batch_execute(sql)
            .await
            .map_err(|e| PgError::from(e).into())
    }

    fn discard(&mut self) {
        if let Some(client) = self.client.take() {
            warn!("Closing connection left inside a transaction");
            drop(Object::take(client));
        }
    }
}
