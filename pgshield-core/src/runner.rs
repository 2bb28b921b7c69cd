//! Sequential execution of a migration plan.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::GuardResult;
use crate::lock::LockLevel;
use crate::plan::{Batch, MigrationPlan};
use crate::port::{Connection, Connector};
use crate::transaction::TransactionManager;

/// How one batch went.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    /// Batch index.
    pub index: usize,
    /// Number of operations in the batch.
    pub operations: usize,
    /// Strongest lock the batch took.
    pub lock_level: LockLevel,
    /// Whether it ran inside a transaction.
    pub transactional: bool,
    /// Deadlock retries spent.
    pub retry_count: u32,
    /// Wall-clock duration.
    pub duration_ms: u64,
    /// Error that stopped the batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchOutcome {
    /// Check if the batch succeeded.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Result of running a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanExecution {
    /// Every attempted batch, in order.
    pub batches: Vec<BatchOutcome>,
    /// Whether every batch ran.
    pub completed: bool,
    /// Index of the batch that stopped the run.
    pub failed_batch: Option<usize>,
}

impl PlanExecution {
    /// Retries spent across all batches.
    pub fn total_retries(&self) -> u32 {
        self.batches.iter().map(|b| b.retry_count).sum()
    }

    /// Get a summary of the run.
    pub fn summary(&self) -> String {
        match self.failed_batch {
            None => format!(
                "{} batches applied ({} retries)",
                self.batches.len(),
                self.total_retries()
            ),
            Some(index) => format!(
                "Stopped at batch {} after {} applied",
                index,
                self.batches.len().saturating_sub(1)
            ),
        }
    }
}

/// Runs plan batches one after another.
pub struct BatchRunner<K: Connector> {
    manager: TransactionManager<K>,
}

impl<K: Connector> BatchRunner<K> {
    /// Create a runner on top of a transaction manager.
    pub fn new(manager: TransactionManager<K>) -> Self {
        Self { manager }
    }

    /// The underlying transaction manager.
    pub fn manager(&self) -> &TransactionManager<K> {
        &self.manager
    }

    /// Run every batch in order, stopping at the first failure.
    ///
    /// Transactional batches commit as a unit, with each operation under its
    /// own savepoint. Other batches run statement by statement on a fresh
    /// connection. Either way deadlocks are retried.
    pub async fn execute_plan(&self, plan: &MigrationPlan) -> GuardResult<PlanExecution> {
        info!(
            batches = plan.batches.len(),
            operations = plan.operation_count(),
            risk = plan.risk.score,
            "Executing migration plan"
        );

        let mut outcomes = Vec::with_capacity(plan.batches.len());
        for batch in &plan.batches {
            let started = Instant::now();
            info!(
                batch = batch.index,
                operations = batch.len(),
                lock = %batch.lock_level,
                transactional = batch.transactional,
                "Executing batch"
            );

            let result = if batch.transactional {
                self.run_in_transaction(batch).await
            } else {
                self.run_direct(batch).await
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            let mut outcome = BatchOutcome {
                index: batch.index,
                operations: batch.len(),
                lock_level: batch.lock_level,
                transactional: batch.transactional,
                retry_count: 0,
                duration_ms,
                error: None,
            };

            match result {
                Ok(retry_count) => {
                    outcome.retry_count = retry_count;
                    info!(batch = batch.index, duration_ms, retry_count, "Batch applied");
                    outcomes.push(outcome);
                }
                Err(err) => {
                    warn!(batch = batch.index, error = %err, "Batch failed");
                    outcome.error = Some(err.to_string());
                    outcomes.push(outcome);
                    return Ok(PlanExecution {
                        batches: outcomes,
                        completed: false,
                        failed_batch: Some(batch.index),
                    });
                }
            }
        }

        Ok(PlanExecution {
            batches: outcomes,
            completed: true,
            failed_batch: None,
        })
    }

    async fn run_in_transaction(&self, batch: &Batch) -> GuardResult<u32> {
        let statements = batch.statements();

        let outcome = self
            .manager
            .execute_in_transaction(|tx| {
                let statements = statements.clone();
                Box::pin(async move {
                    for sql in statements {
                        tx.with_savepoint(None, move |tx| {
                            Box::pin(async move { tx.batch_execute(&sql).await })
                        })
                        .await?;
                    }
                    Ok(())
                })
            })
            .await?;
        Ok(outcome.retry_count)
    }

    async fn run_direct(&self, batch: &Batch) -> GuardResult<u32> {
        let connector = self.manager.connector();
        let mut retries = 0;

        for sql in batch.statements() {
            let sql = &sql;
            let outcome = self
                .manager
                .execute_with_deadlock_retry(move || async move {
                    let mut conn = connector.connect().await?;
                    debug!(sql = %sql, "Executing outside transaction");
                    conn.batch_execute(sql).await?;
                    Ok(())
                })
                .await?;
            retries += outcome.retry_count;
        }
        Ok(retries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Operation;
    use crate::plan::{Planner, PlannerConfig};
    use crate::port::DbError;
    use crate::retry::RetryConfig;
    use crate::risk::{RiskConfig, RiskContext};
    use crate::snapshot::ColumnDef;
    use crate::testing::ScriptedConnection;
    use crate::transaction::ExecutorConfig;
    use std::time::Duration;

    fn runner(conn: &ScriptedConnection) -> BatchRunner<ScriptedConnection> {
        let config = ExecutorConfig::new().retry(
            RetryConfig::new()
                .base_delay(Duration::from_millis(1))
                .jitter(false),
        );
        BatchRunner::new(TransactionManager::new(conn.clone(), config))
    }

    fn plan() -> MigrationPlan {
        let ops = vec![
            Operation::create_table("users", vec![ColumnDef::new("id", "integer")]),
            Operation::add_column("users", ColumnDef::new("bio", "text").nullable(true)),
            Operation::create_index("users", "idx_users_bio", vec!["bio".into()], true),
        ];
        Planner::new(PlannerConfig::new(), RiskConfig::default())
            .plan(&ops, &RiskContext::default())
            .unwrap()
    }

    #[tokio::test]
    async fn test_execute_plan_runs_every_batch() {
        let conn = ScriptedConnection::new();
        let plan = plan();
        let execution = runner(&conn).execute_plan(&plan).await.unwrap();

        assert!(execution.completed);
        assert_eq!(execution.failed_batch, None);
        assert_eq!(execution.batches.len(), plan.batches.len());
        assert!(execution.batches.iter().all(BatchOutcome::is_success));

        let transactional = plan.batches.iter().filter(|b| b.transactional).count();
        let statements = conn.statements();
        assert_eq!(
            statements.iter().filter(|s| s.starts_with("BEGIN")).count(),
            transactional
        );
        assert!(conn.executed("CREATE INDEX CONCURRENTLY"));
        assert!(conn.executed("SAVEPOINT sp_1"));
    }

    #[tokio::test]
    async fn test_failed_batch_stops_run() {
        let conn = ScriptedConnection::new();
        conn.fail_on("ALTER TABLE \"users\" ADD COLUMN", DbError::other("column exists"));
        let plan = plan();
        let execution = runner(&conn).execute_plan(&plan).await.unwrap();

        assert!(!execution.completed);
        let failed = execution.failed_batch.unwrap();
        assert_eq!(execution.batches.len(), failed + 1);
        assert!(execution.batches[failed].error.is_some());
        assert!(!conn.executed("CREATE INDEX CONCURRENTLY"));
    }

    #[tokio::test]
    async fn test_direct_batch_retries_deadlock() {
        let conn = ScriptedConnection::new();
        conn.fail_times(
            "CREATE INDEX CONCURRENTLY",
            1,
            DbError::from_sqlstate(Some("40P01"), "deadlock detected"),
        );
        let plan = plan();
        let execution = runner(&conn).execute_plan(&plan).await.unwrap();

        assert!(execution.completed);
        let direct = execution.batches.iter().find(|b| !b.transactional).unwrap();
        assert_eq!(direct.retry_count, 1);
        assert_eq!(execution.total_retries(), 1);
    }

    #[tokio::test]
    async fn test_empty_plan() {
        let conn = ScriptedConnection::new();
        let plan = Planner::default().plan(&[], &RiskContext::default()).unwrap();
        let execution = runner(&conn).execute_plan(&plan).await.unwrap();
        assert!(execution.completed);
        assert!(execution.batches.is_empty());
        assert!(conn.statements().is_empty());
    }
}
