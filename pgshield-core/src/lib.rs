//! # pgshield-core
//!
//! Safety and execution core for PostgreSQL schema migrations.
//!
//! This crate provides:
//! - **Drift validation** between an expected and an actual schema snapshot
//! - **Lock classification** of DDL operations against PostgreSQL's lock matrix
//! - **Batching** of operations into lock-compatible, dependency-ordered groups
//! - **Risk assessment** of a migration before it runs
//! - **Guarded execution** in transactions with savepoints and deadlock retry
//! - **Post-migration verification** of checksums, schema changes, data
//!   integrity, rollback triggers and performance
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     ┌────────────────┐     ┌──────────────┐
//! │ SchemaSource │────▶│ DriftValidator │────▶│  Operations  │
//! └──────────────┘     └────────────────┘     └──────────────┘
//!                                                    │
//!                                                    ▼
//!                      ┌────────────────┐     ┌──────────────┐
//!                      │  BatchRunner   │◀────│   Planner    │
//!                      └────────────────┘     └──────────────┘
//!                              │
//!                              ▼
//!                      ┌────────────────┐
//!                      │    Verifier    │
//!                      └────────────────┘
//! ```
//!
//! The core never talks to a driver. Hosts implement the [`Connection`],
//! [`Connector`] and [`SchemaSource`] ports; `pgshield-postgres` provides them
//! for PostgreSQL.
//!
//! ## Example
//!
//! ```rust,ignore
//! use pgshield_core::{
//!     BatchRunner, DriftValidator, Planner, RiskContext, ShieldConfig, TransactionManager,
//! };
//!
//! async fn migrate<K: Connector>(connector: K, expected: SchemaSnapshot, actual: SchemaSnapshot)
//!     -> GuardResult<()>
//! {
//!     let config = ShieldConfig::load("pgshield.toml").await?;
//!
//!     let report = DriftValidator::new(config.drift.clone()).detect(&expected, &actual)?;
//!     println!("{}", report.summary());
//!
//!     let planner = Planner::new(config.planner.clone(), config.risk.clone());
//!     let plan = planner.plan(&report.to_operations(&expected), &RiskContext::default())?;
//!     println!("{}", plan.summary());
//!
//!     let runner = BatchRunner::new(TransactionManager::new(connector, config.executor));
//!     let execution = runner.execute_plan(&plan).await?;
//!     println!("{}", execution.summary());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod drift;
pub mod error;
pub mod lock;
pub mod operation;
pub mod plan;
pub mod port;
pub mod retry;
pub mod risk;
pub mod runner;
pub mod snapshot;
pub mod sql;
pub mod transaction;
pub mod verify;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-exports
pub use config::ShieldConfig;
pub use drift::{
    Difference, DifferenceKind, DriftCategory, DriftConfig, DriftReport, DriftValidator, Impact,
    RepairAction, RiskLevel, Severity, TypeTolerance, detect_drift,
};
pub use error::{GuardError, GuardResult};
pub use lock::{LockLevel, are_locks_compatible, calculate_operation_lock};
pub use operation::{ColumnChange, ConstraintSpec, DefaultChange, Operation, OperationKind};
pub use plan::{
    Batch, LockScope, MigrationPlan, Planner, PlannerConfig, batch_operations,
    batch_operations_with_scope, order_operations,
};
pub use port::{
    Clock, Connection, Connector, DbError, DbErrorKind, JsonSchemaSource, SchemaSource,
    SqlValue, StaticSchemaSource, SystemClock, classify_sqlstate,
};
pub use retry::{RetryConfig, Retried, retry_on_deadlock};
pub use risk::{
    ContentionLevel, RiskAssessment, RiskAssessor, RiskBand, RiskConfig, RiskContext,
    TableSizeClass, assess_migration_risk,
};
pub use runner::{BatchOutcome, BatchRunner, PlanExecution};
pub use snapshot::{ColumnDef, Directive, DirectiveKind, SchemaSnapshot, TableDef};
pub use transaction::{
    AccessMode, ExecutorConfig, IsolationLevel, Transaction, TransactionInfo, TransactionManager,
    TransactionOptions, TransactionStatus, TransactionSummary, execute_in_transaction,
    execute_with_savepoint,
};
pub use verify::{
    IntegrityViolation, OverallStatus, PerformanceSample, RollbackTrigger, StepStatus,
    VerificationContext, VerificationResult, Verifier, VerifierConfig, derive_overall,
    verify_migration, verify_offline,
};
