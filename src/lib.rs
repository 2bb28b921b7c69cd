//! # pgshield
//!
//! Safety and execution layer for PostgreSQL schema migrations.
//!
//! pgshield provides:
//! - Drift validation between a declared schema and a live database
//! - Lock classification and lock-compatible batching of DDL operations
//! - Risk assessment before a migration runs
//! - Guarded execution with savepoints and deadlock retry
//! - Post-migration verification
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pgshield::prelude::*;
//! use pgshield::postgres::{PgPool, PgSchemaSource};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), GuardError> {
//!     let config = ShieldConfig::load("pgshield.toml").await?;
//!     let pool = PgPool::from_url("postgresql://localhost/app")?;
//!
//!     let expected = JsonSchemaSource::new("schema.json").snapshot().await?;
//!     let actual = PgSchemaSource::new(pool.clone()).snapshot().await?;
//!
//!     let report = DriftValidator::new(config.drift.clone()).detect(&expected, &actual)?;
//!     let plan = Planner::new(config.planner.clone(), config.risk.clone())
//!         .plan(&report.to_operations(&expected), &RiskContext::default())?;
//!
//!     let runner = BatchRunner::new(TransactionManager::new(pool, config.executor.clone()));
//!     let execution = runner.execute_plan(&plan).await?;
//!     println!("{}", execution.summary());
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(rustdoc::broken_intra_doc_links)]

pub use pgshield_core::*;

/// PostgreSQL adapter.
#[cfg(feature = "postgres")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
pub mod postgres {
    pub use pgshield_postgres::*;
}

/// Prelude module for convenient imports.
pub mod prelude {
    pub use pgshield_core::{
        BatchRunner, Connection, Connector, DriftValidator, GuardError, GuardResult,
        JsonSchemaSource, MigrationPlan, Operation, Planner, RiskContext, SchemaSnapshot,
        SchemaSource, ShieldConfig, TransactionManager, Verifier,
    };
}
