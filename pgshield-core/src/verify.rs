//! Post-migration verification.
//!
//! Five independent steps, each of which can be switched off:
//!
//! 1. checksum validation of the after-snapshot;
//! 2. schema comparison between the before and after snapshots;
//! 3. data integrity probes for foreign keys, unique and check constraints;
//! 4. rollback trigger validation;
//! 5. performance baseline comparison.
//!
//! Outside strict mode a step that cannot run is recorded as
//! [`StepStatus::Error`] and the remaining steps still run, so the caller
//! always gets a complete [`VerificationResult`]. In strict mode a checksum
//! mismatch, any integrity violation, or any step error is returned as an
//! error instead.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::drift::{
    Difference, DifferenceKind, DriftConfig, DriftValidator, TypeTolerance, constraint_name,
    directive_columns,
};
use crate::error::{GuardError, GuardResult};
use crate::port::{Clock, Connection, SystemClock};
use crate::snapshot::{Directive, DirectiveKind, SchemaSnapshot};
use crate::sql::{ident_list, quote_ident};
use crate::transaction::TransactionOptions;

/// Verifier settings, read from `[verifier]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// Run checksum validation.
    pub checksum_validation: bool,
    /// Run schema comparison.
    pub schema_comparison: bool,
    /// Run data integrity probes.
    pub data_integrity_check: bool,
    /// Run rollback trigger validation.
    pub rollback_validation: bool,
    /// Run performance baseline comparison.
    pub performance_baseline: bool,
    /// Raise instead of reporting.
    pub strict: bool,
    /// Relative change, in percent, beyond which a query counts as changed.
    pub regression_threshold_pct: f64,
    /// Per-probe timeout, in milliseconds.
    pub probe_timeout_ms: u64,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            checksum_validation: true,
            schema_comparison: true,
            data_integrity_check: true,
            rollback_validation: true,
            performance_baseline: true,
            strict: false,
            regression_threshold_pct: 10.0,
            probe_timeout_ms: 30_000,
        }
    }
}

impl VerifierConfig {
    /// Create a new configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable checksum validation.
    pub fn checksum_validation(mut self, enabled: bool) -> Self {
        self.checksum_validation = enabled;
        self
    }

    /// Enable or disable schema comparison.
    pub fn schema_comparison(mut self, enabled: bool) -> Self {
        self.schema_comparison = enabled;
        self
    }

    /// Enable or disable integrity probes.
    pub fn data_integrity_check(mut self, enabled: bool) -> Self {
        self.data_integrity_check = enabled;
        self
    }

    /// Enable or disable rollback trigger validation.
    pub fn rollback_validation(mut self, enabled: bool) -> Self {
        self.rollback_validation = enabled;
        self
    }

    /// Enable or disable the performance comparison.
    pub fn performance_baseline(mut self, enabled: bool) -> Self {
        self.performance_baseline = enabled;
        self
    }

    /// Enable or disable strict mode.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Set the regression threshold.
    pub fn regression_threshold_pct(mut self, pct: f64) -> Self {
        self.regression_threshold_pct = pct;
        self
    }

    /// Set the probe timeout.
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Reject out-of-range values.
    pub fn validate(&self) -> GuardResult<()> {
        if !self.regression_threshold_pct.is_finite() || self.regression_threshold_pct < 0.0 {
            return Err(GuardError::config(
                "verifier.regression_threshold_pct must be a non-negative number",
            ));
        }
        if self.probe_timeout_ms == 0 {
            return Err(GuardError::config("verifier.probe_timeout_ms must be positive"));
        }
        Ok(())
    }
}

/// Status of one verification step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Checked and fine.
    Passed,
    /// Checked and not fine.
    Failed,
    /// Could not run.
    Error,
    /// Disabled or nothing to check.
    Skipped,
    /// Before and after are identical.
    NoChanges,
    /// Before and after differ.
    ChangesDetected,
    /// Fine, with something worth a look.
    Warning,
}

impl StepStatus {
    /// Every status.
    pub const ALL: [StepStatus; 7] = [
        Self::Passed,
        Self::Failed,
        Self::Error,
        Self::Skipped,
        Self::NoChanges,
        Self::ChangesDetected,
        Self::Warning,
    ];

    fn is_clean(&self) -> bool {
        matches!(self, Self::Passed | Self::NoChanges | Self::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Error => "error",
            Self::Skipped => "skipped",
            Self::NoChanges => "no_changes",
            Self::ChangesDetected => "changes_detected",
            Self::Warning => "warning",
        };
        f.write_str(s)
    }
}

/// Overall verification outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    /// Every step passed, found no changes, or was skipped.
    Passed,
    /// Some step failed.
    Failed,
    /// Some step could not run.
    Error,
    /// Anything else.
    Partial,
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Error => "error",
            Self::Partial => "partial",
        };
        f.write_str(s)
    }
}

/// Combine step statuses. Error outranks failed, which outranks the rest.
pub fn derive_overall(statuses: &[StepStatus]) -> OverallStatus {
    if statuses.contains(&StepStatus::Error) {
        OverallStatus::Error
    } else if statuses.contains(&StepStatus::Failed) {
        OverallStatus::Failed
    } else if statuses.iter().all(StepStatus::is_clean) {
        OverallStatus::Passed
    } else {
        OverallStatus::Partial
    }
}

/// Outcome of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult<T> {
    /// Status.
    pub status: StepStatus,
    /// What the step found.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<T>,
    /// Why the step could not run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> StepResult<T> {
    fn new(status: StepStatus, details: T) -> Self {
        Self {
            status,
            details: Some(details),
            error: None,
        }
    }

    fn skipped() -> Self {
        Self {
            status: StepStatus::Skipped,
            details: None,
            error: None,
        }
    }

    fn errored(err: &GuardError) -> Self {
        Self {
            status: StepStatus::Error,
            details: None,
            error: Some(err.to_string()),
        }
    }
}

/// Checksum step details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumDetails {
    /// Expected checksum, if one was supplied.
    pub expected: Option<String>,
    /// Checksum of the after-snapshot.
    pub actual: String,
}

/// Schema comparison details.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaChanges {
    /// Tables only in the after-snapshot.
    pub added_tables: Vec<String>,
    /// Tables only in the before-snapshot.
    pub dropped_tables: Vec<String>,
    /// Tables in both with differences.
    pub modified_tables: Vec<String>,
    /// Underlying differences, before as expected and after as actual.
    pub differences: Vec<Difference>,
}

impl SchemaChanges {
    /// Check if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.differences.is_empty()
    }
}

/// Kind of constraint an integrity probe checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    /// Foreign key.
    ForeignKey,
    /// Unique constraint.
    Unique,
    /// Check constraint.
    Check,
}

/// A targeted query counting rows that violate one constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityProbe {
    /// Owning table.
    pub table: String,
    /// Constraint name.
    pub constraint: String,
    /// Constraint kind.
    pub kind: ConstraintKind,
    /// Count query.
    pub sql: String,
}

/// Rows violating a declared constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityViolation {
    /// Owning table.
    pub table: String,
    /// Constraint name.
    pub constraint: String,
    /// Constraint kind.
    pub kind: ConstraintKind,
    /// Number of violating rows.
    pub violating_rows: i64,
}

/// Integrity step details.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    /// Probes executed.
    pub checks_run: usize,
    /// Violations found.
    pub violations: Vec<IntegrityViolation>,
}

/// A condition under which a migration should be rolled back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackTrigger {
    /// Trigger name.
    pub name: String,
    /// Condition being watched (e.g. `error_rate`).
    pub condition: String,
    /// Threshold at which the trigger fires.
    pub threshold: f64,
    /// SQL that undoes the migration.
    pub rollback_sql: String,
    /// Whether the trigger is armed.
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

fn enabled_default() -> bool {
    true
}

impl RollbackTrigger {
    /// Create an armed trigger.
    pub fn new(
        name: impl Into<String>,
        condition: impl Into<String>,
        threshold: f64,
        rollback_sql: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            condition: condition.into(),
            threshold,
            rollback_sql: rollback_sql.into(),
            enabled: true,
        }
    }

    /// Disarm the trigger.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// What is wrong with the trigger, if anything.
    pub fn problem(&self) -> Option<String> {
        if self.name.trim().is_empty() {
            Some("name is empty".to_string())
        } else if self.condition.trim().is_empty() {
            Some("condition is empty".to_string())
        } else if self.rollback_sql.trim().is_empty() {
            Some("rollback SQL is empty".to_string())
        } else if !self.threshold.is_finite() || self.threshold < 0.0 {
            Some(format!("threshold {} is not a non-negative number", self.threshold))
        } else if !self.enabled {
            Some("trigger is disabled".to_string())
        } else {
            None
        }
    }
}

/// A trigger that failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidTrigger {
    /// Trigger name.
    pub name: String,
    /// What is wrong with it.
    pub reason: String,
}

/// Rollback step details.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackReport {
    /// Well-formed triggers.
    pub valid: Vec<String>,
    /// Malformed triggers.
    pub invalid: Vec<InvalidTrigger>,
}

/// Mean execution time per named query, in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSample {
    /// Query name to mean execution time.
    pub queries: BTreeMap<String, f64>,
}

impl PerformanceSample {
    /// Create an empty sample.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a query timing.
    pub fn query(mut self, name: impl Into<String>, mean_ms: f64) -> Self {
        self.queries.insert(name.into(), mean_ms);
        self
    }
}

/// Direction of a timing change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceChange {
    /// Slower beyond the threshold.
    Regression,
    /// Faster beyond the threshold.
    Improvement,
    /// Within the threshold.
    Stable,
}

/// One query compared against its baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryComparison {
    /// Query name.
    pub query: String,
    /// Baseline mean, in milliseconds.
    pub baseline_ms: f64,
    /// Current mean, in milliseconds.
    pub current_ms: f64,
    /// Relative change, in percent.
    pub change_pct: f64,
    /// Classification.
    pub change: PerformanceChange,
}

/// Performance step details.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    /// Queries present in both samples, by name.
    pub queries: Vec<QueryComparison>,
}

impl PerformanceReport {
    /// Queries that got slower.
    pub fn regressions(&self) -> impl Iterator<Item = &QueryComparison> {
        self.queries
            .iter()
            .filter(|q| q.change == PerformanceChange::Regression)
    }
}

/// Inputs to a verification run.
#[derive(Debug, Clone)]
pub struct VerificationContext {
    /// Schema before the migration.
    pub before: SchemaSnapshot,
    /// Schema after the migration.
    pub after: SchemaSnapshot,
    /// Checksum the after-snapshot should have.
    pub expected_checksum: Option<String>,
    /// Declared rollback triggers.
    pub rollback_triggers: Vec<RollbackTrigger>,
    /// Timings before the migration.
    pub baseline: Option<PerformanceSample>,
    /// Timings after the migration.
    pub current: Option<PerformanceSample>,
}

impl VerificationContext {
    /// Create a context from the two snapshots.
    pub fn new(before: SchemaSnapshot, after: SchemaSnapshot) -> Self {
        Self {
            before,
            after,
            expected_checksum: None,
            rollback_triggers: Vec::new(),
            baseline: None,
            current: None,
        }
    }

    /// Set the expected checksum.
    pub fn expected_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.expected_checksum = Some(checksum.into());
        self
    }

    /// Add a rollback trigger.
    pub fn rollback_trigger(mut self, trigger: RollbackTrigger) -> Self {
        self.rollback_triggers.push(trigger);
        self
    }

    /// Set baseline and current timings.
    pub fn performance(mut self, baseline: PerformanceSample, current: PerformanceSample) -> Self {
        self.baseline = Some(baseline);
        self.current = Some(current);
        self
    }
}

/// Outcome of a verification run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    /// Checksum step.
    pub checksum_validation: StepResult<ChecksumDetails>,
    /// Schema comparison step.
    pub schema_comparison: StepResult<SchemaChanges>,
    /// Integrity step.
    pub data_integrity_check: StepResult<IntegrityReport>,
    /// Rollback trigger step.
    pub rollback_validation: StepResult<RollbackReport>,
    /// Performance step.
    pub performance_baseline: StepResult<PerformanceReport>,
    /// Combined status.
    pub overall: OverallStatus,
    /// When verification finished.
    pub verified_at: DateTime<Utc>,
    /// Wall-clock duration.
    pub duration_ms: u64,
}

impl VerificationResult {
    /// Status of every step, in order.
    pub fn statuses(&self) -> [StepStatus; 5] {
        [
            self.checksum_validation.status,
            self.schema_comparison.status,
            self.data_integrity_check.status,
            self.rollback_validation.status,
            self.performance_baseline.status,
        ]
    }
}

/// Build the integrity probes for every constraint declared on `snapshot`.
///
/// Primary keys are not probed. Multi-column foreign keys are skipped.
pub fn integrity_probes(snapshot: &SchemaSnapshot) -> Vec<IntegrityProbe> {
    let mut probes = Vec::new();
    for (table_name, table) in &snapshot.tables {
        for directive in &table.directives {
            probes.extend(probe_for(table_name, directive, None));
        }
        for (column_name, column) in &table.columns {
            for directive in &column.directives {
                probes.extend(probe_for(table_name, directive, Some(column_name)));
            }
        }
    }
    probes
}

fn probe_for(table: &str, directive: &Directive, owner: Option<&str>) -> Option<IntegrityProbe> {
    let columns = directive_columns(directive, owner);
    let t = quote_ident(table);

    let (kind, constraint, sql) = match directive.kind {
        DirectiveKind::ForeignKey => {
            let [column] = columns.as_slice() else {
                debug!(table, "Skipping multi-column foreign key probe");
                return None;
            };
            let (ref_table, ref_column) = directive.foreign_key_target()?;
            let c = quote_ident(column);
            let sql = format!(
                "SELECT COUNT(*) FROM {t} AS child WHERE child.{c} IS NOT NULL \
                 AND NOT EXISTS (SELECT 1 FROM {} AS parent WHERE parent.{} = child.{c})",
                quote_ident(&ref_table),
                quote_ident(&ref_column),
            );
            (
                ConstraintKind::ForeignKey,
                constraint_name(directive, table, &columns, "fkey"),
                sql,
            )
        }
        DirectiveKind::Unique => {
            if columns.is_empty() {
                return None;
            }
            let not_null = columns
                .iter()
                .map(|c| format!("{} IS NOT NULL", quote_ident(c)))
                .collect::<Vec<_>>()
                .join(" AND ");
            let sql = format!(
                "SELECT COALESCE(SUM(n), 0)::bigint FROM (SELECT COUNT(*) AS n FROM {t} \
                 WHERE {not_null} GROUP BY {} HAVING COUNT(*) > 1) AS duplicates",
                ident_list(&columns),
            );
            (
                ConstraintKind::Unique,
                constraint_name(directive, table, &columns, "key"),
                sql,
            )
        }
        DirectiveKind::Check => {
            let expression = directive.arg_value("expression")?;
            let sql = format!("SELECT COUNT(*) FROM {t} WHERE NOT ({expression})");
            (
                ConstraintKind::Check,
                constraint_name(directive, table, &columns, "check"),
                sql,
            )
        }
        _ => return None,
    };

    Some(IntegrityProbe {
        table: table.to_string(),
        constraint,
        kind,
        sql,
    })
}

/// Runs the verification steps.
#[derive(Debug, Clone)]
pub struct Verifier {
    config: VerifierConfig,
    comparator: DriftValidator,
    clock: Arc<dyn Clock>,
}

impl Default for Verifier {
    fn default() -> Self {
        Self::new(VerifierConfig::default())
    }
}

impl Verifier {
    /// Create a verifier.
    pub fn new(config: VerifierConfig) -> Self {
        Self {
            config,
            comparator: DriftValidator::new(
                DriftConfig::new().type_tolerance(TypeTolerance::Strict),
            ),
            clock: Arc::new(SystemClock),
        }
    }

    /// Use a different clock for timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The verifier's configuration.
    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    /// Run every enabled step, probing integrity over `conn`.
    pub async fn verify_migration(
        &self,
        ctx: &VerificationContext,
        conn: &mut dyn Connection,
    ) -> GuardResult<VerificationResult> {
        self.run(ctx, Some(conn)).await
    }

    /// Run every enabled step that needs no database.
    pub async fn verify_offline(&self, ctx: &VerificationContext) -> GuardResult<VerificationResult> {
        self.run(ctx, None).await
    }

    async fn run(
        &self,
        ctx: &VerificationContext,
        conn: Option<&mut dyn Connection>,
    ) -> GuardResult<VerificationResult> {
        let started = Instant::now();

        let checksum_validation = if self.config.checksum_validation {
            self.validate_checksum(ctx)?
        } else {
            StepResult::skipped()
        };

        let schema_comparison = if self.config.schema_comparison {
            self.compare_schemas(ctx)?
        } else {
            StepResult::skipped()
        };

        let data_integrity_check = match conn {
            Some(conn) if self.config.data_integrity_check => {
                self.check_integrity(&ctx.after, conn).await?
            }
            _ => StepResult::skipped(),
        };

        let rollback_validation = if self.config.rollback_validation {
            validate_rollback_triggers(&ctx.rollback_triggers)
        } else {
            StepResult::skipped()
        };

        let performance_baseline = match (&ctx.baseline, &ctx.current) {
            (Some(baseline), Some(current)) if self.config.performance_baseline => {
                compare_performance(baseline, current, self.config.regression_threshold_pct)
            }
            _ => StepResult::skipped(),
        };

        let mut result = VerificationResult {
            checksum_validation,
            schema_comparison,
            data_integrity_check,
            rollback_validation,
            performance_baseline,
            overall: OverallStatus::Passed,
            verified_at: self.clock.now(),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        result.overall = derive_overall(&result.statuses());

        info!(
            overall = %result.overall,
            checksum = %result.checksum_validation.status,
            schema = %result.schema_comparison.status,
            integrity = %result.data_integrity_check.status,
            rollback = %result.rollback_validation.status,
            performance = %result.performance_baseline.status,
            "Verification finished"
        );
        Ok(result)
    }

    fn degrade<T>(&self, step: &str, err: GuardError) -> GuardResult<StepResult<T>> {
        if self.config.strict {
            return Err(err);
        }
        warn!(step, error = %err, "Verification step could not run");
        Ok(StepResult::errored(&err))
    }

    fn validate_checksum(&self, ctx: &VerificationContext) -> GuardResult<StepResult<ChecksumDetails>> {
        let actual = match ctx.after.checksum() {
            Ok(checksum) => checksum,
            Err(err) => return self.degrade("checksum_validation", err),
        };

        let Some(expected) = ctx.expected_checksum.clone() else {
            return Ok(StepResult::new(
                StepStatus::Skipped,
                ChecksumDetails {
                    expected: None,
                    actual,
                },
            ));
        };

        if expected == actual {
            return Ok(StepResult::new(
                StepStatus::Passed,
                ChecksumDetails {
                    expected: Some(expected),
                    actual,
                },
            ));
        }

        if self.config.strict {
            return Err(GuardError::ChecksumMismatch { expected, actual });
        }
        warn!(expected = %expected, actual = %actual, "Checksum mismatch");
        Ok(StepResult::new(
            StepStatus::Failed,
            ChecksumDetails {
                expected: Some(expected),
                actual,
            },
        ))
    }

    fn compare_schemas(&self, ctx: &VerificationContext) -> GuardResult<StepResult<SchemaChanges>> {
        let report = match self.comparator.detect(&ctx.before, &ctx.after) {
            Ok(report) => report,
            Err(err) => return self.degrade("schema_comparison", err),
        };

        let changes = schema_changes(report.differences);
        let status = if changes.is_empty() {
            StepStatus::NoChanges
        } else {
            StepStatus::ChangesDetected
        };
        Ok(StepResult::new(status, changes))
    }

    async fn check_integrity(
        &self,
        snapshot: &SchemaSnapshot,
        conn: &mut dyn Connection,
    ) -> GuardResult<StepResult<IntegrityReport>> {
        let probes = integrity_probes(snapshot);
        if probes.is_empty() {
            return Ok(StepResult::new(StepStatus::Passed, IntegrityReport::default()));
        }

        let violations = match self.run_probes(&probes, conn).await {
            Ok(violations) => violations,
            Err(err) => return self.degrade("data_integrity_check", err),
        };

        if violations.is_empty() {
            return Ok(StepResult::new(
                StepStatus::Passed,
                IntegrityReport {
                    checks_run: probes.len(),
                    violations,
                },
            ));
        }
        if self.config.strict {
            return Err(GuardError::IntegrityViolations { violations });
        }
        warn!(violations = violations.len(), "Integrity violations found");
        Ok(StepResult::new(
            StepStatus::Failed,
            IntegrityReport {
                checks_run: probes.len(),
                violations,
            },
        ))
    }

    async fn run_probes(
        &self,
        probes: &[IntegrityProbe],
        conn: &mut dyn Connection,
    ) -> GuardResult<Vec<IntegrityViolation>> {
        let timeout = Duration::from_millis(self.config.probe_timeout_ms);
        let options = TransactionOptions::new().read_only().statement_timeout(timeout);

        conn.begin(&options).await?;
        let result = run_probes_in(probes, conn, &options, timeout).await;
        if let Err(err) = conn.rollback().await {
            warn!(error = %err, "Failed to close integrity probe transaction");
        }
        result
    }
}

async fn run_probes_in(
    probes: &[IntegrityProbe],
    conn: &mut dyn Connection,
    options: &TransactionOptions,
    timeout: Duration,
) -> GuardResult<Vec<IntegrityViolation>> {
    for statement in options.set_local_statements() {
        conn.batch_execute(&statement).await?;
    }

    let mut violations = Vec::new();
    for probe in probes {
        debug!(table = %probe.table, constraint = %probe.constraint, "Running integrity probe");
        let count = tokio::time::timeout(timeout, conn.query_count(&probe.sql, &[]))
            .await
            .map_err(|_| {
                GuardError::timeout(
                    format!("integrity probe {}", probe.constraint),
                    timeout.as_millis() as u64,
                )
            })??;

        if count > 0 {
            violations.push(IntegrityViolation {
                table: probe.table.clone(),
                constraint: probe.constraint.clone(),
                kind: probe.kind,
                violating_rows: count,
            });
        }
    }
    Ok(violations)
}

fn schema_changes(differences: Vec<Difference>) -> SchemaChanges {
    let mut added = BTreeSet::new();
    let mut dropped = BTreeSet::new();
    let mut modified = BTreeSet::new();

    for diff in &differences {
        match diff.kind {
            DifferenceKind::ExtraTable => {
                added.insert(diff.table.clone());
            }
            DifferenceKind::MissingTable => {
                dropped.insert(diff.table.clone());
            }
            _ => {
                modified.insert(diff.table.clone());
            }
        }
    }

    SchemaChanges {
        added_tables: added.into_iter().collect(),
        dropped_tables: dropped.into_iter().collect(),
        modified_tables: modified.into_iter().collect(),
        differences,
    }
}

/// Check every declared rollback trigger.
pub fn validate_rollback_triggers(triggers: &[RollbackTrigger]) -> StepResult<RollbackReport> {
    if triggers.is_empty() {
        return StepResult::skipped();
    }

    let mut report = RollbackReport::default();
    let mut seen = BTreeSet::new();
    for trigger in triggers {
        let problem = if seen.insert(trigger.name.as_str()) {
            trigger.problem()
        } else {
            Some("duplicate trigger name".to_string())
        };
        match problem {
            Some(reason) => report.invalid.push(InvalidTrigger {
                name: trigger.name.clone(),
                reason,
            }),
            None => report.valid.push(trigger.name.clone()),
        }
    }

    let status = if report.invalid.is_empty() {
        StepStatus::Passed
    } else {
        StepStatus::Failed
    };
    StepResult::new(status, report)
}

/// Compare timings of the queries present in both samples.
pub fn compare_performance(
    baseline: &PerformanceSample,
    current: &PerformanceSample,
    threshold_pct: f64,
) -> StepResult<PerformanceReport> {
    let queries: Vec<QueryComparison> = baseline
        .queries
        .iter()
        .filter_map(|(name, &baseline_ms)| {
            let &current_ms = current.queries.get(name)?;
            let change_pct = if baseline_ms > 0.0 {
                (current_ms - baseline_ms) / baseline_ms * 100.0
            } else if current_ms > 0.0 {
                // Nothing to scale against; report a full doubling.
                100.0
            } else {
                0.0
            };
            let change = if baseline_ms <= 0.0 && current_ms > 0.0 {
                PerformanceChange::Regression
            } else if change_pct > threshold_pct {
                PerformanceChange::Regression
            } else if change_pct < -threshold_pct {
                PerformanceChange::Improvement
            } else {
                PerformanceChange::Stable
            };
            Some(QueryComparison {
                query: name.clone(),
                baseline_ms,
                current_ms,
                change_pct,
                change,
            })
        })
        .collect();

    if queries.is_empty() {
        return StepResult::skipped();
    }

    let report = PerformanceReport { queries };
    let status = if report.regressions().next().is_some() {
        StepStatus::Warning
    } else {
        StepStatus::Passed
    };
    StepResult::new(status, report)
}

/// Offline verification with the default configuration.
pub async fn verify_offline(ctx: &VerificationContext) -> GuardResult<VerificationResult> {
    Verifier::default().verify_offline(ctx).await
}

/// Verification with the default configuration.
pub async fn verify_migration(
    ctx: &VerificationContext,
    conn: &mut dyn Connection,
) -> GuardResult<VerificationResult> {
    Verifier::default().verify_migration(ctx, conn).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{DbError, SqlValue};
    use crate::snapshot::{ColumnDef, TableDef};
    use crate::testing::{FixedClock, ScriptedConnection};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn clock() -> Arc<dyn Clock> {
        Arc::new(FixedClock(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()))
    }

    fn users() -> TableDef {
        TableDef::new("users")
            .column(ColumnDef::new("id", "integer").directive(Directive::primary_key()))
            .column(ColumnDef::new("email", "text").directive(Directive::unique()))
    }

    fn orders() -> TableDef {
        TableDef::new("orders")
            .column(ColumnDef::new("id", "integer").directive(Directive::primary_key()))
            .column(ColumnDef::new("user_id", "integer").directive(Directive::foreign_key("users.id")))
            .column(ColumnDef::new("total", "numeric").directive(Directive::check("total >= 0")))
    }

    fn before() -> SchemaSnapshot {
        SchemaSnapshot::new(Utc::now()).with_table(users())
    }

    fn after() -> SchemaSnapshot {
        SchemaSnapshot::new(Utc::now())
            .with_table(users())
            .with_table(orders())
    }

    fn verifier(config: VerifierConfig) -> Verifier {
        Verifier::new(config).with_clock(clock())
    }

    #[test]
    fn test_error_outranks_everything() {
        for a in StepStatus::ALL {
            for b in StepStatus::ALL {
                let overall = derive_overall(&[StepStatus::Error, a, b, StepStatus::Passed]);
                assert_eq!(overall, OverallStatus::Error);
            }
        }
    }

    #[test]
    fn test_overall_derivation_over_all_combinations() {
        let all = StepStatus::ALL;
        for a in all {
            for b in all {
                for c in all {
                    for d in all {
                        for e in all {
                            let statuses = [a, b, c, d, e];
                            let overall = derive_overall(&statuses);
                            if statuses.contains(&StepStatus::Error) {
                                assert_eq!(overall, OverallStatus::Error);
                            } else if statuses.contains(&StepStatus::Failed) {
                                assert_eq!(overall, OverallStatus::Failed);
                            } else if statuses.iter().all(|s| s.is_clean()) {
                                assert_eq!(overall, OverallStatus::Passed);
                            } else {
                                assert_eq!(overall, OverallStatus::Partial);
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_overall_examples() {
        use StepStatus::*;
        assert_eq!(derive_overall(&[Passed, NoChanges, Skipped]), OverallStatus::Passed);
        assert_eq!(derive_overall(&[Passed, ChangesDetected]), OverallStatus::Partial);
        assert_eq!(derive_overall(&[Warning, Failed]), OverallStatus::Failed);
        assert_eq!(derive_overall(&[Failed, Error]), OverallStatus::Error);
    }

    #[test]
    fn test_probe_sql() {
        let probes = integrity_probes(&after());
        let by_constraint: BTreeMap<_, _> = probes
            .iter()
            .map(|p| (p.constraint.as_str(), p))
            .collect();

        let fk = by_constraint["orders_user_id_fkey"];
        assert_eq!(fk.kind, ConstraintKind::ForeignKey);
        assert_eq!(
            fk.sql,
            "SELECT COUNT(*) FROM \"orders\" AS child WHERE child.\"user_id\" IS NOT NULL \
             AND NOT EXISTS (SELECT 1 FROM \"users\" AS parent WHERE parent.\"id\" = child.\"user_id\")"
        );

        let check = by_constraint["orders_total_check"];
        assert_eq!(check.sql, "SELECT COUNT(*) FROM \"orders\" WHERE NOT (total >= 0)");

        let unique = by_constraint["users_email_key"];
        assert!(unique.sql.contains("GROUP BY \"email\" HAVING COUNT(*) > 1"));
        assert!(unique.sql.contains("WHERE \"email\" IS NOT NULL"));

        assert_eq!(probes.len(), 3);
    }

    #[tokio::test]
    async fn test_identical_snapshots_no_changes() {
        let snapshot = after();
        let ctx = VerificationContext::new(snapshot.clone(), snapshot);
        let result = verifier(VerifierConfig::new()).verify_offline(&ctx).await.unwrap();

        assert_eq!(result.schema_comparison.status, StepStatus::NoChanges);
        assert!(result.schema_comparison.details.unwrap().differences.is_empty());
        assert_eq!(result.overall, OverallStatus::Passed);
    }

    #[tokio::test]
    async fn test_schema_comparison_lists_tables() {
        let renamed = users().column(ColumnDef::new("name", "text").nullable(true));
        let modified = after().with_table(renamed);
        let trimmed = SchemaSnapshot::new(Utc::now()).with_table(orders());

        let ctx = VerificationContext::new(before(), modified.clone());
        let result = verifier(VerifierConfig::new()).verify_offline(&ctx).await.unwrap();
        let changes = result.schema_comparison.details.unwrap();
        assert_eq!(result.schema_comparison.status, StepStatus::ChangesDetected);
        assert_eq!(changes.added_tables, vec!["orders".to_string()]);
        assert_eq!(changes.modified_tables, vec!["users".to_string()]);
        assert!(changes.dropped_tables.is_empty());
        assert_eq!(result.overall, OverallStatus::Partial);

        let ctx = VerificationContext::new(modified, trimmed);
        let result = verifier(VerifierConfig::new()).verify_offline(&ctx).await.unwrap();
        let changes = result.schema_comparison.details.unwrap();
        assert_eq!(changes.dropped_tables, vec!["users".to_string()]);
    }

    #[tokio::test]
    async fn test_checksum_steps() {
        let after = after();
        let checksum = after.checksum().unwrap();

        let ctx = VerificationContext::new(before(), after.clone());
        let result = verifier(VerifierConfig::new()).verify_offline(&ctx).await.unwrap();
        assert_eq!(result.checksum_validation.status, StepStatus::Skipped);
        assert_eq!(result.checksum_validation.details.unwrap().actual, checksum);

        let ctx = VerificationContext::new(before(), after.clone()).expected_checksum(&checksum);
        let result = verifier(VerifierConfig::new()).verify_offline(&ctx).await.unwrap();
        assert_eq!(result.checksum_validation.status, StepStatus::Passed);

        let ctx = VerificationContext::new(before(), after).expected_checksum("deadbeef");
        let result = verifier(VerifierConfig::new()).verify_offline(&ctx).await.unwrap();
        assert_eq!(result.checksum_validation.status, StepStatus::Failed);
        assert_eq!(result.overall, OverallStatus::Failed);

        let err = verifier(VerifierConfig::new().strict(true))
            .verify_offline(&ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::ChecksumMismatch { .. }));
    }

    #[tokio::test]
    async fn test_integrity_violations_reported() {
        let mut conn = ScriptedConnection::new();
        conn.respond_count("NOT EXISTS", 3);
        let ctx = VerificationContext::new(before(), after());

        let result = verifier(VerifierConfig::new())
            .verify_migration(&ctx, &mut conn)
            .await
            .unwrap();
        let report = result.data_integrity_check.details.unwrap();
        assert_eq!(result.data_integrity_check.status, StepStatus::Failed);
        assert_eq!(report.checks_run, 3);
        assert_eq!(
            report.violations,
            vec![IntegrityViolation {
                table: "orders".into(),
                constraint: "orders_user_id_fkey".into(),
                kind: ConstraintKind::ForeignKey,
                violating_rows: 3,
            }]
        );
        assert_eq!(result.overall, OverallStatus::Failed);

        let statements = conn.statements();
        assert_eq!(statements[0], "BEGIN ISOLATION LEVEL READ COMMITTED READ ONLY");
        assert_eq!(statements[1], "SET LOCAL statement_timeout = '30000ms'");
        assert_eq!(statements.last().map(String::as_str), Some("ROLLBACK"));
    }

    #[tokio::test]
    async fn test_strict_integrity_raises() {
        let mut conn = ScriptedConnection::new();
        conn.respond_count("NOT (total >= 0)", 1);
        let ctx = VerificationContext::new(before(), after());

        let err = verifier(VerifierConfig::new().strict(true))
            .verify_migration(&ctx, &mut conn)
            .await
            .unwrap_err();
        match err {
            GuardError::IntegrityViolations { violations } => {
                assert_eq!(violations.len(), 1);
                assert_eq!(violations[0].kind, ConstraintKind::Check);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_probe_failure_degrades_step_only() {
        let mut conn = ScriptedConnection::new();
        conn.fail_on("SELECT COUNT(*)", DbError::other("relation does not exist"));
        let ctx = VerificationContext::new(before(), after())
            .rollback_trigger(RollbackTrigger::new("errors", "error_rate", 0.05, "DROP TABLE orders"));

        let result = verifier(VerifierConfig::new())
            .verify_migration(&ctx, &mut conn)
            .await
            .unwrap();
        assert_eq!(result.data_integrity_check.status, StepStatus::Error);
        assert!(result.data_integrity_check.error.is_some());
        assert_eq!(result.rollback_validation.status, StepStatus::Passed);
        assert_eq!(result.overall, OverallStatus::Error);
        assert!(conn.executed("ROLLBACK"));
    }

    struct SlowConnection;

    #[async_trait]
    impl Connection for SlowConnection {
        async fn execute(&mut self, _sql: &str, _params: &[SqlValue]) -> Result<u64, DbError> {
            Ok(0)
        }

        async fn query_count(&mut self, _sql: &str, _params: &[SqlValue]) -> Result<i64, DbError> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(0)
        }

        async fn batch_execute(&mut self, _sql: &str) -> Result<(), DbError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_probe_timeout_is_distinct_error() {
        let ctx = VerificationContext::new(before(), after());
        let mut conn = SlowConnection;

        let result = verifier(VerifierConfig::new().probe_timeout(Duration::from_millis(20)))
            .verify_migration(&ctx, &mut conn)
            .await
            .unwrap();
        assert_eq!(result.data_integrity_check.status, StepStatus::Error);

        let err = verifier(
            VerifierConfig::new()
                .strict(true)
                .probe_timeout(Duration::from_millis(20)),
        )
        .verify_migration(&ctx, &mut conn)
        .await
        .unwrap_err();
        assert!(err.is_timeout());
        assert!(!err.is_deadlock());
    }

    #[tokio::test]
    async fn test_offline_skips_integrity() {
        let ctx = VerificationContext::new(before(), after());
        let result = verifier(VerifierConfig::new()).verify_offline(&ctx).await.unwrap();
        assert_eq!(result.data_integrity_check.status, StepStatus::Skipped);
    }

    #[test]
    fn test_rollback_trigger_validation() {
        let triggers = vec![
            RollbackTrigger::new("errors", "error_rate", 0.05, "DROP TABLE orders"),
            RollbackTrigger::new("latency", "p99_ms", f64::NAN, "DROP TABLE orders"),
            RollbackTrigger::new("off", "p99_ms", 200.0, "DROP TABLE orders").disabled(),
            RollbackTrigger::new("errors", "error_rate", 0.1, "DROP TABLE orders"),
        ];
        let result = validate_rollback_triggers(&triggers);
        let report = result.details.unwrap();
        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(report.valid, vec!["errors".to_string()]);
        assert_eq!(report.invalid.len(), 3);
        assert_eq!(report.invalid[2].reason, "duplicate trigger name");

        assert_eq!(validate_rollback_triggers(&[]).status, StepStatus::Skipped);
    }

    #[test]
    fn test_performance_classification() {
        let baseline = PerformanceSample::new()
            .query("list_users", 10.0)
            .query("get_order", 20.0)
            .query("search", 100.0)
            .query("removed", 5.0);
        let current = PerformanceSample::new()
            .query("list_users", 10.5)
            .query("get_order", 25.0)
            .query("search", 80.0);

        let result = compare_performance(&baseline, &current, 10.0);
        let report = result.details.unwrap();
        assert_eq!(result.status, StepStatus::Warning);

        let changes: Vec<_> = report.queries.iter().map(|q| (q.query.as_str(), q.change)).collect();
        assert_eq!(
            changes,
            vec![
                ("get_order", PerformanceChange::Regression),
                ("list_users", PerformanceChange::Stable),
                ("search", PerformanceChange::Improvement),
            ]
        );
    }

    #[test]
    fn test_zero_baseline_counts_as_regression() {
        let baseline = PerformanceSample::new()
            .query("cold_cache", 0.0)
            .query("noop", 0.0);
        let current = PerformanceSample::new()
            .query("cold_cache", 0.3)
            .query("noop", 0.0);

        let result = compare_performance(&baseline, &current, 500.0);
        assert_eq!(result.status, StepStatus::Warning);
        let changes: Vec<_> = result
            .details
            .unwrap()
            .queries
            .iter()
            .map(|q| (q.query.clone(), q.change))
            .collect();
        assert_eq!(
            changes,
            vec![
                ("cold_cache".to_string(), PerformanceChange::Regression),
                ("noop".to_string(), PerformanceChange::Stable),
            ]
        );
    }

    #[tokio::test]
    async fn test_result_survives_json_round_trip() {
        let mut conn = ScriptedConnection::new();
        let ctx = VerificationContext::new(before(), after())
            .expected_checksum(after().checksum().unwrap())
            .performance(
                PerformanceSample::new().query("list_users", 10.0),
                PerformanceSample::new().query("list_users", 30.0),
            );
        let result = verifier(VerifierConfig::new())
            .verify_migration(&ctx, &mut conn)
            .await
            .unwrap();
        assert_eq!(result.performance_baseline.status, StepStatus::Warning);

        let json = serde_json::to_string(&result).unwrap();
        let decoded: VerificationResult = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, result);

        let skipped: StepResult<ChecksumDetails> =
            serde_json::from_str(r#"{"status":"skipped"}"#).unwrap();
        assert_eq!(skipped, StepResult::skipped());
    }

    #[tokio::test]
    async fn test_disabled_steps_are_skipped() {
        let config = VerifierConfig::new()
            .checksum_validation(false)
            .schema_comparison(false)
            .rollback_validation(false)
            .performance_baseline(false);
        let ctx = VerificationContext::new(before(), after());
        let result = verifier(config).verify_offline(&ctx).await.unwrap();
        assert!(result.statuses().iter().all(|s| *s == StepStatus::Skipped));
        assert_eq!(result.overall, OverallStatus::Passed);
        assert_eq!(result.verified_at, Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_config_validation() {
        assert!(VerifierConfig::new().validate().is_ok());
        assert!(VerifierConfig::new().regression_threshold_pct(-1.0).validate().is_err());
        assert!(VerifierConfig::new().regression_threshold_pct(f64::NAN).validate().is_err());
        assert!(VerifierConfig::new().probe_timeout(Duration::ZERO).validate().is_err());
    }
}
