//! Migration risk scoring.
//!
//! Each operation contributes its kind's weight, scaled by the size class and
//! incident history of the tables it touches. The sum is scaled by lock
//! contention and concurrent traffic, then clamped to `0..=100`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{GuardError, GuardResult};
use crate::lock::{LockLevel, calculate_operation_lock};
use crate::operation::{ConstraintSpec, Operation, OperationKind};

/// Built-in weight per operation kind. `RAW_SQL` is deliberately absent.
pub const RISK_WEIGHTS: &[(OperationKind, f64)] = &[
    (OperationKind::DropTable, 30.0),
    (OperationKind::AlterTableDropColumn, 25.0),
    (OperationKind::AlterTableAlterColumn, 20.0),
    (OperationKind::RenameTable, 20.0),
    (OperationKind::RenameColumn, 15.0),
    (OperationKind::CreateTable, 5.0),
    (OperationKind::AlterTableAddColumn, 10.0),
    (OperationKind::CreateIndex, 15.0),
    (OperationKind::CreateIndexConcurrently, 5.0),
    (OperationKind::DropIndex, 10.0),
    (OperationKind::AddConstraint, 15.0),
    (OperationKind::DropConstraint, 10.0),
    (OperationKind::ValidateConstraint, 5.0),
];

/// Weight for kinds missing from the table.
pub const DEFAULT_RISK_WEIGHT: f64 = 25.0;

/// Score floor applied when any operation takes `ACCESS EXCLUSIVE`.
pub const ACCESS_EXCLUSIVE_FLOOR: f64 = 50.0;

const MAX_INCIDENT_MULTIPLIER: f64 = 2.0;
const CONCURRENT_MULTIPLIER: f64 = 1.25;

/// Rough table size, smallest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableSizeClass {
    /// Fits comfortably in memory.
    #[default]
    Small,
    /// Millions of rows.
    Medium,
    /// Tens of millions of rows.
    Large,
    /// Anything bigger.
    Huge,
}

impl TableSizeClass {
    /// Score multiplier.
    pub fn multiplier(&self) -> f64 {
        match self {
            Self::Small => 1.0,
            Self::Medium => 1.5,
            Self::Large => 2.0,
            Self::Huge => 3.0,
        }
    }
}

/// Historical lock contention on the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentionLevel {
    /// Rarely blocked.
    #[default]
    Low,
    /// Occasionally blocked.
    Moderate,
    /// Frequently blocked.
    High,
}

impl ContentionLevel {
    /// Score multiplier.
    pub fn multiplier(&self) -> f64 {
        match self {
            Self::Low => 1.0,
            Self::Moderate => 1.25,
            Self::High => 1.5,
        }
    }
}

/// Risk band derived from the score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskBand {
    /// Below 25.
    Low,
    /// 25 to 50.
    Medium,
    /// 50 to 75.
    High,
    /// 75 and above.
    Critical,
}

impl RiskBand {
    /// Band for a clamped score.
    pub fn from_score(score: f64) -> Self {
        if score >= 75.0 {
            Self::Critical
        } else if score >= 50.0 {
            Self::High
        } else if score >= 25.0 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

impl fmt::Display for RiskBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// What is known about the target database when scoring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskContext {
    /// Whether the migration runs alongside live traffic.
    #[serde(default)]
    pub concurrent: bool,
    /// Size class per table. Unknown tables count as small.
    #[serde(default)]
    pub table_sizes: BTreeMap<String, TableSizeClass>,
    /// Recent incidents per table.
    #[serde(default)]
    pub incidents: BTreeMap<String, u32>,
    /// Historical lock contention.
    #[serde(default)]
    pub contention: ContentionLevel,
}

impl RiskContext {
    /// Context for a migration running alongside live traffic.
    pub fn concurrent() -> Self {
        Self {
            concurrent: true,
            ..Default::default()
        }
    }

    /// Record a table's size class.
    pub fn table_size(mut self, table: impl Into<String>, size: TableSizeClass) -> Self {
        self.table_sizes.insert(table.into(), size);
        self
    }

    /// Record recent incidents on a table.
    pub fn incidents(mut self, table: impl Into<String>, count: u32) -> Self {
        self.incidents.insert(table.into(), count);
        self
    }

    /// Set the contention level.
    pub fn contention(mut self, level: ContentionLevel) -> Self {
        self.contention = level;
        self
    }

    fn size_multiplier(&self, tables: &[&str]) -> f64 {
        tables
            .iter()
            .filter_map(|t| self.table_sizes.get(*t))
            .map(TableSizeClass::multiplier)
            .fold(1.0, f64::max)
    }

    fn incident_multiplier(&self, tables: &[&str]) -> f64 {
        let worst = tables
            .iter()
            .filter_map(|t| self.incidents.get(*t))
            .copied()
            .max()
            .unwrap_or(0);
        (1.0 + 0.25 * f64::from(worst)).min(MAX_INCIDENT_MULTIPLIER)
    }
}

/// Per-kind weight overrides, read from `[risk]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Overrides keyed by operation kind wire name (`DROP_TABLE` …).
    pub weights: BTreeMap<String, f64>,
    /// Weight for kinds in neither the overrides nor the built-in table.
    pub default_weight: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            weights: BTreeMap::new(),
            default_weight: DEFAULT_RISK_WEIGHT,
        }
    }
}

impl RiskConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override one kind's weight.
    pub fn weight(mut self, kind: OperationKind, weight: f64) -> Self {
        self.weights.insert(kind.as_str().to_string(), weight);
        self
    }

    /// Set the fallback weight.
    pub fn default_weight(mut self, weight: f64) -> Self {
        self.default_weight = weight;
        self
    }

    /// Reject unknown kinds and negative or non-finite weights.
    pub fn validate(&self) -> GuardResult<()> {
        if !self.default_weight.is_finite() || self.default_weight < 0.0 {
            return Err(GuardError::config("risk.default_weight must be a non-negative number"));
        }
        for (key, weight) in &self.weights {
            if !OperationKind::ALL.iter().any(|k| k.as_str() == key) {
                return Err(GuardError::config(format!(
                    "risk.weights has unknown operation kind '{}'",
                    key
                )));
            }
            if !weight.is_finite() || *weight < 0.0 {
                return Err(GuardError::config(format!(
                    "risk.weights.{} must be a non-negative number",
                    key
                )));
            }
        }
        Ok(())
    }
}

/// One operation's contribution to the score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRisk {
    /// Description of the operation.
    pub operation: String,
    /// Its kind.
    pub kind: OperationKind,
    /// Lock it takes.
    pub lock_level: LockLevel,
    /// Unscaled weight.
    pub weight: f64,
    /// Weight after size and incident scaling.
    pub score: f64,
}

/// Result of scoring a migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    /// Score in `0..=100`.
    pub score: f64,
    /// Band of the score.
    pub band: RiskBand,
    /// Whether any operation takes `ACCESS EXCLUSIVE`.
    pub has_access_exclusive: bool,
    /// Contribution of each operation.
    pub per_operation: Vec<OperationRisk>,
    /// Suggestions for lowering the risk.
    pub recommendations: Vec<String>,
}

impl RiskAssessment {
    /// Assessment of an empty migration.
    pub fn empty() -> Self {
        Self {
            score: 0.0,
            band: RiskBand::Low,
            has_access_exclusive: false,
            per_operation: Vec::new(),
            recommendations: Vec::new(),
        }
    }
}

/// Scores operation lists.
#[derive(Debug, Clone, Default)]
pub struct RiskAssessor {
    config: RiskConfig,
}

impl RiskAssessor {
    /// Create an assessor from configuration.
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    /// Effective weight for a kind: override, then built-in table, then fallback.
    pub fn weight_for(&self, kind: OperationKind) -> f64 {
        if let Some(weight) = self.config.weights.get(kind.as_str()) {
            return *weight;
        }
        RISK_WEIGHTS
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, w)| *w)
            .unwrap_or(self.config.default_weight)
    }

    /// Score a list of operations.
    pub fn assess(&self, operations: &[Operation], ctx: &RiskContext) -> RiskAssessment {
        if operations.is_empty() {
            return RiskAssessment::empty();
        }

        let mut per_operation = Vec::with_capacity(operations.len());
        let mut recommendations = Vec::new();
        let mut has_access_exclusive = false;

        for op in operations {
            let tables = op.tables();
            let weight = self.weight_for(op.kind());
            let score = weight * ctx.size_multiplier(&tables) * ctx.incident_multiplier(&tables);
            let lock_level = calculate_operation_lock(op);
            has_access_exclusive |= lock_level == LockLevel::AccessExclusive;

            if let Some(advice) = recommendation_for(op, ctx) {
                if !recommendations.contains(&advice) {
                    recommendations.push(advice);
                }
            }

            per_operation.push(OperationRisk {
                operation: op.describe(),
                kind: op.kind(),
                lock_level,
                weight,
                score,
            });
        }

        let mut score: f64 = per_operation.iter().map(|r| r.score).sum();
        score *= ctx.contention.multiplier();
        if ctx.concurrent {
            score *= CONCURRENT_MULTIPLIER;
        }
        score = score.clamp(0.0, 100.0);
        if has_access_exclusive {
            score = score.max(ACCESS_EXCLUSIVE_FLOOR);
        }

        let band = RiskBand::from_score(score);
        if has_access_exclusive && ctx.concurrent {
            recommendations.push(
                "Set lock_timeout so ACCESS EXCLUSIVE waits fail fast instead of queueing traffic"
                    .to_string(),
            );
        }

        debug!(score, band = %band, operations = operations.len(), "Assessed migration risk");

        RiskAssessment {
            score,
            band,
            has_access_exclusive,
            per_operation,
            recommendations,
        }
    }
}

/// Score operations with the built-in weights.
pub fn assess_migration_risk(operations: &[Operation], ctx: &RiskContext) -> RiskAssessment {
    RiskAssessor::default().assess(operations, ctx)
}

fn recommendation_for(op: &Operation, ctx: &RiskContext) -> Option<String> {
    match op {
        Operation::CreateIndex { name, .. } => Some(format!(
            "Build index '{}' with CREATE INDEX CONCURRENTLY to avoid blocking writes",
            name
        )),
        Operation::AddConstraint {
            name,
            constraint: ConstraintSpec::ForeignKey { .. } | ConstraintSpec::Check { .. },
            not_valid: false,
            ..
        } => Some(format!(
            "Add constraint '{}' as NOT VALID and run VALIDATE CONSTRAINT separately",
            name
        )),
        Operation::AlterTableAlterColumn { table, change, .. } if change.new_type.is_some() => {
            Some(format!("Type change on '{}' rewrites the table", table))
        }
        Operation::DropTable { table, .. } | Operation::AlterTableDropColumn { table, .. } => {
            Some(format!("Take a backup of '{}' before dropping data", table))
        }
        Operation::AlterTableAddColumn { table, .. }
            if ctx.table_sizes.get(table).copied().unwrap_or_default()
                >= TableSizeClass::Large =>
        {
            Some(format!(
                "'{}' is large; schedule the column addition off-peak",
                table
            ))
        }
        _ => None,
    }
}
