//! Dependency ordering and lock-compatible batching.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{GuardError, GuardResult};
use crate::lock::{LockLevel, calculate_operation_lock};
use crate::operation::{Operation, OperationKind};
use crate::risk::{RiskAssessment, RiskAssessor, RiskConfig, RiskContext};

/// How lock compatibility is scoped when batching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockScope {
    /// Compare bare lock levels regardless of table.
    #[default]
    Global,
    /// Compare `(table, level)` pairs; disjoint tables never conflict.
    PerRelation,
}

/// Planner settings, read from `[planner]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Lock compatibility scope.
    pub lock_scope: LockScope,
}

impl PlannerConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the lock scope.
    pub fn lock_scope(mut self, scope: LockScope) -> Self {
        self.lock_scope = scope;
        self
    }
}

/// Operations that run together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Position in the plan, from zero.
    pub index: usize,
    /// Operations in execution order.
    pub operations: Vec<Operation>,
    /// Strongest lock taken by any member.
    pub lock_level: LockLevel,
    /// Whether the batch runs inside a transaction.
    pub transactional: bool,
}

impl Batch {
    fn new(index: usize, operation: Operation) -> Self {
        let lock_level = calculate_operation_lock(&operation);
        let transactional = operation.is_transactional();
        Self {
            index,
            operations: vec![operation],
            lock_level,
            transactional,
        }
    }

    fn push(&mut self, operation: Operation) {
        self.lock_level = self.lock_level.max(calculate_operation_lock(&operation));
        self.operations.push(operation);
    }

    /// Number of operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Batches are never empty once planned.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Lock level of each member, in order.
    pub fn lock_levels(&self) -> Vec<LockLevel> {
        self.operations.iter().map(calculate_operation_lock).collect()
    }

    /// Whether every pair of members can hold their locks together.
    pub fn is_lock_compatible(&self, scope: LockScope) -> bool {
        self.operations.iter().enumerate().all(|(i, a)| {
            self.operations[i + 1..]
                .iter()
                .all(|b| !operations_conflict(a, b, scope))
        })
    }

    /// Rendered statements, in order.
    pub fn statements(&self) -> Vec<String> {
        self.operations.iter().map(Operation::to_sql).collect()
    }
}

/// Planner output: ordered batches plus the risk of running them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationPlan {
    /// Batches in execution order.
    pub batches: Vec<Batch>,
    /// Risk of the whole migration.
    pub risk: RiskAssessment,
}

impl MigrationPlan {
    /// Check if there's anything to run.
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Total operations across batches.
    pub fn operation_count(&self) -> usize {
        self.batches.iter().map(Batch::len).sum()
    }

    /// Get a summary of the plan.
    pub fn summary(&self) -> String {
        if self.is_empty() {
            return "No operations to run".to_string();
        }
        format!(
            "{} operations in {} batches; risk {:.1} ({})",
            self.operation_count(),
            self.batches.len(),
            self.risk.score,
            self.risk.band
        )
    }
}

/// Orders, batches and scores operations.
#[derive(Debug, Clone, Default)]
pub struct Planner {
    config: PlannerConfig,
    assessor: RiskAssessor,
}

impl Planner {
    /// Create a planner.
    pub fn new(config: PlannerConfig, risk: RiskConfig) -> Self {
        Self {
            config,
            assessor: RiskAssessor::new(risk),
        }
    }

    /// Build a plan for the given operations.
    pub fn plan(&self, operations: &[Operation], ctx: &RiskContext) -> GuardResult<MigrationPlan> {
        let batches = batch_operations_with_scope(operations, self.config.lock_scope)?;
        let risk = self.assessor.assess(operations, ctx);

        info!(
            operations = operations.len(),
            batches = batches.len(),
            risk = risk.score,
            "Planned migration"
        );

        Ok(MigrationPlan { batches, risk })
    }
}

/// Execution-phase rank of an operation on a shared table.
fn phase_rank(kind: OperationKind) -> u8 {
    match kind {
        OperationKind::CreateTable => 0,
        OperationKind::AlterTableAddColumn => 1,
        OperationKind::ValidateConstraint => 3,
        OperationKind::DropTable => 4,
        _ => 2,
    }
}

/// Whether an operation removes or renames something a neighbour may name.
///
/// Such operations never trade places with another operation on the same
/// table.
fn keeps_input_order(kind: OperationKind) -> bool {
    matches!(
        kind,
        OperationKind::DropTable
            | OperationKind::AlterTableDropColumn
            | OperationKind::DropIndex
            | OperationKind::DropConstraint
            | OperationKind::RenameTable
            | OperationKind::RenameColumn
            | OperationKind::RawSql
    )
}

fn shares_table(a: &Operation, b: &Operation) -> bool {
    let theirs = b.tables();
    a.tables().iter().any(|t| theirs.contains(t))
}

/// Predecessors of each operation.
fn dependencies(operations: &[Operation]) -> Vec<BTreeSet<usize>> {
    let mut preds = vec![BTreeSet::new(); operations.len()];

    for (i, a) in operations.iter().enumerate() {
        for (j, b) in operations.iter().enumerate().skip(i + 1) {
            if !shares_table(a, b) {
                continue;
            }
            let hoist = phase_rank(a.kind()) > phase_rank(b.kind())
                && !keeps_input_order(a.kind())
                && !keeps_input_order(b.kind());
            if hoist {
                preds[i].insert(j);
            } else {
                preds[j].insert(i);
            }
        }
    }

    for (i, op) in operations.iter().enumerate() {
        for referenced in op.referenced_tables() {
            for (j, other) in operations.iter().enumerate() {
                if i == j || !other.tables().contains(&referenced.as_str()) {
                    continue;
                }
                match other.kind() {
                    OperationKind::CreateTable => {
                        preds[i].insert(j);
                    }
                    OperationKind::DropTable if j > i => {
                        preds[j].insert(i);
                    }
                    _ => {}
                }
            }
        }
    }

    preds
}

/// Stable topological order as input indices.
fn topological_order(
    operations: &[Operation],
    preds: &[BTreeSet<usize>],
) -> GuardResult<Vec<usize>> {
    let mut remaining: Vec<usize> = preds.iter().map(BTreeSet::len).collect();
    let mut ready: BTreeSet<usize> = (0..operations.len()).filter(|i| remaining[*i] == 0).collect();
    let mut order = Vec::with_capacity(operations.len());

    while let Some(next) = ready.pop_first() {
        order.push(next);
        for (succ, succ_preds) in preds.iter().enumerate() {
            if succ_preds.contains(&next) {
                remaining[succ] -= 1;
                if remaining[succ] == 0 {
                    ready.insert(succ);
                }
            }
        }
    }

    if order.len() < operations.len() {
        let stuck = (0..operations.len())
            .filter(|i| !order.contains(i))
            .map(|i| operations[i].describe())
            .collect();
        return Err(GuardError::CyclicDependency { operations: stuck });
    }
    Ok(order)
}

/// Order operations so that every dependency runs first.
///
/// Independent operations keep their input order.
pub fn order_operations(operations: &[Operation]) -> GuardResult<Vec<Operation>> {
    let preds = dependencies(operations);
    let order = topological_order(operations, &preds)?;
    Ok(order.into_iter().map(|i| operations[i].clone()).collect())
}

fn operations_conflict(a: &Operation, b: &Operation, scope: LockScope) -> bool {
    let locks_conflict = calculate_operation_lock(a).conflicts_with(calculate_operation_lock(b));
    match scope {
        LockScope::Global => locks_conflict,
        LockScope::PerRelation => {
            // An operation with no known tables may touch anything.
            let overlap = a.tables().is_empty() || b.tables().is_empty() || shares_table(a, b);
            locks_conflict && overlap
        }
    }
}

/// Batch operations with global lock scope.
pub fn batch_operations(operations: &[Operation]) -> GuardResult<Vec<Batch>> {
    batch_operations_with_scope(operations, LockScope::Global)
}

/// First-fit batching in dependency order.
///
/// Each operation goes into the first batch, at or after the latest batch
/// holding one of its dependencies, whose members it does not conflict with.
/// Operations that cannot run in a transaction always get their own batch.
pub fn batch_operations_with_scope(
    operations: &[Operation],
    scope: LockScope,
) -> GuardResult<Vec<Batch>> {
    let preds = dependencies(operations);
    let order = topological_order(operations, &preds)?;

    let mut batches: Vec<Batch> = Vec::new();
    let mut placed_in = vec![0usize; operations.len()];

    for idx in order {
        let op = &operations[idx];
        let start = preds[idx].iter().map(|p| placed_in[*p]).max().unwrap_or(0);

        let slot = if op.is_transactional() {
            (start..batches.len()).find(|b| {
                let batch = &batches[*b];
                batch.transactional
                    && batch
                        .operations
                        .iter()
                        .all(|member| !operations_conflict(member, op, scope))
            })
        } else {
            None
        };

        let target = match slot {
            Some(b) => {
                batches[b].push(op.clone());
                b
            }
            None => {
                let index = batches.len();
                batches.push(Batch::new(index, op.clone()));
                index
            }
        };

        debug!(operation = %op, batch = target, "Placed operation");
        placed_in[idx] = target;
    }

    Ok(batches)
}
