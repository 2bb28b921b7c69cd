//! Integration tests for the planning guarantees.
//!
//! These tests check properties that must hold across modules: drift
//! detection is symmetric, the lock matrix is symmetric, and batching is
//! deterministic and never groups conflicting or dependent operations.

use chrono::Utc;
use pgshield::{
    ColumnDef, DifferenceKind, Directive, LockLevel, LockScope, Operation, OverallStatus,
    Planner, PlannerConfig, RiskConfig, RiskContext, SchemaSnapshot, StepStatus, TableDef,
    are_locks_compatible, batch_operations, batch_operations_with_scope, derive_overall,
    detect_drift,
};
use pretty_assertions::assert_eq;

fn users() -> TableDef {
    TableDef::new("users")
        .column(ColumnDef::new("id", "integer").directive(Directive::primary_key()))
        .column(ColumnDef::new("email", "text").directive(Directive::unique()))
}

fn orders() -> TableDef {
    TableDef::new("orders")
        .column(ColumnDef::new("id", "integer").directive(Directive::primary_key()))
        .column(
            ColumnDef::new("user_id", "integer").directive(Directive::foreign_key("users.id")),
        )
}

fn mirrored(kind: DifferenceKind) -> DifferenceKind {
    match kind {
        DifferenceKind::MissingTable => DifferenceKind::ExtraTable,
        DifferenceKind::ExtraTable => DifferenceKind::MissingTable,
        DifferenceKind::MissingField => DifferenceKind::ExtraField,
        DifferenceKind::ExtraField => DifferenceKind::MissingField,
        DifferenceKind::MissingDirective => DifferenceKind::ExtraDirective,
        DifferenceKind::ExtraDirective => DifferenceKind::MissingDirective,
        other => other,
    }
}

/// Swapping expected and actual swaps every missing/extra pair.
#[test]
fn test_drift_is_symmetric() {
    let expected = SchemaSnapshot::new(Utc::now())
        .with_table(users().column(ColumnDef::new("bio", "text").nullable(true)))
        .with_table(orders());
    let actual = SchemaSnapshot::new(Utc::now())
        .with_table(users())
        .with_table(TableDef::new("audit_log").column(ColumnDef::new("id", "integer")));

    let forward = detect_drift(&expected, &actual).unwrap();
    let backward = detect_drift(&actual, &expected).unwrap();

    let mut forward_keys: Vec<_> = forward
        .differences
        .iter()
        .map(|d| (mirrored(d.kind), d.table.clone(), d.column.clone()))
        .collect();
    let mut backward_keys: Vec<_> = backward
        .differences
        .iter()
        .map(|d| (d.kind, d.table.clone(), d.column.clone()))
        .collect();
    forward_keys.sort_by_key(|k| format!("{:?}", k));
    backward_keys.sort_by_key(|k| format!("{:?}", k));

    assert_eq!(forward_keys, backward_keys);
    assert!(forward
        .differences
        .iter()
        .any(|d| d.kind == DifferenceKind::MissingTable && d.table == "orders"));
}

#[test]
fn test_identical_snapshots_have_no_drift() {
    let snapshot = SchemaSnapshot::new(Utc::now()).with_table(users()).with_table(orders());
    let report = detect_drift(&snapshot, &snapshot.clone()).unwrap();
    assert!(!report.has_drift());
    assert_eq!(report.risk_score, 0);
}

/// All 64 ordered pairs of lock levels agree with their mirror.
#[test]
fn test_lock_compatibility_is_symmetric() {
    let mut pairs = 0;
    for a in LockLevel::ALL {
        for b in LockLevel::ALL {
            assert_eq!(
                are_locks_compatible(&[a, b]),
                are_locks_compatible(&[b, a]),
                "{:?} vs {:?}",
                a,
                b
            );
            pairs += 1;
        }
    }
    assert_eq!(pairs, 64);
    assert!(!are_locks_compatible(&[LockLevel::AccessShare, LockLevel::AccessExclusive]));
    assert!(are_locks_compatible(&[LockLevel::RowExclusive, LockLevel::RowExclusive]));
}

fn mixed_operations() -> Vec<Operation> {
    vec![
        Operation::create_index("users", "idx_users_email", vec!["email".into()], true),
        Operation::add_column("orders", ColumnDef::new("total", "numeric").nullable(true)),
        Operation::create_table("orders", vec![ColumnDef::new("id", "integer")]),
        Operation::drop_column("users", "legacy"),
        Operation::create_index("orders", "idx_orders_total", vec!["total".into()], false),
    ]
}

#[test]
fn test_batching_is_deterministic() {
    let first = batch_operations(&mixed_operations()).unwrap();
    for _ in 0..10 {
        assert_eq!(batch_operations(&mixed_operations()).unwrap(), first);
    }
}

#[test]
fn test_batches_are_lock_compatible_in_both_scopes() {
    for scope in [LockScope::Global, LockScope::PerRelation] {
        let batches = batch_operations_with_scope(&mixed_operations(), scope).unwrap();
        let total: usize = batches.iter().map(|b| b.len()).sum();
        assert_eq!(total, mixed_operations().len());

        for batch in &batches {
            assert!(batch.is_lock_compatible(scope), "batch {} in {:?}", batch.index, scope);
            if !batch.transactional {
                assert_eq!(batch.len(), 1);
            }
        }
    }
}

#[test]
fn test_create_table_precedes_add_column() {
    let batches = batch_operations(&mixed_operations()).unwrap();
    let position = |pred: &dyn Fn(&Operation) -> bool| {
        batches
            .iter()
            .position(|b| b.operations.iter().any(|op| pred(op)))
            .unwrap()
    };

    let create = position(&|op| matches!(op, Operation::CreateTable { table, .. } if table == "orders"));
    let add = position(&|op| {
        matches!(op, Operation::AlterTableAddColumn { table, .. } if table == "orders")
    });
    let index = position(&|op| matches!(op, Operation::CreateIndex { table, .. } if table == "orders"));

    assert!(create < add);
    assert!(add < index);
}

#[test]
fn test_plan_carries_risk() {
    let plan = Planner::new(PlannerConfig::new(), RiskConfig::default())
        .plan(&mixed_operations(), &RiskContext::default())
        .unwrap();
    assert_eq!(plan.operation_count(), 5);
    assert!(plan.risk.has_access_exclusive);
    assert!(plan.risk.score > 0.0 && plan.risk.score <= 100.0);
}

#[test]
fn test_overall_status_combinations() {
    use StepStatus::*;
    let cases = [
        (vec![Passed, Passed, Passed, Passed, Passed], OverallStatus::Passed),
        (vec![Passed, NoChanges, Skipped, Skipped, Passed], OverallStatus::Passed),
        (vec![Passed, ChangesDetected, Passed, Skipped, Skipped], OverallStatus::Partial),
        (vec![Passed, NoChanges, Passed, Skipped, Warning], OverallStatus::Partial),
        (vec![Failed, ChangesDetected, Passed, Skipped, Warning], OverallStatus::Failed),
        (vec![Failed, Error, Passed, Passed, Passed], OverallStatus::Error),
    ];
    for (statuses, expected) in cases {
        assert_eq!(derive_overall(&statuses), expected, "{:?}", statuses);
    }
}
