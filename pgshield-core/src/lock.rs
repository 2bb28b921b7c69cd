//! PostgreSQL table-lock levels and the locks taken by each operation kind.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::operation::{Operation, OperationKind};

/// Table-level lock modes, weakest first.
///
/// The derived ordering is the strength order used to pick a batch's lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockLevel {
    /// `ACCESS SHARE`, taken by plain `SELECT`.
    AccessShare,
    /// `ROW SHARE`, taken by `SELECT FOR UPDATE`.
    RowShare,
    /// `ROW EXCLUSIVE`, taken by DML.
    RowExclusive,
    /// `SHARE UPDATE EXCLUSIVE`, taken by `CREATE INDEX CONCURRENTLY`.
    ShareUpdateExclusive,
    /// `SHARE`, taken by `CREATE INDEX`.
    Share,
    /// `SHARE ROW EXCLUSIVE`.
    ShareRowExclusive,
    /// `EXCLUSIVE`.
    Exclusive,
    /// `ACCESS EXCLUSIVE`, taken by most `ALTER TABLE` forms.
    AccessExclusive,
}

impl LockLevel {
    /// Every level, weakest first.
    pub const ALL: [LockLevel; 8] = [
        Self::AccessShare,
        Self::RowShare,
        Self::RowExclusive,
        Self::ShareUpdateExclusive,
        Self::Share,
        Self::ShareRowExclusive,
        Self::Exclusive,
        Self::AccessExclusive,
    ];

    /// The mode as written in `LOCK TABLE … IN <mode> MODE`.
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::AccessShare => "ACCESS SHARE",
            Self::RowShare => "ROW SHARE",
            Self::RowExclusive => "ROW EXCLUSIVE",
            Self::ShareUpdateExclusive => "SHARE UPDATE EXCLUSIVE",
            Self::Share => "SHARE",
            Self::ShareRowExclusive => "SHARE ROW EXCLUSIVE",
            Self::Exclusive => "EXCLUSIVE",
            Self::AccessExclusive => "ACCESS EXCLUSIVE",
        }
    }

    /// Whether a lock of this mode conflicts with one of `other`'s mode.
    ///
    /// This is PostgreSQL's conflict table and is symmetric.
    pub fn conflicts_with(&self, other: LockLevel) -> bool {
        use LockLevel::*;
        match self {
            AccessShare => matches!(other, AccessExclusive),
            RowShare => matches!(other, Exclusive | AccessExclusive),
            RowExclusive => matches!(
                other,
                Share | ShareRowExclusive | Exclusive | AccessExclusive
            ),
            ShareUpdateExclusive => matches!(
                other,
                ShareUpdateExclusive | Share | ShareRowExclusive | Exclusive | AccessExclusive
            ),
            Share => matches!(
                other,
                RowExclusive | ShareUpdateExclusive | ShareRowExclusive | Exclusive | AccessExclusive
            ),
            ShareRowExclusive => !matches!(other, AccessShare | RowShare),
            Exclusive => !matches!(other, AccessShare),
            AccessExclusive => true,
        }
    }

    /// Whether the two modes can be held at the same time.
    pub fn is_compatible_with(&self, other: LockLevel) -> bool {
        !self.conflicts_with(other)
    }
}

impl fmt::Display for LockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Lock acquired by each operation kind.
pub const OPERATION_LOCKS: &[(OperationKind, LockLevel)] = &[
    (OperationKind::CreateTable, LockLevel::AccessExclusive),
    (OperationKind::DropTable, LockLevel::AccessExclusive),
    (OperationKind::AlterTableAddColumn, LockLevel::AccessExclusive),
    (OperationKind::AlterTableDropColumn, LockLevel::AccessExclusive),
    (OperationKind::AlterTableAlterColumn, LockLevel::AccessExclusive),
    (OperationKind::CreateIndex, LockLevel::Share),
    (OperationKind::CreateIndexConcurrently, LockLevel::ShareUpdateExclusive),
    (OperationKind::DropIndex, LockLevel::AccessExclusive),
    (OperationKind::AddConstraint, LockLevel::AccessExclusive),
    (OperationKind::ValidateConstraint, LockLevel::ShareUpdateExclusive),
    (OperationKind::DropConstraint, LockLevel::AccessExclusive),
    (OperationKind::RenameTable, LockLevel::AccessExclusive),
    (OperationKind::RenameColumn, LockLevel::AccessExclusive),
    (OperationKind::RawSql, LockLevel::AccessExclusive),
];

/// Lock level for an operation kind. Unlisted kinds get `ACCESS EXCLUSIVE`.
pub fn lock_for_kind(kind: OperationKind) -> LockLevel {
    OPERATION_LOCKS
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, level)| *level)
        .unwrap_or(LockLevel::AccessExclusive)
}

/// Lock level an operation will acquire.
pub fn calculate_operation_lock(operation: &Operation) -> LockLevel {
    lock_for_kind(operation.kind())
}

/// Whether every pair of the given locks can be held simultaneously.
///
/// Empty and single-element lists are trivially compatible.
pub fn are_locks_compatible(locks: &[LockLevel]) -> bool {
    locks.iter().enumerate().all(|(i, a)| {
        locks[i + 1..]
            .iter()
            .all(|b| a.is_compatible_with(*b))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::ColumnDef;

    #[test]
    fn test_conflict_matrix_is_symmetric() {
        for a in LockLevel::ALL {
            for b in LockLevel::ALL {
                assert_eq!(
                    a.conflicts_with(b),
                    b.conflicts_with(a),
                    "{a} vs {b} is asymmetric"
                );
            }
        }
    }

    #[test]
    fn test_access_exclusive_conflicts_with_everything() {
        for level in LockLevel::ALL {
            assert!(LockLevel::AccessExclusive.conflicts_with(level));
        }
    }

    #[test]
    fn test_known_pairs() {
        assert!(LockLevel::AccessShare.is_compatible_with(LockLevel::Exclusive));
        assert!(LockLevel::RowExclusive.is_compatible_with(LockLevel::RowExclusive));
        assert!(LockLevel::Share.is_compatible_with(LockLevel::Share));
        assert!(!LockLevel::Share.is_compatible_with(LockLevel::RowExclusive));
        assert!(!LockLevel::ShareUpdateExclusive.is_compatible_with(LockLevel::ShareUpdateExclusive));
    }

    #[test]
    fn test_ordering_is_strength() {
        assert!(LockLevel::AccessShare < LockLevel::RowShare);
        assert!(LockLevel::Share < LockLevel::AccessExclusive);
        assert_eq!(LockLevel::ALL.iter().max(), Some(&LockLevel::AccessExclusive));
    }

    #[test]
    fn test_every_kind_has_a_lock() {
        for kind in OperationKind::ALL {
            assert!(
                OPERATION_LOCKS.iter().any(|(k, _)| *k == kind),
                "{kind} missing from lock table"
            );
        }
    }

    #[test]
    fn test_operation_locks() {
        let add = Operation::add_column("users", ColumnDef::new("age", "Int").nullable(true));
        assert_eq!(calculate_operation_lock(&add), LockLevel::AccessExclusive);

        let idx = Operation::create_index("users", "idx", vec!["email".into()], false);
        assert_eq!(calculate_operation_lock(&idx), LockLevel::Share);

        let concurrent = Operation::create_index("users", "idx", vec!["email".into()], true);
        assert_eq!(
            calculate_operation_lock(&concurrent),
            LockLevel::ShareUpdateExclusive
        );
    }

    #[test]
    fn test_are_locks_compatible() {
        assert!(are_locks_compatible(&[]));
        assert!(are_locks_compatible(&[LockLevel::AccessExclusive]));
        assert!(are_locks_compatible(&[LockLevel::Share, LockLevel::Share]));
        assert!(!are_locks_compatible(&[
            LockLevel::AccessShare,
            LockLevel::Share,
            LockLevel::AccessExclusive
        ]));
    }
}
