//! Requested DDL changes.
//!
//! An [`Operation`] is one DDL statement with everything needed to render it.
//! Its [`OperationKind`] is the key into the lock and risk tables.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::snapshot::{ColumnDef, DirectiveKind};
use crate::sql::{column_definition, ident_list, quote_ident, sql_type};

/// Discriminant of an [`Operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    /// `CREATE TABLE`.
    CreateTable,
    /// `DROP TABLE`.
    DropTable,
    /// `ALTER TABLE … ADD COLUMN`.
    AlterTableAddColumn,
    /// `ALTER TABLE … DROP COLUMN`.
    AlterTableDropColumn,
    /// `ALTER TABLE … ALTER COLUMN`.
    AlterTableAlterColumn,
    /// `CREATE INDEX`.
    CreateIndex,
    /// `CREATE INDEX CONCURRENTLY`.
    CreateIndexConcurrently,
    /// `DROP INDEX`.
    DropIndex,
    /// `ALTER TABLE … ADD CONSTRAINT`.
    AddConstraint,
    /// `ALTER TABLE … VALIDATE CONSTRAINT`.
    ValidateConstraint,
    /// `ALTER TABLE … DROP CONSTRAINT`.
    DropConstraint,
    /// `ALTER TABLE … RENAME TO`.
    RenameTable,
    /// `ALTER TABLE … RENAME COLUMN`.
    RenameColumn,
    /// A statement the union does not model.
    RawSql,
}

impl OperationKind {
    /// Every kind, in declaration order.
    pub const ALL: [OperationKind; 14] = [
        Self::CreateTable,
        Self::DropTable,
        Self::AlterTableAddColumn,
        Self::AlterTableDropColumn,
        Self::AlterTableAlterColumn,
        Self::CreateIndex,
        Self::CreateIndexConcurrently,
        Self::DropIndex,
        Self::AddConstraint,
        Self::ValidateConstraint,
        Self::DropConstraint,
        Self::RenameTable,
        Self::RenameColumn,
        Self::RawSql,
    ];

    /// Wire name, e.g. `ALTER_TABLE_ADD_COLUMN`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateTable => "CREATE_TABLE",
            Self::DropTable => "DROP_TABLE",
            Self::AlterTableAddColumn => "ALTER_TABLE_ADD_COLUMN",
            Self::AlterTableDropColumn => "ALTER_TABLE_DROP_COLUMN",
            Self::AlterTableAlterColumn => "ALTER_TABLE_ALTER_COLUMN",
            Self::CreateIndex => "CREATE_INDEX",
            Self::CreateIndexConcurrently => "CREATE_INDEX_CONCURRENTLY",
            Self::DropIndex => "DROP_INDEX",
            Self::AddConstraint => "ADD_CONSTRAINT",
            Self::ValidateConstraint => "VALIDATE_CONSTRAINT",
            Self::DropConstraint => "DROP_CONSTRAINT",
            Self::RenameTable => "RENAME_TABLE",
            Self::RenameColumn => "RENAME_COLUMN",
            Self::RawSql => "RAW_SQL",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Change to a column's default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultChange {
    /// `SET DEFAULT <expr>`.
    Set(String),
    /// `DROP DEFAULT`.
    Drop,
}

/// Changes applied by `ALTER_TABLE_ALTER_COLUMN`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnChange {
    /// New type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_type: Option<String>,
    /// `USING` expression for the type change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub using: Option<String>,
    /// New nullability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nullable: Option<bool>,
    /// New default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<DefaultChange>,
}

/// Constraint added by `ADD_CONSTRAINT`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConstraintSpec {
    /// Primary key.
    PrimaryKey {
        /// Key columns.
        columns: Vec<String>,
    },
    /// Foreign key.
    ForeignKey {
        /// Referencing columns.
        columns: Vec<String>,
        /// Referenced table.
        references_table: String,
        /// Referenced columns.
        references_columns: Vec<String>,
        /// `ON DELETE` action.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_delete: Option<String>,
    },
    /// Unique constraint.
    Unique {
        /// Unique columns.
        columns: Vec<String>,
    },
    /// Check constraint.
    Check {
        /// Boolean expression.
        expression: String,
    },
}

impl ConstraintSpec {
    /// Only foreign keys and checks accept `NOT VALID`.
    pub fn supports_not_valid(&self) -> bool {
        matches!(self, Self::ForeignKey { .. } | Self::Check { .. })
    }

    fn to_sql(&self) -> String {
        match self {
            Self::PrimaryKey { columns } => format!("PRIMARY KEY ({})", ident_list(columns)),
            Self::ForeignKey {
                columns,
                references_table,
                references_columns,
                on_delete,
            } => {
                let mut sql = format!(
                    "FOREIGN KEY ({}) REFERENCES {} ({})",
                    ident_list(columns),
                    quote_ident(references_table),
                    ident_list(references_columns)
                );
                if let Some(action) = on_delete {
                    sql.push_str(&format!(" ON DELETE {}", action));
                }
                sql
            }
            Self::Unique { columns } => format!("UNIQUE ({})", ident_list(columns)),
            Self::Check { expression } => format!("CHECK ({})", expression),
        }
    }
}

/// A single requested DDL change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    /// Create a table.
    CreateTable {
        /// Table name.
        table: String,
        /// Columns.
        columns: Vec<ColumnDef>,
        /// Primary key columns.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        primary_key: Vec<String>,
    },
    /// Drop a table.
    DropTable {
        /// Table name.
        table: String,
        /// Whether to cascade.
        #[serde(default)]
        cascade: bool,
    },
    /// Add a column.
    AlterTableAddColumn {
        /// Table name.
        table: String,
        /// Column to add.
        column: ColumnDef,
    },
    /// Drop a column.
    AlterTableDropColumn {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },
    /// Alter a column.
    AlterTableAlterColumn {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
        /// What changes.
        change: ColumnChange,
    },
    /// Create an index inside a transaction.
    CreateIndex {
        /// Table name.
        table: String,
        /// Index name.
        name: String,
        /// Indexed columns.
        columns: Vec<String>,
        /// Whether the index is unique.
        #[serde(default)]
        unique: bool,
    },
    /// Create an index without blocking writes. Cannot run in a transaction.
    CreateIndexConcurrently {
        /// Table name.
        table: String,
        /// Index name.
        name: String,
        /// Indexed columns.
        columns: Vec<String>,
        /// Whether the index is unique.
        #[serde(default)]
        unique: bool,
    },
    /// Drop an index.
    DropIndex {
        /// Table the index belongs to.
        table: String,
        /// Index name.
        name: String,
    },
    /// Add a constraint.
    AddConstraint {
        /// Table name.
        table: String,
        /// Constraint name.
        name: String,
        /// Constraint definition.
        constraint: ConstraintSpec,
        /// Skip the initial validation scan.
        #[serde(default)]
        not_valid: bool,
    },
    /// Validate a constraint added `NOT VALID`.
    ValidateConstraint {
        /// Table name.
        table: String,
        /// Constraint name.
        name: String,
    },
    /// Drop a constraint.
    DropConstraint {
        /// Table name.
        table: String,
        /// Constraint name.
        name: String,
    },
    /// Rename a table.
    RenameTable {
        /// Current name.
        table: String,
        /// New name.
        new_name: String,
    },
    /// Rename a column.
    RenameColumn {
        /// Table name.
        table: String,
        /// Current column name.
        column: String,
        /// New column name.
        new_name: String,
    },
    /// An opaque statement.
    RawSql {
        /// Tables the statement touches.
        #[serde(default)]
        tables: Vec<String>,
        /// The statement.
        sql: String,
    },
}

impl Operation {
    /// Create a table from column definitions.
    pub fn create_table(table: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        Self::CreateTable {
            table: table.into(),
            columns,
            primary_key: Vec::new(),
        }
    }

    /// Drop a table.
    pub fn drop_table(table: impl Into<String>) -> Self {
        Self::DropTable {
            table: table.into(),
            cascade: false,
        }
    }

    /// Add a column.
    pub fn add_column(table: impl Into<String>, column: ColumnDef) -> Self {
        Self::AlterTableAddColumn {
            table: table.into(),
            column,
        }
    }

    /// Drop a column.
    pub fn drop_column(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self::AlterTableDropColumn {
            table: table.into(),
            column: column.into(),
        }
    }

    /// Create an index, concurrently or not.
    pub fn create_index(
        table: impl Into<String>,
        name: impl Into<String>,
        columns: Vec<String>,
        concurrently: bool,
    ) -> Self {
        let (table, name) = (table.into(), name.into());
        if concurrently {
            Self::CreateIndexConcurrently {
                table,
                name,
                columns,
                unique: false,
            }
        } else {
            Self::CreateIndex {
                table,
                name,
                columns,
                unique: false,
            }
        }
    }

    /// The operation's kind.
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::CreateTable { .. } => OperationKind::CreateTable,
            Self::DropTable { .. } => OperationKind::DropTable,
            Self::AlterTableAddColumn { .. } => OperationKind::AlterTableAddColumn,
            Self::AlterTableDropColumn { .. } => OperationKind::AlterTableDropColumn,
            Self::AlterTableAlterColumn { .. } => OperationKind::AlterTableAlterColumn,
            Self::CreateIndex { .. } => OperationKind::CreateIndex,
            Self::CreateIndexConcurrently { .. } => OperationKind::CreateIndexConcurrently,
            Self::DropIndex { .. } => OperationKind::DropIndex,
            Self::AddConstraint { .. } => OperationKind::AddConstraint,
            Self::ValidateConstraint { .. } => OperationKind::ValidateConstraint,
            Self::DropConstraint { .. } => OperationKind::DropConstraint,
            Self::RenameTable { .. } => OperationKind::RenameTable,
            Self::RenameColumn { .. } => OperationKind::RenameColumn,
            Self::RawSql { .. } => OperationKind::RawSql,
        }
    }

    /// Tables this operation locks.
    pub fn tables(&self) -> Vec<&str> {
        match self {
            Self::CreateTable { table, .. }
            | Self::DropTable { table, .. }
            | Self::AlterTableAddColumn { table, .. }
            | Self::AlterTableDropColumn { table, .. }
            | Self::AlterTableAlterColumn { table, .. }
            | Self::CreateIndex { table, .. }
            | Self::CreateIndexConcurrently { table, .. }
            | Self::DropIndex { table, .. }
            | Self::AddConstraint { table, .. }
            | Self::ValidateConstraint { table, .. }
            | Self::DropConstraint { table, .. }
            | Self::RenameColumn { table, .. } => vec![table.as_str()],
            Self::RenameTable { table, new_name } => vec![table.as_str(), new_name.as_str()],
            Self::RawSql { tables, .. } => tables.iter().map(String::as_str).collect(),
        }
    }

    /// Tables referenced through foreign keys.
    pub fn referenced_tables(&self) -> Vec<String> {
        match self {
            Self::AddConstraint {
                constraint: ConstraintSpec::ForeignKey {
                    references_table, ..
                },
                ..
            } => vec![references_table.clone()],
            Self::CreateTable { columns, .. } => columns
                .iter()
                .flat_map(|c| &c.directives)
                .filter(|d| d.kind == DirectiveKind::ForeignKey)
                .filter_map(|d| d.foreign_key_target().map(|(table, _)| table))
                .collect(),
            Self::AlterTableAddColumn { column, .. } => column
                .directives
                .iter()
                .filter(|d| d.kind == DirectiveKind::ForeignKey)
                .filter_map(|d| d.foreign_key_target().map(|(table, _)| table))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Whether the statement may run inside a transaction block.
    pub fn is_transactional(&self) -> bool {
        !matches!(self, Self::CreateIndexConcurrently { .. })
    }

    /// Short human-readable description, e.g. `CREATE_INDEX idx_users_email`.
    pub fn describe(&self) -> String {
        let target = match self {
            Self::AlterTableAddColumn { table, column } => format!("{}.{}", table, column.name),
            Self::AlterTableDropColumn { table, column }
            | Self::AlterTableAlterColumn { table, column, .. }
            | Self::RenameColumn { table, column, .. } => format!("{}.{}", table, column),
            Self::CreateIndex { name, .. }
            | Self::CreateIndexConcurrently { name, .. }
            | Self::DropIndex { name, .. }
            | Self::AddConstraint { name, .. }
            | Self::ValidateConstraint { name, .. }
            | Self::DropConstraint { name, .. } => name.clone(),
            other => other.tables().join(","),
        };
        format!("{} {}", self.kind(), target)
    }

    /// Render the statement.
    pub fn to_sql(&self) -> String {
        match self {
            Self::CreateTable {
                table,
                columns,
                primary_key,
            } => {
                let mut defs: Vec<String> = columns.iter().map(column_definition).collect();
                if !primary_key.is_empty() {
                    defs.push(format!("PRIMARY KEY ({})", ident_list(primary_key)));
                }
                format!(
                    "CREATE TABLE {} (\n    {}\n)",
                    quote_ident(table),
                    defs.join(",\n    ")
                )
            }
            Self::DropTable { table, cascade } => format!(
                "DROP TABLE {}{}",
                quote_ident(table),
                if *cascade { " CASCADE" } else { "" }
            ),
            Self::AlterTableAddColumn { table, column } => format!(
                "ALTER TABLE {} ADD COLUMN {}",
                quote_ident(table),
                column_definition(column)
            ),
            Self::AlterTableDropColumn { table, column } => format!(
                "ALTER TABLE {} DROP COLUMN {}",
                quote_ident(table),
                quote_ident(column)
            ),
            Self::AlterTableAlterColumn {
                table,
                column,
                change,
            } => {
                let col = quote_ident(column);
                let mut clauses = Vec::new();
                if let Some(new_type) = &change.new_type {
                    let target = sql_type(new_type);
                    let using = change
                        .using
                        .clone()
                        .unwrap_or_else(|| format!("{}::{}", col, target));
                    clauses.push(format!(
                        "ALTER COLUMN {} TYPE {} USING {}",
                        col, target, using
                    ));
                }
                match change.nullable {
                    Some(true) => clauses.push(format!("ALTER COLUMN {} DROP NOT NULL", col)),
                    Some(false) => clauses.push(format!("ALTER COLUMN {} SET NOT NULL", col)),
                    None => {}
                }
                match &change.default {
                    Some(DefaultChange::Set(expr)) => {
                        clauses.push(format!("ALTER COLUMN {} SET DEFAULT {}", col, expr))
                    }
                    Some(DefaultChange::Drop) => {
                        clauses.push(format!("ALTER COLUMN {} DROP DEFAULT", col))
                    }
                    None => {}
                }
                format!("ALTER TABLE {} {}", quote_ident(table), clauses.join(", "))
            }
            Self::CreateIndex {
                table,
                name,
                columns,
                unique,
            } => format!(
                "CREATE {}INDEX {} ON {} ({})",
                if *unique { "UNIQUE " } else { "" },
                quote_ident(name),
                quote_ident(table),
                ident_list(columns)
            ),
            Self::CreateIndexConcurrently {
                table,
                name,
                columns,
                unique,
            } => format!(
                "CREATE {}INDEX CONCURRENTLY {} ON {} ({})",
                if *unique { "UNIQUE " } else { "" },
                quote_ident(name),
                quote_ident(table),
                ident_list(columns)
            ),
            Self::DropIndex { name, .. } => format!("DROP INDEX {}", quote_ident(name)),
            Self::AddConstraint {
                table,
                name,
                constraint,
                not_valid,
            } => {
                let mut sql = format!(
                    "ALTER TABLE {} ADD CONSTRAINT {} {}",
                    quote_ident(table),
                    quote_ident(name),
                    constraint.to_sql()
                );
                if *not_valid && constraint.supports_not_valid() {
                    sql.push_str(" NOT VALID");
                }
                sql
            }
            Self::ValidateConstraint { table, name } => format!(
                "ALTER TABLE {} VALIDATE CONSTRAINT {}",
                quote_ident(table),
                quote_ident(name)
            ),
            Self::DropConstraint { table, name } => format!(
                "ALTER TABLE {} DROP CONSTRAINT {}",
                quote_ident(table),
                quote_ident(name)
            ),
            Self::RenameTable { table, new_name } => format!(
                "ALTER TABLE {} RENAME TO {}",
                quote_ident(table),
                quote_ident(new_name)
            ),
            Self::RenameColumn {
                table,
                column,
                new_name,
            } => format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {}",
                quote_ident(table),
                quote_ident(column),
                quote_ident(new_name)
            ),
            Self::RawSql { sql, .. } => sql.clone(),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Directive;

    #[test]
    fn test_kind_wire_names_match_serde() {
        for kind in OperationKind::ALL {
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, kind.as_str());
        }
    }

    #[test]
    fn test_operation_serde_tag() {
        let op = Operation::add_column("users", ColumnDef::new("age", "Int").nullable(true));
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["kind"], "ALTER_TABLE_ADD_COLUMN");
        let back: Operation = serde_json::from_value(json).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn test_create_table_sql() {
        let op = Operation::CreateTable {
            table: "users".to_string(),
            columns: vec![
                ColumnDef::new("id", "Int"),
                ColumnDef::new("email", "String"),
            ],
            primary_key: vec!["id".to_string()],
        };
        let sql = op.to_sql();
        assert!(sql.starts_with("CREATE TABLE \"users\" ("));
        assert!(sql.contains("\"email\" TEXT NOT NULL"));
        assert!(sql.contains("PRIMARY KEY (\"id\")"));
    }

    #[test]
    fn test_alter_column_sql() {
        let op = Operation::AlterTableAlterColumn {
            table: "users".to_string(),
            column: "age".to_string(),
            change: ColumnChange {
                new_type: Some("BigInt".to_string()),
                nullable: Some(false),
                ..Default::default()
            },
        };
        assert_eq!(
            op.to_sql(),
            "ALTER TABLE \"users\" ALTER COLUMN \"age\" TYPE BIGINT USING \"age\"::BIGINT, \
             ALTER COLUMN \"age\" SET NOT NULL"
        );
    }

    #[test]
    fn test_not_valid_only_where_supported() {
        let fk = Operation::AddConstraint {
            table: "posts".to_string(),
            name: "posts_author_fk".to_string(),
            constraint: ConstraintSpec::ForeignKey {
                columns: vec!["author_id".to_string()],
                references_table: "users".to_string(),
                references_columns: vec!["id".to_string()],
                on_delete: Some("CASCADE".to_string()),
            },
            not_valid: true,
        };
        assert!(fk.to_sql().ends_with("ON DELETE CASCADE NOT VALID"));
        assert_eq!(fk.referenced_tables(), vec!["users".to_string()]);

        let unique = Operation::AddConstraint {
            table: "users".to_string(),
            name: "users_email_key".to_string(),
            constraint: ConstraintSpec::Unique {
                columns: vec!["email".to_string()],
            },
            not_valid: true,
        };
        assert!(!unique.to_sql().contains("NOT VALID"));
    }

    #[test]
    fn test_concurrent_index_not_transactional() {
        let op = Operation::create_index("users", "idx_users_email", vec!["email".into()], true);
        assert!(!op.is_transactional());
        assert_eq!(
            op.to_sql(),
            "CREATE INDEX CONCURRENTLY \"idx_users_email\" ON \"users\" (\"email\")"
        );
        assert!(Operation::drop_table("users").is_transactional());
    }

    #[test]
    fn test_create_table_referenced_tables() {
        let op = Operation::create_table(
            "posts",
            vec![ColumnDef::new("author_id", "Int").directive(Directive::foreign_key("users.id"))],
        );
        assert_eq!(op.referenced_tables(), vec!["users".to_string()]);
    }

    #[test]
    fn test_describe() {
        assert_eq!(
            Operation::drop_column("users", "legacy").describe(),
            "ALTER_TABLE_DROP_COLUMN users.legacy"
        );
        assert_eq!(
            Operation::RenameTable {
                table: "a".into(),
                new_name: "b".into()
            }
            .describe(),
            "RENAME_TABLE a,b"
        );
    }
}
