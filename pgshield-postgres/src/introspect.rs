//! Live schema snapshots read from the PostgreSQL catalogs.
//!
//! Constraint and index names that match the names PostgreSQL would choose on
//! its own are dropped, so an introspected snapshot lines up with a declared
//! schema that leaves them implicit.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgshield_core::{
    Clock, ColumnDef, Directive, GuardResult, SchemaSnapshot, SchemaSource, SqlValue,
    SystemClock, TableDef,
};
use tokio_postgres::Row;
use tracing::{debug, info};

use crate::error::{PgError, PgResult};
use crate::pool::PgPool;
use crate::types::catalog_type;

/// SQL queries for catalog introspection. Each takes the schema name as `$1`.
pub mod queries {
    /// Ordinary and partitioned tables.
    pub const TABLES: &str = r#"
        SELECT
            c.relname::text AS table_name,
            c.relrowsecurity AS row_security
        FROM pg_class c
        JOIN pg_namespace n ON n.oid = c.relnamespace
        WHERE n.nspname = $1::text AND c.relkind IN ('r', 'p')
        ORDER BY c.relname
    "#;

    /// Columns of every table in the schema.
    pub const COLUMNS: &str = r#"
        SELECT
            table_name::text AS table_name,
            column_name::text AS column_name,
            data_type::text AS data_type,
            udt_name::text AS udt_name,
            character_maximum_length::int4 AS max_length,
            is_nullable = 'YES' AS is_nullable,
            column_default::text AS column_default
        FROM information_schema.columns
        WHERE table_schema = $1::text
        ORDER BY table_name, ordinal_position
    "#;

    /// Primary key, unique, foreign key and check constraints.
    pub const CONSTRAINTS: &str = r#"
        SELECT
            con.conname::text AS constraint_name,
            con.contype::text AS constraint_type,
            t.relname::text AS table_name,
            ARRAY(
                SELECT a.attname::text
                FROM unnest(con.conkey) WITH ORDINALITY AS k(attnum, ord)
                JOIN pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.attnum
                ORDER BY k.ord
            ) AS columns,
            ft.relname::text AS referenced_table,
            ARRAY(
                SELECT a.attname::text
                FROM unnest(con.confkey) WITH ORDINALITY AS k(attnum, ord)
                JOIN pg_attribute a ON a.attrelid = con.confrelid AND a.attnum = k.attnum
                ORDER BY k.ord
            ) AS referenced_columns,
            pg_get_constraintdef(con.oid) AS definition
        FROM pg_constraint con
        JOIN pg_class t ON t.oid = con.conrelid
        JOIN pg_namespace n ON n.oid = t.relnamespace
        LEFT JOIN pg_class ft ON ft.oid = con.confrelid
        WHERE n.nspname = $1::text AND con.contype IN ('p', 'u', 'f', 'c')
        ORDER BY t.relname, con.conname
    "#;

    /// Indexes not backing a constraint.
    pub const INDEXES: &str = r#"
        SELECT
            i.relname::text AS index_name,
            t.relname::text AS table_name,
            ARRAY(
                SELECT a.attname::text
                FROM unnest(ix.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord)
                JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum
                ORDER BY k.ord
            ) AS columns,
            ix.indisunique AS is_unique
        FROM pg_index ix
        JOIN pg_class i ON i.oid = ix.indexrelid
        JOIN pg_class t ON t.oid = ix.indrelid
        JOIN pg_namespace n ON n.oid = t.relnamespace
        WHERE n.nspname = $1::text
          AND NOT ix.indisprimary
          AND NOT EXISTS (SELECT 1 FROM pg_constraint c WHERE c.conindid = ix.indexrelid)
        ORDER BY t.relname, i.relname
    "#;
}

#[derive(Debug, Clone, PartialEq)]
struct TableRow {
    name: String,
    row_security: bool,
}

#[derive(Debug, Clone, PartialEq)]
struct ColumnRow {
    table: String,
    name: String,
    data_type: String,
    udt_name: String,
    max_length: Option<i32>,
    nullable: bool,
    default: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
struct ConstraintRow {
    name: String,
    kind: String,
    table: String,
    columns: Vec<String>,
    referenced_table: Option<String>,
    referenced_columns: Vec<String>,
    definition: String,
}

#[derive(Debug, Clone, PartialEq)]
struct IndexRow {
    name: String,
    table: String,
    columns: Vec<String>,
    unique: bool,
}

impl TableRow {
    fn from_row(row: &Row) -> PgResult<Self> {
        Ok(Self {
            name: row.try_get("table_name")?,
            row_security: row.try_get("row_security")?,
        })
    }
}

impl ColumnRow {
    fn from_row(row: &Row) -> PgResult<Self> {
        Ok(Self {
            table: row.try_get("table_name")?,
            name: row.try_get("column_name")?,
            data_type: row.try_get("data_type")?,
            udt_name: row.try_get("udt_name")?,
            max_length: row.try_get("max_length")?,
            nullable: row.try_get("is_nullable")?,
            default: row.try_get("column_default")?,
        })
    }
}

impl ConstraintRow {
    fn from_row(row: &Row) -> PgResult<Self> {
        Ok(Self {
            name: row.try_get("constraint_name")?,
            kind: row.try_get("constraint_type")?,
            table: row.try_get("table_name")?,
            columns: row.try_get("columns")?,
            referenced_table: row.try_get("referenced_table")?,
            referenced_columns: row.try_get("referenced_columns")?,
            definition: row.try_get("definition")?,
        })
    }
}

impl IndexRow {
    fn from_row(row: &Row) -> PgResult<Self> {
        Ok(Self {
            name: row.try_get("index_name")?,
            table: row.try_get("table_name")?,
            columns: row.try_get("columns")?,
            unique: row.try_get("is_unique")?,
        })
    }
}

/// A [`SchemaSource`] that introspects one schema of a live database.
#[derive(Clone)]
pub struct PgSchemaSource {
    pool: PgPool,
    schema: String,
    environment: Option<String>,
    clock: Arc<dyn Clock>,
}

impl PgSchemaSource {
    /// Introspect the schema named in the pool's configuration.
    pub fn new(pool: PgPool) -> Self {
        let schema = pool.config().schema.clone();
        Self {
            pool,
            schema,
            environment: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Introspect a different schema.
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    /// Label snapshots with an environment name.
    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    /// Use a custom clock for `captured_at`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    async fn read(&self) -> PgResult<SchemaSnapshot> {
        let conn = self.pool.get().await?;
        let params = [SqlValue::Text(self.schema.clone())];

        let tables = conn
            .query(queries::TABLES, &params)
            .await?
            .iter()
            .map(TableRow::from_row)
            .collect::<PgResult<Vec<_>>>()?;
        let columns = conn
            .query(queries::COLUMNS, &params)
            .await?
            .iter()
            .map(ColumnRow::from_row)
            .collect::<PgResult<Vec<_>>>()?;
        let constraints = conn
            .query(queries::CONSTRAINTS, &params)
            .await?
            .iter()
            .map(ConstraintRow::from_row)
            .collect::<PgResult<Vec<_>>>()?;
        let indexes = conn
            .query(queries::INDEXES, &params)
            .await?
            .iter()
            .map(IndexRow::from_row)
            .collect::<PgResult<Vec<_>>>()?;

        debug!(
            schema = %self.schema,
            tables = tables.len(),
            columns = columns.len(),
            constraints = constraints.len(),
            indexes = indexes.len(),
            "Read catalog rows"
        );

        let mut snapshot = assemble(tables, columns, constraints, indexes, self.clock.now())?;
        if let Some(ref environment) = self.environment {
            snapshot = snapshot.with_environment(environment.clone());
        }
        Ok(snapshot)
    }
}

#[async_trait]
impl SchemaSource for PgSchemaSource {
    async fn snapshot(&self) -> GuardResult<SchemaSnapshot> {
        let snapshot = self.read().await?;
        snapshot.validate()?;
        info!(
            schema = %self.schema,
            tables = snapshot.tables.len(),
            "Introspected live schema"
        );
        Ok(snapshot)
    }
}

fn assemble(
    tables: Vec<TableRow>,
    columns: Vec<ColumnRow>,
    constraints: Vec<ConstraintRow>,
    indexes: Vec<IndexRow>,
    captured_at: DateTime<Utc>,
) -> PgResult<SchemaSnapshot> {
    let mut defs: BTreeMap<String, TableDef> = tables
        .into_iter()
        .map(|t| {
            let mut def = TableDef::new(t.name.clone());
            if t.row_security {
                def = def.directive(Directive::row_level_security());
            }
            (t.name, def)
        })
        .collect();

    for row in columns {
        let Some(table) = defs.get_mut(&row.table) else {
            continue;
        };
        let (column_type, list) = catalog_type(&row.data_type, &row.udt_name, row.max_length);
        let mut column = ColumnDef::new(row.name.clone(), column_type).nullable(row.nullable);
        if list {
            column = column.list(true);
        }
        if let Some(default) = row.default {
            column = column.directive(Directive::default_value(default));
        }
        table.columns.insert(row.name, column);
    }

    for row in constraints {
        let Some(table) = defs.get_mut(&row.table) else {
            continue;
        };
        let directive = constraint_directive(&row)?;
        attach(table, &row.columns, directive, row.kind == "c")?;
    }

    for row in indexes {
        let Some(table) = defs.get_mut(&row.table) else {
            continue;
        };
        if row.columns.is_empty() {
            debug!(index = %row.name, "Skipping expression index");
            continue;
        }
        let mut directive = Directive::index();
        if row.name != format!("idx_{}_{}", row.table, row.columns.join("_")) {
            directive = directive.named(row.name.clone());
        }
        if row.unique {
            directive = directive.arg("unique", "true");
        }
        attach(table, &row.columns, directive, false)?;
    }

    let mut snapshot = SchemaSnapshot::new(captured_at);
    snapshot.tables = defs;
    Ok(snapshot)
}

/// Single-column constraints sit on the column. Multi-column ones sit on the
/// table with a `columns` argument, except checks, which carry their columns
/// in the expression.
fn attach(
    table: &mut TableDef,
    columns: &[String],
    directive: Directive,
    is_check: bool,
) -> PgResult<()> {
    match columns {
        [column] => {
            let owner = table.columns.get_mut(column).ok_or_else(|| {
                PgError::introspection(format!(
                    "constraint on unknown column '{}.{}'",
                    table.name, column
                ))
            })?;
            owner.directives.push(directive);
        }
        _ if is_check => table.directives.push(directive),
        _ => table
            .directives
            .push(directive.arg("columns", columns.join(","))),
    }
    Ok(())
}

fn constraint_directive(row: &ConstraintRow) -> PgResult<Directive> {
    let cols = row.columns.join("_");
    let (directive, default_name) = match row.kind.as_str() {
        "p" => (Directive::primary_key(), format!("{}_pkey", row.table)),
        "u" => (Directive::unique(), format!("{}_{}_key", row.table, cols)),
        "f" => {
            let referenced_table = row.referenced_table.as_deref().ok_or_else(|| {
                PgError::introspection(format!("foreign key '{}' has no target", row.name))
            })?;
            let referenced_column = row.referenced_columns.first().ok_or_else(|| {
                PgError::introspection(format!("foreign key '{}' has no target", row.name))
            })?;
            let mut directive = Directive::foreign_key(format!(
                "{}.{}",
                referenced_table, referenced_column
            ));
            if let Some(action) = on_delete_action(&row.definition) {
                directive = directive.arg("on_delete", action);
            }
            (directive, format!("{}_{}_fkey", row.table, cols))
        }
        "c" => {
            let default_name = if row.columns.len() == 1 {
                format!("{}_{}_check", row.table, cols)
            } else {
                format!("{}_check", row.table)
            };
            (
                Directive::check(check_expression(&row.definition)),
                default_name,
            )
        }
        other => {
            return Err(PgError::introspection(format!(
                "unsupported constraint type '{}' on '{}'",
                other, row.name
            )));
        }
    };

    if row.name == default_name {
        Ok(directive)
    } else {
        Ok(directive.named(row.name.clone()))
    }
}

/// Expression of a `CHECK (...)` definition without redundant parentheses.
fn check_expression(definition: &str) -> String {
    let body = definition.trim();
    let body = body.strip_prefix("CHECK").unwrap_or(body).trim();
    let body = body.strip_suffix("NOT VALID").unwrap_or(body).trim();
    strip_outer_parens(body).to_string()
}

fn strip_outer_parens(mut s: &str) -> &str {
    while s.starts_with('(') && s.ends_with(')') && encloses(s) {
        s = s[1..s.len() - 1].trim();
    }
    s
}

/// Whether the opening paren at index 0 closes at the last character.
fn encloses(s: &str) -> bool {
    let mut depth = 0usize;
    for (i, ch) in s.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return i == s.len() - 1;
                }
            }
            _ => {}
        }
    }
    false
}

fn on_delete_action(definition: &str) -> Option<&'static str> {
    let upper = definition.to_ascii_uppercase();
    let (_, rest) = upper.split_once("ON DELETE ")?;
    [
        "CASCADE",
        "RESTRICT",
        "SET NULL",
        "SET DEFAULT",
        "NO ACTION",
    ]
    .into_iter()
    .find(|action| rest.starts_with(action))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgshield_core::DirectiveKind;
    use pretty_assertions::assert_eq;

    fn column(table: &str, name: &str, data_type: &str, nullable: bool) -> ColumnRow {
        ColumnRow {
            table: table.to_string(),
            name: name.to_string(),
            data_type: data_type.to_string(),
            udt_name: data_type.to_string(),
            max_length: None,
            nullable,
            default: None,
        }
    }

    fn constraint(name: &str, kind: &str, table: &str, columns: &[&str], definition: &str) -> ConstraintRow {
        ConstraintRow {
            name: name.to_string(),
            kind: kind.to_string(),
            table: table.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            referenced_table: None,
            referenced_columns: Vec::new(),
            definition: definition.to_string(),
        }
    }

    fn table(name: &str) -> TableRow {
        TableRow {
            name: name.to_string(),
            row_security: false,
        }
    }

    #[test]
    fn test_check_expression() {
        assert_eq!(check_expression("CHECK ((age > 0))"), "age > 0");
        assert_eq!(
            check_expression("CHECK (((a > 0) AND (b > 0))) NOT VALID"),
            "(a > 0) AND (b > 0)"
        );
        assert_eq!(check_expression("CHECK ((a > 0) OR (b > 0))"), "(a > 0) OR (b > 0)");
    }

    #[test]
    fn test_on_delete_action() {
        assert_eq!(
            on_delete_action("FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE"),
            Some("CASCADE")
        );
        assert_eq!(on_delete_action("FOREIGN KEY (user_id) REFERENCES users(id)"), None);
    }

    #[test]
    fn test_default_names_are_dropped() {
        let fk = ConstraintRow {
            referenced_table: Some("users".to_string()),
            referenced_columns: vec!["id".to_string()],
            ..constraint(
                "posts_user_id_fkey",
                "f",
                "posts",
                &["user_id"],
                "FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE SET NULL",
            )
        };
        let directive = constraint_directive(&fk).unwrap();
        assert_eq!(directive.name, None);
        assert_eq!(directive.arg_value("references"), Some("users.id"));
        assert_eq!(directive.arg_value("on_delete"), Some("SET NULL"));

        let unique = constraint("users_email_uniq", "u", "users", &["email"], "UNIQUE (email)");
        assert_eq!(
            constraint_directive(&unique).unwrap().name.as_deref(),
            Some("users_email_uniq")
        );
    }

    #[test]
    fn test_assemble_snapshot() {
        let mut email = column("users", "email", "character varying", false);
        email.max_length = Some(255);
        let mut status = column("users", "status", "text", false);
        status.default = Some("'active'::text".to_string());

        let snapshot = assemble(
            vec![table("users"), table("memberships")],
            vec![
                column("users", "id", "integer", false),
                email,
                status,
                column("memberships", "user_id", "integer", false),
                column("memberships", "org_id", "integer", false),
            ],
            vec![
                constraint("users_pkey", "p", "users", &["id"], "PRIMARY KEY (id)"),
                constraint("users_email_key", "u", "users", &["email"], "UNIQUE (email)"),
                constraint(
                    "memberships_pkey",
                    "p",
                    "memberships",
                    &["user_id", "org_id"],
                    "PRIMARY KEY (user_id, org_id)",
                ),
            ],
            vec![IndexRow {
                name: "idx_users_status".to_string(),
                table: "users".to_string(),
                columns: vec!["status".to_string()],
                unique: false,
            }],
            Utc::now(),
        )
        .unwrap();

        let users = snapshot.table("users").unwrap();
        assert_eq!(users.columns["email"].column_type, "varchar(255)");
        assert_eq!(users.columns["status"].default_value(), Some("'active'::text"));
        assert_eq!(users.primary_key(), vec!["id".to_string()]);
        assert!(users.columns["email"]
            .directives
            .iter()
            .any(|d| d.kind == DirectiveKind::Unique && d.name.is_none()));
        assert!(users.columns["status"]
            .directives
            .iter()
            .any(|d| d.kind == DirectiveKind::Index && d.name.is_none()));

        let memberships = snapshot.table("memberships").unwrap();
        assert_eq!(
            memberships.primary_key(),
            vec!["user_id".to_string(), "org_id".to_string()]
        );
        assert!(snapshot.validate().is_ok());
    }

    #[test]
    fn test_constraint_on_unknown_column_fails() {
        let result = assemble(
            vec![table("users")],
            vec![column("users", "id", "integer", false)],
            vec![constraint("users_ghost_key", "u", "users", &["ghost"], "UNIQUE (ghost)")],
            Vec::new(),
            Utc::now(),
        );
        assert!(matches!(result, Err(PgError::Introspection(_))));
    }
}
