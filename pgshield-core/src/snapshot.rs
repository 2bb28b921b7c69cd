//! Schema snapshots: the shape shared by declared and introspected schemas.
//!
//! Tables and columns are kept in `BTreeMap`s so that serialisation has a
//! stable key order, which the checksum relies on.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{GuardError, GuardResult};

/// An immutable capture of a schema at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    /// Tables keyed by name.
    #[serde(default)]
    pub tables: BTreeMap<String, TableDef>,
    /// When the snapshot was captured.
    pub captured_at: DateTime<Utc>,
    /// Environment label, set when sourced from a live database.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

impl SchemaSnapshot {
    /// Create an empty snapshot.
    pub fn new(captured_at: DateTime<Utc>) -> Self {
        Self {
            tables: BTreeMap::new(),
            captured_at,
            environment: None,
        }
    }

    /// Tag the snapshot with an environment label.
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    /// Add a table.
    pub fn with_table(mut self, table: TableDef) -> Self {
        self.tables.insert(table.name.clone(), table);
        self
    }

    /// Look up a table.
    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.tables.get(name)
    }

    /// Check the snapshot is well formed.
    pub fn validate(&self) -> GuardResult<()> {
        for (key, table) in &self.tables {
            if table.name.trim().is_empty() {
                return Err(GuardError::validation("table name is empty"));
            }
            if key != &table.name {
                return Err(GuardError::validation(format!(
                    "table registered as '{}' declares name '{}'",
                    key, table.name
                )));
            }

            for (col_key, column) in &table.columns {
                if column.name.trim().is_empty() {
                    return Err(GuardError::validation(format!(
                        "table '{}' has a column with an empty name",
                        table.name
                    )));
                }
                if col_key != &column.name {
                    return Err(GuardError::validation(format!(
                        "column registered as '{}.{}' declares name '{}'",
                        table.name, col_key, column.name
                    )));
                }
                if column.column_type.trim().is_empty() {
                    return Err(GuardError::validation(format!(
                        "column '{}.{}' has no type",
                        table.name, column.name
                    )));
                }
                for directive in &column.directives {
                    directive.validate(&format!("{}.{}", table.name, column.name))?;
                }
            }

            for directive in &table.directives {
                directive.validate(&table.name)?;
            }
        }
        Ok(())
    }

    /// SHA-256 over the canonical JSON of the table map.
    ///
    /// The capture time and environment label are not part of the checksum.
    pub fn checksum(&self) -> GuardResult<String> {
        let canonical = serde_json::to_vec(&self.tables)?;
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        Ok(hex::encode(hasher.finalize()))
    }
}

/// A table definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    /// Table name.
    pub name: String,
    /// Columns keyed by name.
    #[serde(default)]
    pub columns: BTreeMap<String, ColumnDef>,
    /// Table-level directives (RLS, composite keys, checks, indexes).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub directives: Vec<Directive>,
}

impl TableDef {
    /// Create an empty table.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: BTreeMap::new(),
            directives: Vec::new(),
        }
    }

    /// Add a column.
    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.insert(column.name.clone(), column);
        self
    }

    /// Add a table-level directive.
    pub fn directive(mut self, directive: Directive) -> Self {
        self.directives.push(directive);
        self
    }

    /// Whether any directive of the given kind is declared on the table or a column.
    pub fn has_directive(&self, kind: &DirectiveKind) -> bool {
        self.directives.iter().any(|d| &d.kind == kind)
            || self
                .columns
                .values()
                .any(|c| c.directives.iter().any(|d| &d.kind == kind))
    }

    /// Primary key columns, from column or table-level directives.
    pub fn primary_key(&self) -> Vec<String> {
        if let Some(pk) = self
            .directives
            .iter()
            .find(|d| d.kind == DirectiveKind::PrimaryKey)
        {
            return pk.columns();
        }
        self.columns
            .values()
            .filter(|c| c.directives.iter().any(|d| d.kind == DirectiveKind::PrimaryKey))
            .map(|c| c.name.clone())
            .collect()
    }
}

/// A column definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Declared type (`String`, `Int`, `varchar(255)` …).
    #[serde(rename = "type")]
    pub column_type: String,
    /// Whether the column accepts NULL.
    #[serde(default)]
    pub nullable: bool,
    /// Whether the column is a list/array.
    #[serde(default)]
    pub list: bool,
    /// Whether list items accept NULL.
    #[serde(default)]
    pub list_item_nullable: bool,
    /// Column-level directives.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub directives: Vec<Directive>,
}

impl ColumnDef {
    /// Create a NOT NULL scalar column.
    pub fn new(name: impl Into<String>, column_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column_type: column_type.into(),
            nullable: false,
            list: false,
            list_item_nullable: false,
            directives: Vec::new(),
        }
    }

    /// Set nullability.
    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    /// Make the column a list.
    pub fn list(mut self, item_nullable: bool) -> Self {
        self.list = true;
        self.list_item_nullable = item_nullable;
        self
    }

    /// Add a directive.
    pub fn directive(mut self, directive: Directive) -> Self {
        self.directives.push(directive);
        self
    }

    /// The `default` directive's value, if any.
    pub fn default_value(&self) -> Option<&str> {
        self.directives
            .iter()
            .find(|d| d.kind == DirectiveKind::Default)
            .and_then(|d| d.arg_value("value"))
    }
}

/// Directive-like annotation kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectiveKind {
    /// Primary key.
    PrimaryKey,
    /// Foreign key; `references` argument is `table.column`.
    ForeignKey,
    /// Unique constraint.
    Unique,
    /// Index.
    Index,
    /// Check constraint; `expression` argument.
    Check,
    /// Column default; `value` argument.
    Default,
    /// Row-level security.
    RowLevelSecurity,
    /// Any other annotation.
    Custom(String),
}

impl DirectiveKind {
    /// Stable name of the kind.
    pub fn as_str(&self) -> &str {
        match self {
            Self::PrimaryKey => "primary_key",
            Self::ForeignKey => "foreign_key",
            Self::Unique => "unique",
            Self::Index => "index",
            Self::Check => "check",
            Self::Default => "default",
            Self::RowLevelSecurity => "row_level_security",
            Self::Custom(name) => name,
        }
    }
}

impl fmt::Display for DirectiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named annotation with arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directive {
    /// Kind.
    pub kind: DirectiveKind,
    /// Constraint or index name, when the schema names it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Arguments.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, String>,
}

impl Directive {
    /// Create a directive without arguments.
    pub fn new(kind: DirectiveKind) -> Self {
        Self {
            kind,
            name: None,
            args: BTreeMap::new(),
        }
    }

    /// Primary key.
    pub fn primary_key() -> Self {
        Self::new(DirectiveKind::PrimaryKey)
    }

    /// Foreign key referencing `table.column`.
    pub fn foreign_key(references: impl Into<String>) -> Self {
        Self::new(DirectiveKind::ForeignKey).arg("references", references)
    }

    /// Unique constraint.
    pub fn unique() -> Self {
        Self::new(DirectiveKind::Unique)
    }

    /// Index.
    pub fn index() -> Self {
        Self::new(DirectiveKind::Index)
    }

    /// Check constraint.
    pub fn check(expression: impl Into<String>) -> Self {
        Self::new(DirectiveKind::Check).arg("expression", expression)
    }

    /// Column default.
    pub fn default_value(value: impl Into<String>) -> Self {
        Self::new(DirectiveKind::Default).arg("value", value)
    }

    /// Row-level security.
    pub fn row_level_security() -> Self {
        Self::new(DirectiveKind::RowLevelSecurity)
    }

    /// Name the directive.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Add an argument.
    pub fn arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    /// Look up an argument.
    pub fn arg_value(&self, key: &str) -> Option<&str> {
        self.args.get(key).map(String::as_str)
    }

    /// Identity used to match directives across snapshots.
    ///
    /// A named directive is identified by its name. An unnamed one is
    /// identified by the arguments that say what it constrains, so two
    /// unnamed checks on one table stay distinct.
    pub fn key(&self) -> String {
        if let Some(name) = &self.name {
            return format!("{}:{}", self.kind, name);
        }
        let discriminator: Vec<&str> = ["columns", "references", "expression"]
            .into_iter()
            .filter_map(|arg| self.arg_value(arg))
            .collect();
        format!("{}:{}", self.kind, discriminator.join(";"))
    }

    /// Columns named by a table-level directive (`columns = "a,b"`).
    pub fn columns(&self) -> Vec<String> {
        self.arg_value("columns")
            .map(|cols| {
                cols.split(',')
                    .map(|c| c.trim().to_string())
                    .filter(|c| !c.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Referenced `(table, column)` of a foreign key.
    pub fn foreign_key_target(&self) -> Option<(String, String)> {
        let references = self.arg_value("references")?;
        match references.split_once('.') {
            Some((table, column)) => Some((table.to_string(), column.to_string())),
            None => Some((references.to_string(), "id".to_string())),
        }
    }

    fn validate(&self, owner: &str) -> GuardResult<()> {
        match self.kind {
            DirectiveKind::ForeignKey
                if self
                    .arg_value("references")
                    .is_none_or(|r| r.trim().is_empty()) =>
            {
                Err(GuardError::validation(format!(
                    "foreign key on '{}' has no 'references' argument",
                    owner
                )))
            }
            DirectiveKind::Check
                if self
                    .arg_value("expression")
                    .is_none_or(|e| e.trim().is_empty()) =>
            {
                Err(GuardError::validation(format!(
                    "check on '{}' has no 'expression' argument",
                    owner
                )))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> TableDef {
        TableDef::new("users")
            .column(ColumnDef::new("id", "Int").directive(Directive::primary_key()))
            .column(ColumnDef::new("email", "String").directive(Directive::unique()))
            .column(ColumnDef::new("bio", "String").nullable(true))
    }

    #[test]
    fn test_validate_accepts_well_formed() {
        let snapshot = SchemaSnapshot::new(Utc::now()).with_table(users());
        assert!(snapshot.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_mismatched_key() {
        let mut snapshot = SchemaSnapshot::new(Utc::now());
        snapshot.tables.insert("people".to_string(), users());
        let err = snapshot.validate().unwrap_err();
        assert!(matches!(err, GuardError::Validation(_)));
    }

    #[test]
    fn test_validate_rejects_empty_type() {
        let snapshot = SchemaSnapshot::new(Utc::now())
            .with_table(TableDef::new("t").column(ColumnDef::new("c", " ")));
        assert!(snapshot.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_foreign_key_without_target() {
        let snapshot = SchemaSnapshot::new(Utc::now()).with_table(
            TableDef::new("posts").column(
                ColumnDef::new("author_id", "Int")
                    .directive(Directive::new(DirectiveKind::ForeignKey)),
            ),
        );
        let err = snapshot.validate().unwrap_err();
        assert!(err.to_string().contains("references"));
    }

    #[test]
    fn test_checksum_ignores_capture_metadata() {
        let a = SchemaSnapshot::new(Utc::now()).with_table(users());
        let b = SchemaSnapshot::new(Utc::now() - chrono::Duration::days(3))
            .with_environment("production")
            .with_table(users());
        assert_eq!(a.checksum().unwrap(), b.checksum().unwrap());
        assert_eq!(a.checksum().unwrap().len(), 64);
    }

    #[test]
    fn test_checksum_changes_with_structure() {
        let a = SchemaSnapshot::new(Utc::now()).with_table(users());
        let b = SchemaSnapshot::new(Utc::now())
            .with_table(users().column(ColumnDef::new("age", "Int").nullable(true)));
        assert_ne!(a.checksum().unwrap(), b.checksum().unwrap());
    }

    #[test]
    fn test_primary_key_lookup() {
        assert_eq!(users().primary_key(), vec!["id".to_string()]);

        let composite = TableDef::new("memberships")
            .column(ColumnDef::new("user_id", "Int"))
            .column(ColumnDef::new("team_id", "Int"))
            .directive(Directive::primary_key().arg("columns", "user_id, team_id"));
        assert_eq!(composite.primary_key(), vec!["user_id", "team_id"]);
    }

    #[test]
    fn test_foreign_key_target() {
        assert_eq!(
            Directive::foreign_key("users.id").foreign_key_target(),
            Some(("users".to_string(), "id".to_string()))
        );
        assert_eq!(
            Directive::foreign_key("teams").foreign_key_target(),
            Some(("teams".to_string(), "id".to_string()))
        );
    }

    #[test]
    fn test_directive_key() {
        assert_eq!(Directive::unique().key(), "unique:");
        assert_eq!(Directive::index().named("idx_email").key(), "index:idx_email");
        assert_eq!(
            Directive::index().arg("columns", "a,b").key(),
            "index:a,b"
        );
        assert_eq!(Directive::check("qty > 0").key(), "check:qty > 0");
        assert_ne!(Directive::check("qty > 0").key(), Directive::check("price > 0").key());
        assert_eq!(Directive::check("qty > 0").named("qty_positive").key(), "check:qty_positive");
        assert_eq!(Directive::foreign_key("users.id").key(), "foreign_key:users.id");
        assert_eq!(Directive::default_value("0").key(), "default:");
    }

    #[test]
    fn test_snapshot_json_round_trip_shape() {
        let snapshot = SchemaSnapshot::new(Utc::now()).with_table(users());
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["tables"]["users"]["columns"]["id"]["type"], "Int");
        assert_eq!(
            json["tables"]["users"]["columns"]["id"]["directives"][0]["kind"],
            "primary_key"
        );
    }
}
