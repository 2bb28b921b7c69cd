//! Drift detection between an expected and an actual schema snapshot.
//!
//! Comparison is pure: [`DriftValidator::compare`] takes two snapshots and
//! returns a [`DriftReport`] without touching a database. Differences are
//! ranked by [`Severity`], bucketed into categories, scored into a
//! [`RiskLevel`] and paired with repair recommendations.
//!
//! Comparing `A` against `B` and `B` against `A` names the same tables and
//! columns; only severity, impact and repair differ with direction.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::GuardResult;
use crate::operation::{ColumnChange, ConstraintSpec, DefaultChange, Operation};
use crate::snapshot::{ColumnDef, Directive, DirectiveKind, SchemaSnapshot, TableDef};
use crate::sql::{quote_ident, quote_literal};

/// How serious a difference is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Cosmetic.
    Low,
    /// Should be fixed in a planned change.
    Medium,
    /// Likely to cause incorrect behaviour.
    High,
    /// Breaks the application.
    Critical,
}

impl Severity {
    /// Weight in the drift risk score.
    pub fn weight(&self) -> u32 {
        match self {
            Self::Critical => 10,
            Self::High => 6,
            Self::Medium => 3,
            Self::Low => 1,
        }
    }
}

impl fmt::Display for Severity {
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

/// What a difference does to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Impact {
    /// Queries will fail.
    Breaking,
    /// Values may be truncated or rejected.
    DataLossRisk,
    /// A constraint the application relies on is absent.
    ConstraintMissing,
    /// The database carries something the schema does not declare.
    SchemaDrift,
    /// The database is stricter than declared.
    ConstraintRelaxed,
}

/// Kind of difference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DifferenceKind {
    /// Table expected but absent.
    MissingTable,
    /// Table present but not expected.
    ExtraTable,
    /// Column expected but absent.
    MissingField,
    /// Column present but not expected.
    ExtraField,
    /// Column types differ under the tolerance policy.
    TypeMismatch,
    /// Column nullability differs.
    NullabilityMismatch,
    /// Scalar on one side, list on the other.
    ListShapeMismatch,
    /// List item nullability differs.
    ListItemNullabilityMismatch,
    /// Directive expected but absent.
    MissingDirective,
    /// Directive present but not expected.
    ExtraDirective,
    /// Directive present on both sides with different arguments.
    DirectiveMismatch,
}

/// Suggested repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairAction {
    /// Create the missing object.
    Create,
    /// Add the missing column or constraint.
    Add,
    /// Alter the existing object.
    Alter,
    /// Drop the unexpected object.
    Drop,
    /// Record the unexpected object instead of dropping it.
    Document,
    /// Cannot be repaired mechanically.
    Manual,
}

/// Category a difference falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftCategory {
    /// Tables and columns.
    Structural,
    /// Types, nullability and list shape.
    Semantic,
    /// Constraints, indexes and row-level security.
    Behavioral,
    /// Defaults.
    Cosmetic,
}

/// Overall drift risk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Score below 10.
    Low,
    /// Score from 10.
    Medium,
    /// Score from 20.
    High,
    /// Score from 50.
    Extreme,
}

impl RiskLevel {
    /// Level for a weighted severity sum.
    pub fn from_score(score: u32) -> Self {
        match score {
            s if s >= 50 => Self::Extreme,
            s if s >= 20 => Self::High,
            s if s >= 10 => Self::Medium,
            _ => Self::Low,
        }
    }
}

/// Severity of a directive difference, by directive kind.
pub const DIRECTIVE_SEVERITY: &[(&str, Severity)] = &[
    ("primary_key", Severity::Critical),
    ("row_level_security", Severity::Critical),
    ("foreign_key", Severity::High),
    ("unique", Severity::High),
    ("check", Severity::High),
    ("index", Severity::Medium),
    ("default", Severity::Low),
];

/// Severity for a directive kind. Custom directives are `Medium`.
pub fn directive_severity(kind: &DirectiveKind) -> Severity {
    DIRECTIVE_SEVERITY
        .iter()
        .find(|(name, _)| *name == kind.as_str())
        .map(|(_, severity)| *severity)
        .unwrap_or(Severity::Medium)
}

/// How strictly column types are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeTolerance {
    /// Normalised names must be equal.
    Strict,
    /// Names in the same equivalence family match.
    #[default]
    Compatible,
    /// Names in the same broad class match.
    Loose,
}

/// Type equivalence families and the broad class each belongs to.
pub const TYPE_FAMILIES: &[(&str, &str, &[&str])] = &[
    (
        "string",
        "textual",
        &[
            "string",
            "id",
            "text",
            "varchar",
            "character varying",
            "char",
            "character",
            "bpchar",
            "citext",
            "name",
        ],
    ),
    (
        "integer",
        "numeric",
        &["int", "integer", "int4", "smallint", "int2", "serial", "serial4", "smallserial"],
    ),
    ("bigint", "numeric", &["bigint", "int8", "bigserial", "serial8"]),
    (
        "float",
        "numeric",
        &["float", "double precision", "float8", "real", "float4"],
    ),
    ("decimal", "numeric", &["decimal", "numeric", "money"]),
    ("boolean", "boolean", &["boolean", "bool"]),
    ("uuid", "textual", &["uuid"]),
    (
        "timestamp",
        "temporal",
        &[
            "datetime",
            "timestamp",
            "timestamptz",
            "timestamp with time zone",
            "timestamp without time zone",
        ],
    ),
    ("date", "temporal", &["date"]),
    (
        "time",
        "temporal",
        &["time", "timetz", "time with time zone", "time without time zone"],
    ),
    ("json", "structured", &["json", "jsonb"]),
    ("bytes", "structured", &["bytes", "bytea"]),
];

/// Lower-case, drop length/precision and array suffixes, collapse whitespace.
pub fn normalize_type(declared: &str) -> String {
    let mut out = String::with_capacity(declared.len());
    let mut depth = 0usize;
    for ch in declared.trim().trim_end_matches("[]").chars() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 => out.extend(ch.to_lowercase()),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn type_family(normalized: &str) -> Option<(&'static str, &'static str)> {
    TYPE_FAMILIES
        .iter()
        .find(|(_, _, members)| members.contains(&normalized))
        .map(|(family, class, _)| (*family, *class))
}

impl TypeTolerance {
    /// Whether two declared types match under this policy.
    pub fn matches(&self, expected: &str, actual: &str) -> bool {
        let (e, a) = (normalize_type(expected), normalize_type(actual));
        if e == a {
            return true;
        }
        match (self, type_family(&e), type_family(&a)) {
            (Self::Strict, _, _) => false,
            (Self::Compatible, Some((fe, _)), Some((fa, _))) => fe == fa,
            (Self::Loose, Some((_, ce)), Some((_, ca))) => ce == ca,
            _ => false,
        }
    }
}

/// Drift settings, read from `[drift]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    /// Treat unexpected tables and columns as high severity and repair by dropping.
    pub strict_mode: bool,
    /// Type comparison policy.
    pub type_tolerance: TypeTolerance,
}

impl DriftConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set strict mode.
    pub fn strict_mode(mut self, strict: bool) -> Self {
        self.strict_mode = strict;
        self
    }

    /// Set the type tolerance.
    pub fn type_tolerance(mut self, tolerance: TypeTolerance) -> Self {
        self.type_tolerance = tolerance;
        self
    }
}

/// A single difference between expected and actual schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Difference {
    /// What differs.
    #[serde(rename = "type")]
    pub kind: DifferenceKind,
    /// Table name.
    pub table: String,
    /// Column name, for column-level differences.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    /// The directive involved, for directive differences.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directive: Option<Directive>,
    /// Severity.
    pub severity: Severity,
    /// Impact.
    pub impact: Impact,
    /// Expected value, rendered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_value: Option<String>,
    /// Actual value, rendered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_value: Option<String>,
    /// Suggested repair.
    pub repair_action: RepairAction,
}

impl Difference {
    fn new(
        kind: DifferenceKind,
        table: &str,
        severity: Severity,
        impact: Impact,
        repair_action: RepairAction,
    ) -> Self {
        Self {
            kind,
            table: table.to_string(),
            column: None,
            directive: None,
            severity,
            impact,
            expected_value: None,
            actual_value: None,
            repair_action,
        }
    }

    fn column(mut self, column: &str) -> Self {
        self.column = Some(column.to_string());
        self
    }

    fn with_directive(mut self, directive: &Directive) -> Self {
        self.directive = Some(directive.clone());
        self
    }

    fn values(mut self, expected: Option<String>, actual: Option<String>) -> Self {
        self.expected_value = expected;
        self.actual_value = actual;
        self
    }

    /// Category of this difference.
    pub fn category(&self) -> DriftCategory {
        match self.kind {
            DifferenceKind::MissingTable
            | DifferenceKind::ExtraTable
            | DifferenceKind::MissingField
            | DifferenceKind::ExtraField => DriftCategory::Structural,
            DifferenceKind::TypeMismatch
            | DifferenceKind::NullabilityMismatch
            | DifferenceKind::ListShapeMismatch
            | DifferenceKind::ListItemNullabilityMismatch => DriftCategory::Semantic,
            DifferenceKind::MissingDirective
            | DifferenceKind::ExtraDirective
            | DifferenceKind::DirectiveMismatch => match &self.directive {
                Some(d) if d.kind == DirectiveKind::Default => DriftCategory::Cosmetic,
                _ => DriftCategory::Behavioral,
            },
        }
    }

    /// Dotted location, e.g. `users.email`.
    pub fn location(&self) -> String {
        match &self.column {
            Some(column) => format!("{}.{}", self.table, column),
            None => self.table.clone(),
        }
    }

    /// One-line description.
    pub fn describe(&self) -> String {
        let what = match self.kind {
            DifferenceKind::MissingTable => "missing table".to_string(),
            DifferenceKind::ExtraTable => "unexpected table".to_string(),
            DifferenceKind::MissingField => "missing column".to_string(),
            DifferenceKind::ExtraField => "unexpected column".to_string(),
            DifferenceKind::TypeMismatch => format!(
                "type {} but expected {}",
                self.actual_value.as_deref().unwrap_or("?"),
                self.expected_value.as_deref().unwrap_or("?")
            ),
            DifferenceKind::NullabilityMismatch => format!(
                "{} but expected {}",
                self.actual_value.as_deref().unwrap_or("?"),
                self.expected_value.as_deref().unwrap_or("?")
            ),
            DifferenceKind::ListShapeMismatch => "list shape differs".to_string(),
            DifferenceKind::ListItemNullabilityMismatch => {
                "list item nullability differs".to_string()
            }
            DifferenceKind::MissingDirective => format!("missing {}", self.directive_label()),
            DifferenceKind::ExtraDirective => format!("unexpected {}", self.directive_label()),
            DifferenceKind::DirectiveMismatch => format!("{} differs", self.directive_label()),
        };
        format!("[{}] {}: {}", self.severity, self.location(), what)
    }

    fn directive_label(&self) -> String {
        self.directive
            .as_ref()
            .map(|d| d.key())
            .unwrap_or_else(|| "directive".to_string())
    }
}

/// Differences bucketed by category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftCategories {
    /// Tables and columns.
    pub structural: Vec<Difference>,
    /// Constraints, indexes and RLS.
    pub behavioral: Vec<Difference>,
    /// Types and nullability.
    pub semantic: Vec<Difference>,
    /// Defaults.
    pub cosmetic: Vec<Difference>,
}

/// A repair suggestion with a best-effort SQL hint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    /// What is wrong.
    pub description: String,
    /// Suggested repair.
    pub action: RepairAction,
    /// SQL that would perform the repair.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_hint: Option<String>,
}

/// Recommendations bucketed by urgency.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendations {
    /// For critical differences.
    pub immediate: Vec<Recommendation>,
    /// For high and medium differences.
    pub planned: Vec<Recommendation>,
    /// For low differences.
    pub optional: Vec<Recommendation>,
}

/// Result of comparing two snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftReport {
    /// Differences, most severe first.
    pub differences: Vec<Difference>,
    /// Differences by category.
    pub categories: DriftCategories,
    /// Weighted severity sum.
    pub risk_score: u32,
    /// Level of the score.
    pub risk_level: RiskLevel,
    /// Repair suggestions.
    pub recommendations: Recommendations,
}

impl DriftReport {
    fn from_differences(mut differences: Vec<Difference>, expected: &SchemaSnapshot) -> Self {
        differences.sort_by(|a, b| b.severity.cmp(&a.severity));

        let mut categories = DriftCategories::default();
        let mut recommendations = Recommendations::default();

        for diff in &differences {
            match diff.category() {
                DriftCategory::Structural => categories.structural.push(diff.clone()),
                DriftCategory::Behavioral => categories.behavioral.push(diff.clone()),
                DriftCategory::Semantic => categories.semantic.push(diff.clone()),
                DriftCategory::Cosmetic => categories.cosmetic.push(diff.clone()),
            }

            let ops = repair_operations(diff, expected);
            let recommendation = Recommendation {
                description: diff.describe(),
                action: diff.repair_action,
                sql_hint: if ops.is_empty() {
                    documentation_hint(diff)
                } else {
                    Some(
                        ops.iter()
                            .map(|op| format!("{};", op.to_sql()))
                            .collect::<Vec<_>>()
                            .join("\n"),
                    )
                },
            };
            match diff.severity {
                Severity::Critical => recommendations.immediate.push(recommendation),
                Severity::High | Severity::Medium => recommendations.planned.push(recommendation),
                Severity::Low => recommendations.optional.push(recommendation),
            }
        }

        let risk_score = differences.iter().map(|d| d.severity.weight()).sum();

        Self {
            differences,
            categories,
            risk_score,
            risk_level: RiskLevel::from_score(risk_score),
            recommendations,
        }
    }

    /// Check if any drift was found.
    pub fn has_drift(&self) -> bool {
        !self.differences.is_empty()
    }

    /// Number of differences at the given severity.
    pub fn count(&self, severity: Severity) -> usize {
        self.differences
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }

    /// Get a summary of the drift.
    pub fn summary(&self) -> String {
        if !self.has_drift() {
            return "No drift detected".to_string();
        }
        let mut parts = Vec::new();
        for severity in [
            Severity::Critical,
            Severity::High,
            Severity::Medium,
            Severity::Low,
        ] {
            let n = self.count(severity);
            if n > 0 {
                parts.push(format!("{} {}", n, severity));
            }
        }
        format!(
            "{} differences ({}); risk {:?}",
            self.differences.len(),
            parts.join(", "),
            self.risk_level
        )
    }

    /// Operations that repair every mechanically repairable difference.
    ///
    /// `expected` must be the snapshot the report was computed against.
    pub fn to_operations(&self, expected: &SchemaSnapshot) -> Vec<Operation> {
        self.differences
            .iter()
            .flat_map(|d| repair_operations(d, expected))
            .collect()
    }
}

/// Compares snapshots.
#[derive(Debug, Clone, Default)]
pub struct DriftValidator {
    config: DriftConfig,
}

impl DriftValidator {
    /// Create a validator.
    pub fn new(config: DriftConfig) -> Self {
        Self { config }
    }

    /// The validator's configuration.
    pub fn config(&self) -> &DriftConfig {
        &self.config
    }

    /// Validate both snapshots, then compare them.
    pub fn detect(&self, expected: &SchemaSnapshot, actual: &SchemaSnapshot) -> GuardResult<DriftReport> {
        expected.validate()?;
        actual.validate()?;
        let report = self.compare(expected, actual);
        debug!(
            differences = report.differences.len(),
            risk = report.risk_score,
            "Detected drift"
        );
        Ok(report)
    }

    /// Compare two snapshots without validating them.
    pub fn compare(&self, expected: &SchemaSnapshot, actual: &SchemaSnapshot) -> DriftReport {
        let mut differences = Vec::new();
        let (extra_severity, extra_repair) = self.extra_rules();

        for (name, table) in &expected.tables {
            match actual.tables.get(name) {
                None => differences.push(Difference::new(
                    DifferenceKind::MissingTable,
                    name,
                    Severity::Critical,
                    Impact::Breaking,
                    RepairAction::Create,
                )),
                Some(actual_table) => {
                    self.compare_tables(table, actual_table, &mut differences);
                }
            }
        }

        for name in actual.tables.keys() {
            if !expected.tables.contains_key(name) {
                differences.push(Difference::new(
                    DifferenceKind::ExtraTable,
                    name,
                    extra_severity,
                    Impact::SchemaDrift,
                    extra_repair,
                ));
            }
        }

        DriftReport::from_differences(differences, expected)
    }

    fn extra_rules(&self) -> (Severity, RepairAction) {
        if self.config.strict_mode {
            (Severity::High, RepairAction::Drop)
        } else {
            (Severity::Medium, RepairAction::Document)
        }
    }

    fn compare_tables(&self, expected: &TableDef, actual: &TableDef, out: &mut Vec<Difference>) {
        let (extra_severity, extra_repair) = self.extra_rules();
        let table = expected.name.as_str();

        for (name, column) in &expected.columns {
            match actual.columns.get(name) {
                None => {
                    let severity = if column.nullable {
                        Severity::High
                    } else {
                        Severity::Critical
                    };
                    out.push(
                        Difference::new(
                            DifferenceKind::MissingField,
                            table,
                            severity,
                            Impact::Breaking,
                            RepairAction::Add,
                        )
                        .column(name),
                    );
                }
                Some(actual_column) => self.compare_columns(table, column, actual_column, out),
            }
        }

        for name in actual.columns.keys() {
            if !expected.columns.contains_key(name) {
                out.push(
                    Difference::new(
                        DifferenceKind::ExtraField,
                        table,
                        extra_severity,
                        Impact::SchemaDrift,
                        extra_repair,
                    )
                    .column(name),
                );
            }
        }

        self.compare_directives(expected, actual, out);
    }

    fn compare_columns(
        &self,
        table: &str,
        expected: &ColumnDef,
        actual: &ColumnDef,
        out: &mut Vec<Difference>,
    ) {
        let column = expected.name.as_str();

        if expected.list != actual.list {
            out.push(
                Difference::new(
                    DifferenceKind::ListShapeMismatch,
                    table,
                    Severity::Critical,
                    Impact::Breaking,
                    RepairAction::Manual,
                )
                .column(column)
                .values(Some(shape(expected)), Some(shape(actual))),
            );
        } else if expected.list && expected.list_item_nullable != actual.list_item_nullable {
            out.push(
                Difference::new(
                    DifferenceKind::ListItemNullabilityMismatch,
                    table,
                    Severity::Medium,
                    Impact::SchemaDrift,
                    RepairAction::Manual,
                )
                .column(column)
                .values(
                    Some(nullability(expected.list_item_nullable)),
                    Some(nullability(actual.list_item_nullable)),
                ),
            );
        }

        if !self
            .config
            .type_tolerance
            .matches(&expected.column_type, &actual.column_type)
        {
            out.push(
                Difference::new(
                    DifferenceKind::TypeMismatch,
                    table,
                    Severity::High,
                    Impact::DataLossRisk,
                    RepairAction::Alter,
                )
                .column(column)
                .values(
                    Some(expected.column_type.clone()),
                    Some(actual.column_type.clone()),
                ),
            );
        }

        if expected.nullable != actual.nullable {
            // Losing NOT NULL is worse than gaining it.
            let (severity, impact) = if expected.nullable {
                (Severity::Medium, Impact::ConstraintRelaxed)
            } else {
                (Severity::High, Impact::ConstraintMissing)
            };
            out.push(
                Difference::new(
                    DifferenceKind::NullabilityMismatch,
                    table,
                    severity,
                    impact,
                    RepairAction::Alter,
                )
                .column(column)
                .values(
                    Some(nullability(expected.nullable)),
                    Some(nullability(actual.nullable)),
                ),
            );
        }
    }

    fn compare_directives(&self, expected: &TableDef, actual: &TableDef, out: &mut Vec<Difference>) {
        let table = expected.name.as_str();
        let expected_set = directive_map(expected, actual);
        let actual_set = directive_map(actual, expected);

        for (key, directive) in &expected_set {
            let severity = directive_severity(&directive.kind);
            match actual_set.get(key) {
                None => {
                    let mut diff = Difference::new(
                        DifferenceKind::MissingDirective,
                        table,
                        severity,
                        Impact::ConstraintMissing,
                        RepairAction::Add,
                    )
                    .with_directive(directive);
                    diff.column = key.0.clone();
                    out.push(diff);
                }
                Some(other) if other.args != directive.args => {
                    let repair = if directive.kind == DirectiveKind::Default {
                        RepairAction::Alter
                    } else {
                        RepairAction::Manual
                    };
                    let mut diff = Difference::new(
                        DifferenceKind::DirectiveMismatch,
                        table,
                        severity,
                        Impact::SchemaDrift,
                        repair,
                    )
                    .with_directive(directive)
                    .values(Some(render_args(directive)), Some(render_args(other)));
                    diff.column = key.0.clone();
                    out.push(diff);
                }
                Some(_) => {}
            }
        }

        let extra_repair = self.extra_rules().1;
        for (key, directive) in &actual_set {
            if !expected_set.contains_key(key) {
                let mut diff = Difference::new(
                    DifferenceKind::ExtraDirective,
                    table,
                    directive_severity(&directive.kind),
                    Impact::SchemaDrift,
                    extra_repair,
                )
                .with_directive(directive);
                diff.column = key.0.clone();
                out.push(diff);
            }
        }
    }
}

/// Validate both snapshots and compare them with the default configuration.
pub fn detect_drift(expected: &SchemaSnapshot, actual: &SchemaSnapshot) -> GuardResult<DriftReport> {
    DriftValidator::default().detect(expected, actual)
}

type DirectiveKey = (Option<String>, String);

/// Directives of a table and of the columns it shares with `other`, keyed by
/// owning column and identity. Directives on a missing column are covered by
/// the missing-field difference.
fn directive_map<'a>(table: &'a TableDef, other: &TableDef) -> BTreeMap<DirectiveKey, &'a Directive> {
    let mut map = BTreeMap::new();
    for directive in &table.directives {
        map.insert((None, directive.key()), directive);
    }
    for column in table.columns.values() {
        if !other.columns.contains_key(&column.name) {
            continue;
        }
        for directive in &column.directives {
            map.insert((Some(column.name.clone()), directive.key()), directive);
        }
    }
    map
}

fn shape(column: &ColumnDef) -> String {
    if column.list {
        format!("[{}]", column.column_type)
    } else {
        column.column_type.clone()
    }
}

fn nullability(nullable: bool) -> String {
    if nullable { "NULL" } else { "NOT NULL" }.to_string()
}

fn render_args(directive: &Directive) -> String {
    directive
        .args
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(", ")
}

fn documentation_hint(diff: &Difference) -> Option<String> {
    match (diff.kind, diff.repair_action) {
        (DifferenceKind::ExtraTable, RepairAction::Document) => Some(format!(
            "COMMENT ON TABLE {} IS {};",
            quote_ident(&diff.table),
            quote_literal("unmanaged: not declared in schema")
        )),
        (DifferenceKind::ExtraField, RepairAction::Document) => Some(format!(
            "COMMENT ON COLUMN {}.{} IS {};",
            quote_ident(&diff.table),
            quote_ident(diff.column.as_deref().unwrap_or_default()),
            quote_literal("unmanaged: not declared in schema")
        )),
        _ => None,
    }
}

/// Directive columns: explicit `columns` argument, else the owning column.
pub(crate) fn directive_columns(directive: &Directive, owner: Option<&str>) -> Vec<String> {
    let explicit = directive.columns();
    if explicit.is_empty() {
        owner.map(|c| vec![c.to_string()]).unwrap_or_default()
    } else {
        explicit
    }
}

pub(crate) fn constraint_name(directive: &Directive, table: &str, columns: &[String], suffix: &str) -> String {
    directive.name.clone().unwrap_or_else(|| {
        if columns.is_empty() {
            format!("{}_{}", table, suffix)
        } else {
            format!("{}_{}_{}", table, columns.join("_"), suffix)
        }
    })
}

fn index_name(directive: &Directive, table: &str, columns: &[String]) -> String {
    directive
        .name
        .clone()
        .unwrap_or_else(|| format!("idx_{}_{}", table, columns.join("_")))
}

fn repair_operations(diff: &Difference, expected: &SchemaSnapshot) -> Vec<Operation> {
    let table = diff.table.clone();
    let column = diff.column.clone();
    let expected_column = || {
        column
            .as_deref()
            .and_then(|c| expected.table(&table).and_then(|t| t.columns.get(c)))
    };

    match (diff.kind, diff.repair_action) {
        (DifferenceKind::MissingTable, _) => expected
            .table(&table)
            .map(|t| {
                vec![Operation::CreateTable {
                    table: t.name.clone(),
                    columns: t.columns.values().cloned().collect(),
                    primary_key: t.primary_key(),
                }]
            })
            .unwrap_or_default(),
        (DifferenceKind::ExtraTable, RepairAction::Drop) => vec![Operation::drop_table(table)],
        (DifferenceKind::MissingField, _) => expected_column()
            .map(|c| vec![Operation::add_column(table.clone(), c.clone())])
            .unwrap_or_default(),
        (DifferenceKind::ExtraField, RepairAction::Drop) => column
            .map(|c| vec![Operation::drop_column(table, c)])
            .unwrap_or_default(),
        (DifferenceKind::TypeMismatch, _) => match (column, &diff.expected_value) {
            (Some(c), Some(new_type)) => vec![Operation::AlterTableAlterColumn {
                table,
                column: c,
                change: ColumnChange {
                    new_type: Some(new_type.clone()),
                    ..Default::default()
                },
            }],
            _ => Vec::new(),
        },
        (DifferenceKind::NullabilityMismatch, _) => match expected_column() {
            Some(c) => vec![Operation::AlterTableAlterColumn {
                table: table.clone(),
                column: c.name.clone(),
                change: ColumnChange {
                    nullable: Some(c.nullable),
                    ..Default::default()
                },
            }],
            None => Vec::new(),
        },
        (DifferenceKind::MissingDirective, _) => match &diff.directive {
            Some(d) => add_directive(&table, column.as_deref(), d),
            None => Vec::new(),
        },
        (DifferenceKind::ExtraDirective, RepairAction::Drop) => match &diff.directive {
            Some(d) => drop_directive(&table, column.as_deref(), d),
            None => Vec::new(),
        },
        (DifferenceKind::DirectiveMismatch, RepairAction::Alter) => match (&diff.directive, column)
        {
            (Some(d), Some(c)) => d
                .arg_value("value")
                .map(|v| {
                    vec![Operation::AlterTableAlterColumn {
                        table,
                        column: c,
                        change: ColumnChange {
                            default: Some(DefaultChange::Set(v.to_string())),
                            ..Default::default()
                        },
                    }]
                })
                .unwrap_or_default(),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

fn add_directive(table: &str, owner: Option<&str>, directive: &Directive) -> Vec<Operation> {
    let columns = directive_columns(directive, owner);
    match &directive.kind {
        DirectiveKind::Index => vec![Operation::CreateIndexConcurrently {
            table: table.to_string(),
            name: index_name(directive, table, &columns),
            columns,
            unique: false,
        }],
        DirectiveKind::PrimaryKey => vec![Operation::AddConstraint {
            table: table.to_string(),
            name: directive
                .name
                .clone()
                .unwrap_or_else(|| format!("{}_pkey", table)),
            constraint: ConstraintSpec::PrimaryKey { columns },
            not_valid: false,
        }],
        DirectiveKind::Unique => vec![Operation::AddConstraint {
            table: table.to_string(),
            name: constraint_name(directive, table, &columns, "key"),
            constraint: ConstraintSpec::Unique { columns },
            not_valid: false,
        }],
        DirectiveKind::ForeignKey => match directive.foreign_key_target() {
            Some((references_table, references_column)) => {
                let name = constraint_name(directive, table, &columns, "fkey");
                with_validation(
                    table,
                    name,
                    ConstraintSpec::ForeignKey {
                        columns,
                        references_table,
                        references_columns: vec![references_column],
                        on_delete: directive.arg_value("on_delete").map(str::to_string),
                    },
                )
            }
            None => Vec::new(),
        },
        DirectiveKind::Check => match directive.arg_value("expression") {
            Some(expression) => {
                let name = constraint_name(directive, table, &columns, "check");
                with_validation(
                    table,
                    name,
                    ConstraintSpec::Check {
                        expression: expression.to_string(),
                    },
                )
            }
            None => Vec::new(),
        },
        DirectiveKind::Default => match (owner, directive.arg_value("value")) {
            (Some(column), Some(value)) => vec![Operation::AlterTableAlterColumn {
                table: table.to_string(),
                column: column.to_string(),
                change: ColumnChange {
                    default: Some(DefaultChange::Set(value.to_string())),
                    ..Default::default()
                },
            }],
            _ => Vec::new(),
        },
        DirectiveKind::RowLevelSecurity => vec![Operation::RawSql {
            tables: vec![table.to_string()],
            sql: format!("ALTER TABLE {} ENABLE ROW LEVEL SECURITY", quote_ident(table)),
        }],
        DirectiveKind::Custom(_) => Vec::new(),
    }
}

/// `ADD CONSTRAINT … NOT VALID` followed by `VALIDATE CONSTRAINT`.
fn with_validation(table: &str, name: String, constraint: ConstraintSpec) -> Vec<Operation> {
    vec![
        Operation::AddConstraint {
            table: table.to_string(),
            name: name.clone(),
            constraint,
            not_valid: true,
        },
        Operation::ValidateConstraint {
            table: table.to_string(),
            name,
        },
    ]
}

fn drop_directive(table: &str, owner: Option<&str>, directive: &Directive) -> Vec<Operation> {
    let columns = directive_columns(directive, owner);
    let drop_constraint = |suffix: &str| {
        vec![Operation::DropConstraint {
            table: table.to_string(),
            name: constraint_name(directive, table, &columns, suffix),
        }]
    };
    match &directive.kind {
        DirectiveKind::Index => vec![Operation::DropIndex {
            table: table.to_string(),
            name: index_name(directive, table, &columns),
        }],
        DirectiveKind::PrimaryKey => vec![Operation::DropConstraint {
            table: table.to_string(),
            name: directive
                .name
                .clone()
                .unwrap_or_else(|| format!("{}_pkey", table)),
        }],
        DirectiveKind::Unique => drop_constraint("key"),
        DirectiveKind::ForeignKey => drop_constraint("fkey"),
        DirectiveKind::Check => drop_constraint("check"),
        DirectiveKind::Default => match owner {
            Some(column) => vec![Operation::AlterTableAlterColumn {
                table: table.to_string(),
                column: column.to_string(),
                change: ColumnChange {
                    default: Some(DefaultChange::Drop),
                    ..Default::default()
                },
            }],
            None => Vec::new(),
        },
        DirectiveKind::RowLevelSecurity => vec![Operation::RawSql {
            tables: vec![table.to_string()],
            sql: format!("ALTER TABLE {} DISABLE ROW LEVEL SECURITY", quote_ident(table)),
        }],
        DirectiveKind::Custom(_) => Vec::new(),
    }
}
