//! PostgreSQL SQL rendering helpers.

use crate::snapshot::{ColumnDef, DirectiveKind};

/// Quote a PostgreSQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Quote and comma-join a list of identifiers.
pub fn ident_list<S: AsRef<str>>(names: &[S]) -> String {
    names
        .iter()
        .map(|n| quote_ident(n.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Map a declared column type to a PostgreSQL type.
///
/// Schema-language scalars are translated; anything else is assumed to be a
/// PostgreSQL type already and passed through.
pub fn sql_type(declared: &str) -> String {
    match declared.trim() {
        "String" | "ID" => "TEXT".to_string(),
        "Int" => "INTEGER".to_string(),
        "BigInt" => "BIGINT".to_string(),
        "Float" => "DOUBLE PRECISION".to_string(),
        "Decimal" => "NUMERIC".to_string(),
        "Boolean" => "BOOLEAN".to_string(),
        "DateTime" => "TIMESTAMP WITH TIME ZONE".to_string(),
        "Date" => "DATE".to_string(),
        "Time" => "TIME".to_string(),
        "JSON" | "Json" => "JSONB".to_string(),
        "Bytes" => "BYTEA".to_string(),
        "UUID" | "Uuid" => "UUID".to_string(),
        other => other.to_string(),
    }
}

/// Render the full SQL type of a column, including the array suffix.
pub fn column_type(column: &ColumnDef) -> String {
    let base = sql_type(&column.column_type);
    if column.list { format!("{}[]", base) } else { base }
}

/// Render a column definition for `CREATE TABLE` / `ADD COLUMN`.
pub fn column_definition(column: &ColumnDef) -> String {
    let mut parts = vec![quote_ident(&column.name), column_type(column)];

    if !column.nullable {
        parts.push("NOT NULL".to_string());
    }

    for directive in &column.directives {
        match &directive.kind {
            DirectiveKind::Unique => parts.push("UNIQUE".to_string()),
            DirectiveKind::Default => {
                if let Some(value) = directive.arg_value("value") {
                    parts.push(format!("DEFAULT {}", value));
                }
            }
            DirectiveKind::ForeignKey => {
                if let Some((table, col)) = directive.foreign_key_target() {
                    parts.push(format!(
                        "REFERENCES {} ({})",
                        quote_ident(&table),
                        quote_ident(&col)
                    ));
                }
            }
            DirectiveKind::Check => {
                if let Some(expr) = directive.arg_value("expression") {
                    parts.push(format!("CHECK ({})", expr));
                }
            }
            _ => {}
        }
    }

    parts.join(" ")
}
