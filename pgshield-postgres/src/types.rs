//! Type conversions between the port and PostgreSQL.

use pgshield_core::SqlValue;
use postgres_types::ToSql;

/// A boxed query parameter.
pub type PgParam = Box<dyn ToSql + Sync + Send>;

/// Convert a port value into a PostgreSQL parameter.
pub fn to_param(value: &SqlValue) -> PgParam {
    match value {
        SqlValue::Null => Box::new(Option::<String>::None),
        SqlValue::Bool(b) => Box::new(*b),
        SqlValue::Int(i) => Box::new(*i),
        SqlValue::Float(f) => Box::new(*f),
        SqlValue::Text(s) => Box::new(s.clone()),
    }
}

/// Convert port values into PostgreSQL parameters.
pub fn to_params(values: &[SqlValue]) -> Vec<PgParam> {
    values.iter().map(to_param).collect()
}

/// Borrow boxed parameters in the shape tokio-postgres expects.
pub fn param_refs(params: &[PgParam]) -> Vec<&(dyn ToSql + Sync)> {
    params
        .iter()
        .map(|p| p.as_ref() as &(dyn ToSql + Sync))
        .collect()
}

/// Declared type of a column as reported by `information_schema.columns`.
///
/// Returns the type and whether the column is an array.
pub fn catalog_type(data_type: &str, udt_name: &str, max_length: Option<i32>) -> (String, bool) {
    match data_type {
        "ARRAY" => (udt_name.trim_start_matches('_').to_string(), true),
        "USER-DEFINED" => (udt_name.to_string(), false),
        "character varying" => match max_length {
            Some(n) => (format!("varchar({})", n), false),
            None => ("varchar".to_string(), false),
        },
        "character" => match max_length {
            Some(n) => (format!("char({})", n), false),
            None => ("char".to_string(), false),
        },
        other => (other.to_string(), false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_params() {
        let params = to_params(&[
            SqlValue::Int(42),
            SqlValue::from("users"),
            SqlValue::Bool(true),
            SqlValue::Null,
        ]);
        assert_eq!(params.len(), 4);
        assert_eq!(param_refs(&params).len(), 4);
        assert_eq!(format!("{:?}", params[1]), "\"users\"");
    }

    #[test]
    fn test_catalog_type() {
        assert_eq!(catalog_type("integer", "int4", None), ("integer".to_string(), false));
        assert_eq!(
            catalog_type("character varying", "varchar", Some(255)),
            ("varchar(255)".to_string(), false)
        );
        assert_eq!(catalog_type("ARRAY", "_text", None), ("text".to_string(), true));
        assert_eq!(catalog_type("USER-DEFINED", "mood", None), ("mood".to_string(), false));
    }
}
