//! Portable DDL/DML rendering
//!
//! Statements use PostgreSQL-compatible syntax with `$n` placeholders.
//! Identifiers are always quoted.

use stellate_core::{LogicalType, Value, SURROGATE_KEY};

use crate::adapter::{ColumnSpec, OnConflict, TableSpec};

/// Quote an identifier
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Physical column type for a logical type
pub fn column_type(logical_type: &LogicalType) -> String {
    match logical_type {
        LogicalType::Bool => "BOOLEAN".to_string(),
        LogicalType::Int => "BIGINT".to_string(),
        LogicalType::Decimal { precision, scale } => match (precision, scale) {
            (Some(p), Some(s)) => format!("NUMERIC({}, {})", p, s),
            (Some(p), None) => format!("NUMERIC({})", p),
            _ => "NUMERIC".to_string(),
        },
        LogicalType::String => "TEXT".to_string(),
        LogicalType::Date => "DATE".to_string(),
        LogicalType::Timestamp => "TIMESTAMP".to_string(),
    }
}

/// SQL literal for a constant (used for column defaults)
pub fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Decimal(d) => d.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Date(_) => format!("DATE '{}'", value),
        Value::Timestamp(_) => format!("TIMESTAMP '{}'", value),
    }
}

/// Column definition clause, e.g. `"amount" NUMERIC(12, 2) NOT NULL`
pub fn column_definition(column: &ColumnSpec) -> String {
    let mut def = format!(
        "{} {}",
        quote_ident(&column.name),
        column_type(&column.logical_type)
    );
    if let Some(default) = &column.default {
        def.push_str(" DEFAULT ");
        def.push_str(&sql_literal(default));
    }
    if !column.nullable {
        def.push_str(" NOT NULL");
    }
    def
}

/// `CREATE TABLE IF NOT EXISTS` with surrogate key and unique constraint
pub fn create_table_sql(table: &TableSpec) -> String {
    let mut defs = vec![format!(
        "{} BIGINT GENERATED BY DEFAULT AS IDENTITY PRIMARY KEY",
        quote_ident(SURROGATE_KEY)
    )];
    defs.extend(table.columns.iter().map(column_definition));

    if !table.unique_key.is_empty() {
        defs.push(unique_constraint(table));
    }

    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        quote_ident(&table.name),
        defs.join(",\n    ")
    )
}

/// `ALTER TABLE ... ADD COLUMN`
///
/// Added columns are nullable unless they carry a default, since existing
/// rows cannot satisfy `NOT NULL` otherwise.
pub fn add_column_sql(table: &str, column: &ColumnSpec) -> String {
    let mut column = column.clone();
    if column.default.is_none() {
        column.nullable = true;
    }
    format!(
        "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {}",
        quote_ident(table),
        column_definition(&column)
    )
}

/// `ALTER TABLE ... ADD CONSTRAINT ... UNIQUE` for a table created without one
pub fn add_unique_key_sql(table: &TableSpec) -> String {
    format!(
        "ALTER TABLE {} ADD {}",
        quote_ident(&table.name),
        unique_constraint(table)
    )
}

fn unique_constraint(table: &TableSpec) -> String {
    format!(
        "CONSTRAINT {} UNIQUE ({})",
        quote_ident(&format!("{}_unique_key", table.name)),
        column_list(&table.unique_key)
    )
}

/// `CREATE OR REPLACE VIEW`
pub fn replace_view_sql(name: &str, select: &str) -> String {
    format!("CREATE OR REPLACE VIEW {} AS\n{}", quote_ident(name), select)
}

/// Parameterized single-row insert
pub fn insert_sql(table: &str, columns: &[String], on_conflict: OnConflict) -> String {
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${}", i)).collect();
    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(table),
        column_list(columns),
        placeholders.join(", ")
    );
    if on_conflict == OnConflict::Ignore {
        sql.push_str(" ON CONFLICT DO NOTHING");
    }
    sql
}

/// Single-row insert returning the surrogate key
pub fn insert_returning_sql(table: &str, columns: &[String]) -> String {
    format!(
        "{} RETURNING {}",
        insert_sql(table, columns, OnConflict::Error),
        quote_ident(SURROGATE_KEY)
    )
}

/// Parameterized lookup of a surrogate key by unique key
pub fn find_key_sql(table: &str, key_columns: &[String]) -> String {
    let predicates: Vec<String> = key_columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = ${}", quote_ident(c), i + 1))
        .collect();
    format!(
        "SELECT {} FROM {} WHERE {}",
        quote_ident(SURROGATE_KEY),
        quote_ident(table),
        predicates.join(" AND ")
    )
}

/// All rows ordered by surrogate key
pub fn select_all_sql(table: &str) -> String {
    format!(
        "SELECT * FROM {} ORDER BY {}",
        quote_ident(table),
        quote_ident(SURROGATE_KEY)
    )
}

/// Row count
pub fn count_sql(table: &str) -> String {
    format!("SELECT COUNT(*) FROM {}", quote_ident(table))
}

fn column_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store_table() -> TableSpec {
        TableSpec::new(
            "dim_store",
            vec![
                ColumnSpec {
                    name: "store_code".into(),
                    logical_type: LogicalType::String,
                    nullable: false,
                    default: None,
                },
                ColumnSpec {
                    name: "name".into(),
                    logical_type: LogicalType::String,
                    nullable: true,
                    default: None,
                },
                ColumnSpec {
                    name: "open".into(),
                    logical_type: LogicalType::Bool,
                    nullable: false,
                    default: Some(Value::Bool(true)),
                },
            ],
            vec!["store_code".into()],
        )
    }

    #[test]
    fn quoting() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(sql_literal(&Value::from("O'Brien")), "'O''Brien'");
    }

    #[test]
    fn create_table() {
        assert_eq!(
            create_table_sql(&store_table()),
            "CREATE TABLE IF NOT EXISTS \"dim_store\" (
    \"id\" BIGINT GENERATED BY DEFAULT AS IDENTITY PRIMARY KEY,
    \"store_code\" TEXT NOT NULL,
    \"name\" TEXT,
    \"open\" BOOLEAN DEFAULT TRUE NOT NULL,
    CONSTRAINT \"dim_store_unique_key\" UNIQUE (\"store_code\")
)"
        );
    }

    #[test]
    fn add_unique_key() {
        assert_eq!(
            add_unique_key_sql(&store_table()),
            "ALTER TABLE \"dim_store\" ADD CONSTRAINT \"dim_store_unique_key\" UNIQUE (\"store_code\")"
        );
    }

    #[test]
    fn add_column_relaxes_not_null_without_default() {
        let table = store_table();
        assert_eq!(
            add_column_sql("dim_store", &table.columns[0]),
            "ALTER TABLE \"dim_store\" ADD COLUMN IF NOT EXISTS \"store_code\" TEXT"
        );
        assert_eq!(
            add_column_sql("dim_store", &table.columns[2]),
            "ALTER TABLE \"dim_store\" ADD COLUMN IF NOT EXISTS \"open\" BOOLEAN DEFAULT TRUE NOT NULL"
        );
    }

    #[test]
    fn dml_statements() {
        let columns = vec!["store_code".to_string(), "name".to_string()];
        assert_eq!(
            insert_sql("dim_store", &columns, OnConflict::Ignore),
            "INSERT INTO \"dim_store\" (\"store_code\", \"name\") VALUES ($1, $2) ON CONFLICT DO NOTHING"
        );
        assert_eq!(
            insert_returning_sql("dim_store", &columns),
            "INSERT INTO \"dim_store\" (\"store_code\", \"name\") VALUES ($1, $2) RETURNING \"id\""
        );
        assert_eq!(
            find_key_sql("dim_store", &columns),
            "SELECT \"id\" FROM \"dim_store\" WHERE \"store_code\" = $1 AND \"name\" = $2"
        );
    }

    #[test]
    fn decimal_types() {
        assert_eq!(
            column_type(&LogicalType::Decimal { precision: Some(12), scale: Some(2) }),
            "NUMERIC(12, 2)"
        );
        assert_eq!(
            column_type(&LogicalType::Decimal { precision: None, scale: None }),
            "NUMERIC"
        );
    }
}
