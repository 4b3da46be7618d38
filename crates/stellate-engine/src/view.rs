//! Reporting view generation
//!
//! The view joins a fact to each referenced dimension on its surrogate key.
//! Dimension columns are aliased `<reference>_<column>` so that two
//! dimensions with a `name` column do not collide.

use stellate_core::{ColumnRole, SchemaDefinition, SchemaError, SURROGATE_KEY};
use stellate_schema::Catalog;
use stellate_warehouse::ddl::{quote_ident, replace_view_sql};

/// Name of a fact's reporting view
pub fn view_name(fact: &SchemaDefinition) -> String {
    format!("{}_view", fact.name)
}

/// SELECT statement behind the view
pub fn view_select(fact: &SchemaDefinition, catalog: &Catalog) -> Result<String, SchemaError> {
    let table = quote_ident(fact.table());

    let mut columns: Vec<String> = fact
        .measure_columns()
        .iter()
        .map(|c| format!("{}.{}", table, quote_ident(&c.name)))
        .collect();
    let mut joins = Vec::with_capacity(fact.references.len());

    for reference in &fact.references {
        let dimension = catalog.schema(&reference.dimension)?;
        let alias = quote_ident(&reference.name);

        columns.extend(
            dimension
                .columns
                .iter()
                .filter(|c| c.role != ColumnRole::DimensionKey)
                .map(|c| {
                    format!(
                        "{}.{} AS {}",
                        alias,
                        quote_ident(&c.name),
                        quote_ident(&format!("{}_{}", reference.name, c.name))
                    )
                }),
        );

        joins.push(format!(
            "LEFT JOIN {} AS {} ON {}.{} = {}.{}",
            quote_ident(dimension.table()),
            alias,
            alias,
            quote_ident(SURROGATE_KEY),
            table,
            quote_ident(&reference.column)
        ));
    }

    if columns.is_empty() {
        columns.push(format!("{}.{}", table, quote_ident(SURROGATE_KEY)));
    }

    let mut sql = format!("SELECT\n    {}\nFROM {}", columns.join(",\n    "), table);
    for join in joins {
        sql.push('\n');
        sql.push_str(&join);
    }
    Ok(sql)
}

/// Complete `CREATE OR REPLACE VIEW` statement
pub fn generate(fact: &SchemaDefinition, catalog: &Catalog) -> Result<String, SchemaError> {
    Ok(replace_view_sql(&view_name(fact), &view_select(fact, catalog)?))
}
