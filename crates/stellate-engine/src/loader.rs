//! Fact loading

use std::collections::HashSet;

use stellate_core::{
    DuplicatePolicy, FactStats, LoadError, Row, RowBuffer, SchemaDefinition, Value,
};
use stellate_warehouse::{OnConflict, TableSpec, Warehouse};

use crate::error::load_error;

/// Project a row onto the declared columns of a schema
///
/// Values are coerced to the column types and missing values take the
/// column default. Fields that are not columns are dropped.
pub fn project_row(schema: &SchemaDefinition, row: &Row, index: usize) -> Result<Row, LoadError> {
    let mut projected = Row::new();

    for column in &schema.columns {
        let value = match row.get(&column.name) {
            Some(value) if !value.is_null() => {
                value
                    .coerce(&column.logical_type)
                    .map_err(|message| LoadError::InvalidValue {
                        table: schema.table().to_string(),
                        row: index,
                        column: column.name.clone(),
                        message,
                    })?
            }
            _ => match &column.default {
                Some(default) => default.clone(),
                None if column.nullable => Value::Null,
                None => {
                    return Err(LoadError::MissingValue {
                        table: schema.table().to_string(),
                        row: index,
                        column: column.name.clone(),
                    })
                }
            },
        };
        projected.insert(column.name.clone(), value);
    }

    Ok(projected)
}

/// Writes resolved fact rows
pub struct FactLoader<'a> {
    warehouse: &'a dyn Warehouse,
}

impl<'a> FactLoader<'a> {
    pub fn new(warehouse: &'a dyn Warehouse) -> Self {
        Self { warehouse }
    }

    /// Load a batch of fact rows
    ///
    /// Facts without a unique key are appended. With a unique key the
    /// schema's duplicate policy applies: `reject` fails the whole batch on
    /// the first duplicate and writes nothing, `skip` keeps existing rows
    /// and counts the skipped ones.
    pub async fn load(&self, schema: &SchemaDefinition, rows: RowBuffer) -> Result<FactStats, LoadError> {
        let table = TableSpec::from_definition(schema);
        let total = rows.len();

        let projected = rows
            .iter()
            .enumerate()
            .map(|(index, row)| project_row(schema, row, index))
            .collect::<Result<Vec<_>, _>>()?;

        let (batch, on_conflict) = if table.unique_key.is_empty() {
            (projected, OnConflict::Error)
        } else {
            let mut seen = HashSet::new();
            let mut batch = Vec::with_capacity(projected.len());
            for row in projected {
                let key = table.key_of(&row);
                if seen.insert(key.clone()) {
                    batch.push(row);
                } else if schema.on_duplicate == DuplicatePolicy::Reject {
                    return Err(LoadError::DuplicateFact {
                        table: table.name.clone(),
                        key: key.to_string(),
                    });
                }
            }

            match schema.on_duplicate {
                DuplicatePolicy::Reject => (batch, OnConflict::Error),
                DuplicatePolicy::Skip => (batch, OnConflict::Ignore),
            }
        };

        let inserted = self
            .warehouse
            .insert_rows(&table, &batch, on_conflict)
            .await
            .map_err(|e| load_error(&table.name, e))?;

        let stats = FactStats {
            inserted,
            skipped: total - inserted,
        };
        tracing::info!(
            fact = %schema.name,
            inserted = stats.inserted,
            skipped = stats.skipped,
            "Loaded fact rows"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stellate_core::{row, Column, ColumnRole, LogicalType, SchemaKind};
    use stellate_warehouse::MemoryWarehouse;

    fn fact(policy: DuplicatePolicy) -> SchemaDefinition {
        SchemaDefinition {
            name: "fact_sales".into(),
            kind: SchemaKind::Fact,
            columns: vec![
                Column::new("store", LogicalType::Int, ColumnRole::DimensionKey),
                Column::new(
                    "amount",
                    LogicalType::Decimal { precision: Some(12), scale: Some(2) },
                    ColumnRole::Metric,
                ),
                Column::new("currency", LogicalType::String, ColumnRole::Metric)
                    .with_default(Value::from("EUR")),
            ],
            unique_key: vec!["store".into()],
            source: None,
            expansions: vec![],
            references: vec![],
            on_duplicate: policy,
            hooks: Default::default(),
        }
    }

    fn sales(stores: &[i64]) -> RowBuffer {
        stores
            .iter()
            .map(|s| row([("store", Value::Int(*s)), ("amount", Value::from("10.0"))]))
            .collect()
    }

    #[test]
    fn projection_applies_defaults_and_drops_extras() {
        let schema = fact(DuplicatePolicy::Reject);
        let projected = project_row(
            &schema,
            &row([
                ("store", Value::Int(1)),
                ("amount", Value::from("3.5")),
                ("store_code", Value::from("S1")),
            ]),
            0,
        )
        .unwrap();

        assert_eq!(projected.get("currency"), Some(&Value::from("EUR")));
        assert!(!projected.contains_key("store_code"));

        let err = project_row(&schema, &row([("store", Value::Int(1))]), 4).unwrap_err();
        assert_eq!(
            err,
            LoadError::MissingValue {
                table: "fact_sales".into(),
                row: 4,
                column: "amount".into()
            }
        );
    }

    #[tokio::test]
    async fn reject_policy() {
        let warehouse = MemoryWarehouse::new();
        let schema = fact(DuplicatePolicy::Reject);
        warehouse.create_table(&TableSpec::from_definition(&schema)).await.unwrap();
        let loader = FactLoader::new(&warehouse);

        // Duplicate inside the batch: nothing written
        let err = loader.load(&schema, sales(&[1, 2, 1])).await.unwrap_err();
        assert!(matches!(err, LoadError::DuplicateFact { .. }));
        assert_eq!(warehouse.row_count("fact_sales").await.unwrap(), 0);

        let stats = loader.load(&schema, sales(&[1, 2])).await.unwrap();
        assert_eq!(stats.inserted, 2);

        // Duplicate against existing rows: nothing written
        let err = loader.load(&schema, sales(&[3, 1])).await.unwrap_err();
        assert!(matches!(err, LoadError::DuplicateFact { .. }));
        assert_eq!(warehouse.row_count("fact_sales").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn skip_policy() {
        let warehouse = MemoryWarehouse::new();
        let schema = fact(DuplicatePolicy::Skip);
        warehouse.create_table(&TableSpec::from_definition(&schema)).await.unwrap();
        let loader = FactLoader::new(&warehouse);

        loader.load(&schema, sales(&[1, 2])).await.unwrap();
        let stats = loader.load(&schema, sales(&[1, 2, 3, 3])).await.unwrap();

        assert_eq!(stats, FactStats { inserted: 1, skipped: 3 });
        assert_eq!(warehouse.row_count("fact_sales").await.unwrap(), 3);
    }
}
