//! Schema validation and normalization
//!
//! Turns raw definition records into validated [`SchemaDefinition`]s. All
//! checks are pure; nothing here touches a warehouse or a source.

use std::collections::{BTreeMap, BTreeSet};

use stellate_core::{
    is_valid_identifier, Column, ColumnRole, DimensionReference, KeyMapping, LogicalType,
    SchemaDefinition, SchemaError, SchemaKind, Value, SURROGATE_KEY,
};

use crate::definitions::{DefinitionFile, RawColumn, RawReference, RawSchema};

/// Validates raw schemas against the full set of declared names
pub struct SchemaLoader<'a> {
    index: BTreeMap<&'a str, (SchemaKind, &'a RawSchema)>,
}

impl<'a> SchemaLoader<'a> {
    /// Index every schema in a definition set
    ///
    /// Fails if two schemas share a name.
    pub fn new(file: &'a DefinitionFile) -> Result<Self, SchemaError> {
        let mut index = BTreeMap::new();

        let all = file
            .dimensions
            .iter()
            .map(|raw| (SchemaKind::Dimension, raw))
            .chain(file.facts.iter().map(|raw| (SchemaKind::Fact, raw)));

        for (kind, raw) in all {
            if index.insert(raw.name.as_str(), (kind, raw)).is_some() {
                return Err(SchemaError::DuplicateSchema {
                    name: raw.name.clone(),
                });
            }
        }

        Ok(Self { index })
    }

    /// Validate and normalize every indexed schema
    pub fn load_all(&self) -> Result<Vec<SchemaDefinition>, SchemaError> {
        self.index
            .values()
            .map(|(kind, raw)| self.load(raw, *kind))
            .collect()
    }

    /// Validate and normalize one schema
    pub fn load(&self, raw: &RawSchema, kind: SchemaKind) -> Result<SchemaDefinition, SchemaError> {
        let schema = raw.name.as_str();
        check_identifier(schema, schema)?;

        let natural_key: Vec<String> = if kind == SchemaKind::Dimension {
            let mut seen = BTreeSet::new();
            raw.natural_key
                .iter()
                .filter(|k| seen.insert(k.as_str()))
                .cloned()
                .collect()
        } else {
            Vec::new()
        };

        let mut columns = Vec::with_capacity(raw.columns.len() + raw.dimensions.len());
        let mut names = BTreeSet::new();

        for raw_column in &raw.columns {
            let role = match kind {
                SchemaKind::Dimension if natural_key.contains(&raw_column.name) => {
                    ColumnRole::NaturalKey
                }
                SchemaKind::Dimension => ColumnRole::Attribute,
                SchemaKind::Fact => ColumnRole::Metric,
            };
            let column = load_column(schema, raw_column, role)?;

            if !names.insert(column.name.clone()) {
                return Err(SchemaError::DuplicateColumn {
                    schema: schema.to_string(),
                    column: column.name,
                });
            }
            columns.push(column);
        }

        match kind {
            SchemaKind::Dimension => {
                if natural_key.is_empty() {
                    return Err(SchemaError::MissingNaturalKey {
                        schema: schema.to_string(),
                    });
                }
                for key in &natural_key {
                    if !names.contains(key) {
                        return Err(SchemaError::UnknownKeyColumn {
                            schema: schema.to_string(),
                            column: key.clone(),
                        });
                    }
                }
            }
            SchemaKind::Fact => {
                if raw.source.is_none() {
                    return Err(SchemaError::MissingSource {
                        schema: schema.to_string(),
                    });
                }
            }
        }

        let mut references = Vec::with_capacity(raw.dimensions.len());
        let mut reference_names = BTreeSet::new();

        for raw_reference in &raw.dimensions {
            let reference = self.load_reference(schema, raw_reference)?;

            if !reference_names.insert(reference.name.clone()) {
                return Err(SchemaError::DuplicateReference {
                    schema: schema.to_string(),
                    reference: reference.name,
                });
            }
            if raw.columns.iter().any(|c| c.name == reference.column) {
                return Err(SchemaError::ReferenceColumnConflict {
                    schema: schema.to_string(),
                    column: reference.column,
                });
            }
            if !names.insert(reference.column.clone()) {
                return Err(SchemaError::DuplicateColumn {
                    schema: schema.to_string(),
                    column: reference.column,
                });
            }

            // Surrogate keys are warehouse-assigned BIGINTs
            columns.push(Column::new(
                reference.column.clone(),
                LogicalType::Int,
                ColumnRole::DimensionKey,
            ));
            references.push(reference);
        }

        let unique_key = match kind {
            SchemaKind::Dimension => natural_key,
            SchemaKind::Fact => {
                for key in &raw.unique_key {
                    if !names.contains(key) {
                        return Err(SchemaError::UnknownKeyColumn {
                            schema: schema.to_string(),
                            column: key.clone(),
                        });
                    }
                }
                raw.unique_key.clone()
            }
        };

        Ok(SchemaDefinition {
            name: raw.name.clone(),
            kind,
            columns,
            unique_key,
            source: raw.source.clone(),
            expansions: raw.expansions.clone(),
            references,
            on_duplicate: raw.on_duplicate,
            hooks: raw.hooks.clone(),
        })
    }

    fn load_reference(
        &self,
        schema: &str,
        raw: &RawReference,
    ) -> Result<DimensionReference, SchemaError> {
        let name = raw.reference_name().to_string();
        check_identifier(schema, &name)?;

        let column = raw.column.clone().unwrap_or_else(|| name.clone());
        check_column_name(schema, &column)?;

        let target = match self.index.get(raw.dimension.as_str()) {
            Some((SchemaKind::Dimension, target)) => *target,
            Some((SchemaKind::Fact, _)) => {
                return Err(SchemaError::ReferenceToFact {
                    schema: schema.to_string(),
                    reference: name,
                    target: raw.dimension.clone(),
                })
            }
            None => {
                return Err(SchemaError::UnknownDimension {
                    schema: schema.to_string(),
                    reference: name,
                    dimension: raw.dimension.clone(),
                })
            }
        };

        // natural key column -> source field
        let mut fields: BTreeMap<String, String> = raw.fields.clone();
        if fields.is_empty() {
            match &raw.field {
                Some(field) => {
                    if let Some(first) = target.natural_key.first() {
                        fields.insert(first.clone(), field.clone());
                    }
                }
                None => {
                    for key in &target.natural_key {
                        fields.insert(key.clone(), key.clone());
                    }
                }
            }
        }

        for column in fields.keys() {
            if !target.natural_key.contains(column) {
                return Err(SchemaError::InvalidMapping {
                    schema: schema.to_string(),
                    reference: name,
                    column: column.clone(),
                });
            }
        }

        let mut mapping = Vec::with_capacity(target.natural_key.len());
        for key in &target.natural_key {
            match fields.get(key) {
                Some(field) => mapping.push(KeyMapping {
                    natural_key: key.clone(),
                    field: field.clone(),
                }),
                None => {
                    return Err(SchemaError::IncompleteMapping {
                        schema: schema.to_string(),
                        reference: name,
                        column: key.clone(),
                    })
                }
            }
        }

        Ok(DimensionReference {
            name,
            dimension: raw.dimension.clone(),
            column,
            mapping,
        })
    }
}

fn check_identifier(schema: &str, name: &str) -> Result<(), SchemaError> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(SchemaError::InvalidIdentifier {
            schema: schema.to_string(),
            name: name.to_string(),
        })
    }
}

/// Identifier usable as a table column
fn check_column_name(schema: &str, name: &str) -> Result<(), SchemaError> {
    check_identifier(schema, name)?;
    if name.eq_ignore_ascii_case(SURROGATE_KEY) {
        return Err(SchemaError::ReservedColumn {
            schema: schema.to_string(),
            column: name.to_string(),
        });
    }
    Ok(())
}

fn load_column(schema: &str, raw: &RawColumn, role: ColumnRole) -> Result<Column, SchemaError> {
    check_column_name(schema, &raw.name)?;

    let logical_type =
        LogicalType::parse(&raw.data_type).ok_or_else(|| SchemaError::UnknownType {
            schema: schema.to_string(),
            column: raw.name.clone(),
            declared: raw.data_type.clone(),
        })?;

    if role == ColumnRole::NaturalKey && raw.nullable {
        return Err(SchemaError::NullableNaturalKey {
            schema: schema.to_string(),
            column: raw.name.clone(),
        });
    }

    let mut column = Column::new(raw.name.clone(), logical_type, role).with_nullable(raw.nullable);

    if let Some(default) = &raw.default {
        let value = Value::from_json(default)
            .coerce(&column.logical_type)
            .map_err(|message| SchemaError::InvalidDefault {
                schema: schema.to_string(),
                column: raw.name.clone(),
                message,
            })?;
        if !value.is_null() {
            column = column.with_default(value);
        }
    }

    Ok(column)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(toml: &str) -> Result<Vec<SchemaDefinition>, SchemaError> {
        let file = DefinitionFile::from_toml(toml).unwrap();
        SchemaLoader::new(&file)?.load_all()
    }

    const STORE: &str = r#"
[[dimension]]
name = "dim_store"
natural_key = ["store_code"]
columns = [
  { name = "store_code", type = "varchar" },
  { name = "name", type = "varchar", nullable = true },
]
"#;

    #[test]
    fn normalizes_dimension_and_fact() {
        let schemas = load(&format!(
            "{}{}",
            STORE,
            r#"
[[fact]]
name = "fact_sales"
unique_key = ["store"]
source = { type = "inline", rows = [] }
columns = [ { name = "amount", type = "decimal(12,2)", default = 0 } ]

[[fact.dimensions]]
name = "store"
dimension = "dim_store"
field = "shop"
"#
        ))
        .unwrap();

        let store = schemas.iter().find(|s| s.name == "dim_store").unwrap();
        assert_eq!(store.natural_key_names(), vec!["store_code"]);
        assert_eq!(store.find_column("name").unwrap().role, ColumnRole::Attribute);

        let sales = schemas.iter().find(|s| s.name == "fact_sales").unwrap();
        let key_column = sales.find_column("store").unwrap();
        assert_eq!(key_column.role, ColumnRole::DimensionKey);
        assert!(!key_column.nullable);
        assert_eq!(
            sales.references[0].mapping,
            vec![KeyMapping { natural_key: "store_code".into(), field: "shop".into() }]
        );
        assert_eq!(
            sales.find_column("amount").unwrap().default,
            Some(Value::Decimal(stellate_core::Decimal::ZERO))
        );
    }

    #[test]
    fn duplicate_column_rejected() {
        let err = load(
            r#"
[[dimension]]
name = "dim_store"
natural_key = ["code"]
columns = [ { name = "code", type = "varchar" }, { name = "code", type = "int" } ]
"#,
        )
        .unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateColumn { ref column, .. } if column == "code"));
    }

    #[test]
    fn surrogate_key_column_is_reserved() {
        let err = load(
            r#"
[[dimension]]
name = "dim_customer"
natural_key = ["id"]
columns = [ { name = "id", type = "integer" } ]
"#,
        )
        .unwrap_err();
        assert_eq!(
            err,
            SchemaError::ReservedColumn {
                schema: "dim_customer".into(),
                column: "id".into(),
            }
        );

        let err = load(&format!(
            "{}{}",
            STORE,
            r#"
[[fact]]
name = "fact_sales"
source = { type = "inline", rows = [] }
columns = [ { name = "amount", type = "integer" } ]

[[fact.dimensions]]
name = "store"
dimension = "dim_store"
column = "ID"
"#
        ))
        .unwrap_err();
        assert!(matches!(err, SchemaError::ReservedColumn { ref column, .. } if column == "ID"));
    }

    #[test]
    fn missing_key_column_rejected() {
        let err = load(
            r#"
[[dimension]]
name = "dim_store"
natural_key = ["code"]
columns = [ { name = "name", type = "varchar" } ]
"#,
        )
        .unwrap_err();
        assert!(matches!(err, SchemaError::UnknownKeyColumn { .. }));
    }

    #[test]
    fn unknown_dimension_rejected() {
        let err = load(
            r#"
[[fact]]
name = "fact_sales"
source = { type = "inline", rows = [] }
columns = [ { name = "amount", type = "int" } ]

[[fact.dimensions]]
dimension = "dim_missing"
"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            SchemaError::UnknownDimension { ref dimension, .. } if dimension == "dim_missing"
        ));
    }

    #[test]
    fn nullable_natural_key_rejected() {
        let err = load(
            r#"
[[dimension]]
name = "dim_store"
natural_key = ["code"]
columns = [ { name = "code", type = "varchar", nullable = true } ]
"#,
        )
        .unwrap_err();
        assert!(matches!(err, SchemaError::NullableNaturalKey { .. }));
    }

    #[test]
    fn incomplete_and_invalid_mappings_rejected() {
        let dims = r#"
[[dimension]]
name = "dim_product"
natural_key = ["sku", "region"]
columns = [ { name = "sku", type = "varchar" }, { name = "region", type = "varchar" } ]
"#;
        let incomplete = load(&format!(
            "{}{}",
            dims,
            r#"
[[fact]]
name = "fact_orders"
source = { type = "inline", rows = [] }

[[fact.dimensions]]
dimension = "dim_product"
field = "sku"
"#
        ))
        .unwrap_err();
        assert!(matches!(
            incomplete,
            SchemaError::IncompleteMapping { ref column, .. } if column == "region"
        ));

        let invalid = load(&format!(
            "{}{}",
            dims,
            r#"
[[fact]]
name = "fact_orders"
source = { type = "inline", rows = [] }

[[fact.dimensions]]
dimension = "dim_product"
fields = { sku = "sku", region = "region", colour = "colour" }
"#
        ))
        .unwrap_err();
        assert!(matches!(invalid, SchemaError::InvalidMapping { ref column, .. } if column == "colour"));
    }

    #[test]
    fn reference_to_fact_and_duplicates_rejected() {
        let err = load(
            r#"
[[fact]]
name = "fact_a"
source = { type = "inline", rows = [] }

[[fact]]
name = "fact_b"
source = { type = "inline", rows = [] }

[[fact.dimensions]]
dimension = "fact_a"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, SchemaError::ReferenceToFact { .. }));

        let err = load(&format!("{}{}", STORE, STORE)).unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateSchema { .. }));
    }

    #[test]
    fn invalid_identifier_and_type_rejected() {
        let err = load(
            r#"
[[dimension]]
name = "dim store"
natural_key = ["code"]
columns = [ { name = "code", type = "varchar" } ]
"#,
        )
        .unwrap_err();
        assert!(matches!(err, SchemaError::InvalidIdentifier { .. }));

        let err = load(
            r#"
[[dimension]]
name = "dim_store"
natural_key = ["code"]
columns = [ { name = "code", type = "geometry" } ]
"#,
        )
        .unwrap_err();
        assert!(matches!(err, SchemaError::UnknownType { ref declared, .. } if declared == "geometry"));
    }

    #[test]
    fn bad_default_rejected() {
        let err = load(
            r#"
[[fact]]
name = "fact_sales"
source = { type = "inline", rows = [] }
columns = [ { name = "qty", type = "int", default = "many" } ]
"#,
        )
        .unwrap_err();
        assert!(matches!(err, SchemaError::InvalidDefault { .. }));
    }

    #[test]
    fn fact_without_source_rejected() {
        let err = load(
            r#"
[[fact]]
name = "fact_sales"
columns = [ { name = "qty", type = "int" } ]
"#,
        )
        .unwrap_err();
        assert!(matches!(err, SchemaError::MissingSource { .. }));
    }
}
