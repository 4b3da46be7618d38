//! Dimension resolution
//!
//! Resolution runs in two phases over a schema's dimension closure.
//!
//! **Planning** is pure. Schemas are visited dependents first; every row of
//! a schema proposes a candidate row for each dimension it references. A
//! dimension keeps its own source rows first, then candidates in the order
//! they were seen. The first row seen for a natural key wins.
//!
//! **Execution** visits dimensions dependencies first. Each dimension's
//! references are rewritten to surrogate keys, then every distinct natural
//! key is looked up (run cache, then warehouse) and inserted when absent.
//! An insert that loses a race against a concurrent writer re-reads the key.

use std::collections::{BTreeMap, HashMap, HashSet};

use stellate_core::{
    ColumnRole, DimensionReference, DimensionStats, KeyTuple, LoadError, ResolutionError, Row,
    RowBuffer, SchemaDefinition, SchemaError, Value,
};
use stellate_warehouse::{TableSpec, Warehouse};

use crate::error::{load_error, RunError};
use crate::loader::project_row;

/// Natural key → surrogate key, per dimension, for one run
#[derive(Debug, Default)]
pub struct SurrogateKeyCache {
    keys: HashMap<String, HashMap<KeyTuple, i64>>,
    stats: BTreeMap<String, DimensionStats>,
}

impl SurrogateKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached surrogate key, counting the hit
    pub fn lookup(&mut self, dimension: &str, key: &KeyTuple) -> Option<i64> {
        let id = self.keys.get(dimension).and_then(|keys| keys.get(key)).copied();
        if id.is_some() {
            self.stats_mut(dimension).cache_hits += 1;
        }
        id
    }

    pub fn insert(&mut self, dimension: &str, key: KeyTuple, id: i64) {
        self.keys
            .entry(dimension.to_string())
            .or_default()
            .insert(key, id);
    }

    /// Number of cached keys of a dimension
    pub fn len(&self, dimension: &str) -> usize {
        self.keys.get(dimension).map_or(0, HashMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.keys.values().all(HashMap::is_empty)
    }

    /// Counters of a dimension
    pub fn stats_mut(&mut self, dimension: &str) -> &mut DimensionStats {
        self.stats
            .entry(dimension.to_string())
            .or_insert_with(|| DimensionStats {
                dimension: dimension.to_string(),
                ..Default::default()
            })
    }

    /// Counters of every dimension touched, sorted by name
    pub fn stats(&self) -> Vec<DimensionStats> {
        self.stats.values().cloned().collect()
    }
}

/// Natural key of a dimension's own row
fn natural_key(schema: &SchemaDefinition, row: &Row, index: usize) -> Result<KeyTuple, ResolutionError> {
    schema
        .natural_key()
        .into_iter()
        .map(|column| {
            key_value(
                schema,
                schema,
                row.get(&column.name),
                &column.name,
                column,
                index,
            )
        })
        .collect::<Result<Vec<_>, _>>()
        .map(KeyTuple)
}

/// Key a referencing row maps to in `dimension`
fn reference_key(
    schema: &SchemaDefinition,
    reference: &DimensionReference,
    dimension: &SchemaDefinition,
    row: &Row,
    index: usize,
) -> Result<KeyTuple, ResolutionError> {
    dimension
        .natural_key()
        .into_iter()
        .map(|column| {
            let field = reference
                .mapping
                .iter()
                .find(|m| m.natural_key == column.name)
                .map_or(column.name.as_str(), |m| m.field.as_str());
            key_value(schema, dimension, row.get(field), field, column, index)
        })
        .collect::<Result<Vec<_>, _>>()
        .map(KeyTuple)
}

fn key_value(
    schema: &SchemaDefinition,
    dimension: &SchemaDefinition,
    value: Option<&Value>,
    field: &str,
    column: &stellate_core::Column,
    index: usize,
) -> Result<Value, ResolutionError> {
    let value = value.filter(|v| !v.is_null()).ok_or_else(|| ResolutionError::NullNaturalKey {
        schema: schema.name.clone(),
        dimension: dimension.name.clone(),
        row: index,
        field: field.to_string(),
    })?;

    value
        .coerce(&column.logical_type)
        .map_err(|message| ResolutionError::InvalidKeyValue {
            schema: schema.name.clone(),
            dimension: dimension.name.clone(),
            row: index,
            field: field.to_string(),
            message,
        })
}

/// Dimension row proposed by a referencing row
fn candidate_row(
    reference: &DimensionReference,
    dimension: &SchemaDefinition,
    key: &KeyTuple,
    context: &Row,
) -> Row {
    let mut row: Row = dimension
        .natural_key_names()
        .into_iter()
        .zip(key.values().iter().cloned())
        .collect();

    for column in dimension
        .columns
        .iter()
        .filter(|c| c.role == ColumnRole::Attribute)
    {
        if let Some(value) = context.get(&column.name) {
            row.insert(column.name.clone(), value.clone());
        }
    }

    // Fields the dimension needs to resolve its own references
    for field in dimension.references.iter().flat_map(|r| r.fields()) {
        if let Some(value) = context.get(field) {
            row.entry(field.to_string()).or_insert_with(|| value.clone());
        }
    }

    tracing::trace!(reference = %reference.name, dimension = %dimension.name, key = %key, "Candidate dimension row");
    row
}

fn check_attributes(schema: &SchemaDefinition, rows: &[Row]) -> Result<(), ResolutionError> {
    let required: Vec<_> = schema
        .columns
        .iter()
        .filter(|c| c.role == ColumnRole::Attribute && !c.nullable && c.default.is_none())
        .collect();

    for (index, row) in rows.iter().enumerate() {
        for column in &required {
            if row.get(&column.name).map_or(true, Value::is_null) {
                return Err(ResolutionError::MissingAttribute {
                    dimension: schema.name.clone(),
                    column: column.name.clone(),
                    key: natural_key(schema, row, index)?.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Rows to resolve for a schema and its dimension closure
pub struct ResolutionPlan<'a> {
    order: Vec<&'a SchemaDefinition>,
    schemas: HashMap<String, &'a SchemaDefinition>,
    pending: HashMap<String, Vec<Row>>,
    extracted: HashMap<String, usize>,
}

impl<'a> ResolutionPlan<'a> {
    /// Build the plan
    ///
    /// `order` is the closure in dependency order with the target last;
    /// `buffers` holds the expanded rows of each schema that has a source.
    pub fn build(
        order: Vec<&'a SchemaDefinition>,
        mut buffers: HashMap<String, RowBuffer>,
    ) -> Result<Self, RunError> {
        let schemas: HashMap<String, &'a SchemaDefinition> =
            order.iter().map(|s| (s.name.clone(), *s)).collect();
        let mut pending: HashMap<String, Vec<Row>> = HashMap::new();
        let mut seen: HashMap<String, HashSet<KeyTuple>> = HashMap::new();
        let mut extracted = HashMap::new();

        // Own rows come first
        for schema in &order {
            let rows = buffers
                .remove(&schema.name)
                .map(RowBuffer::into_rows)
                .unwrap_or_default();
            extracted.insert(schema.name.clone(), rows.len());

            let rows = if schema.is_dimension() {
                let keys = seen.entry(schema.name.clone()).or_default();
                let mut kept = Vec::with_capacity(rows.len());
                for (index, row) in rows.into_iter().enumerate() {
                    if keys.insert(natural_key(schema, &row, index)?) {
                        kept.push(row);
                    }
                }
                kept
            } else {
                rows
            };
            pending.insert(schema.name.clone(), rows);
        }

        // Dependents first: a dimension has all its candidates once visited
        for schema in order.iter().rev() {
            let rows = pending.remove(&schema.name).unwrap_or_default();
            if schema.is_dimension() {
                check_attributes(schema, &rows)?;
            }

            for reference in &schema.references {
                let dimension = schemas.get(&reference.dimension).copied().ok_or_else(|| {
                    SchemaError::UnknownSchema {
                        name: reference.dimension.clone(),
                    }
                })?;
                let keys = seen.entry(dimension.name.clone()).or_default();

                let mut candidates = Vec::new();
                for (index, row) in rows.iter().enumerate() {
                    let key = reference_key(schema, reference, dimension, row, index)?;
                    if !keys.contains(&key) {
                        candidates.push(candidate_row(reference, dimension, &key, row));
                        keys.insert(key);
                    }
                }

                if !candidates.is_empty() {
                    tracing::debug!(
                        schema = %schema.name,
                        dimension = %dimension.name,
                        candidates = candidates.len(),
                        "Planned dimension rows"
                    );
                }
                pending
                    .entry(dimension.name.clone())
                    .or_default()
                    .extend(candidates);
            }

            pending.insert(schema.name.clone(), rows);
        }

        Ok(Self {
            order,
            schemas,
            pending,
            extracted,
        })
    }

    /// Rows pending for a schema (deduplicated for dimensions)
    pub fn pending(&self, name: &str) -> &[Row] {
        self.pending.get(name).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Executes resolution plans against a warehouse
pub struct Resolver<'a> {
    warehouse: &'a dyn Warehouse,
    conflict_retries: u32,
}

impl<'a> Resolver<'a> {
    pub fn new(warehouse: &'a dyn Warehouse, conflict_retries: u32) -> Self {
        Self {
            warehouse,
            conflict_retries,
        }
    }

    /// Load every dimension of the plan and return the target's rows with
    /// references rewritten to surrogate keys
    pub async fn execute(
        &self,
        plan: ResolutionPlan<'_>,
        cache: &mut SurrogateKeyCache,
    ) -> Result<RowBuffer, RunError> {
        let ResolutionPlan {
            order,
            schemas,
            mut pending,
            extracted,
        } = plan;

        let mut target = Vec::new();
        for schema in order {
            let mut rows = pending.remove(&schema.name).unwrap_or_default();
            rewrite_references(schema, &schemas, &mut rows, cache)?;

            if schema.is_dimension() {
                cache.stats_mut(&schema.name).extracted =
                    extracted.get(&schema.name).copied().unwrap_or_default();
                self.load_dimension(schema, &rows, cache).await?;
            }
            target = rows;
        }

        Ok(RowBuffer::from_rows(target))
    }

    async fn load_dimension(
        &self,
        schema: &SchemaDefinition,
        rows: &[Row],
        cache: &mut SurrogateKeyCache,
    ) -> Result<(), RunError> {
        let table = TableSpec::from_definition(schema);
        cache.stats_mut(&schema.name).keys += rows.len();

        for (index, row) in rows.iter().enumerate() {
            let key = natural_key(schema, row, index)?;
            if cache.lookup(&schema.name, &key).is_some() {
                continue;
            }

            let id = self.lookup_or_insert(schema, &table, &key, row, index, cache).await?;
            cache.insert(&schema.name, key, id);
        }

        let stats = cache.stats_mut(&schema.name);
        tracing::info!(
            dimension = %schema.name,
            keys = stats.keys,
            inserted = stats.inserted,
            "Resolved dimension"
        );
        Ok(())
    }

    async fn lookup_or_insert(
        &self,
        schema: &SchemaDefinition,
        table: &TableSpec,
        key: &KeyTuple,
        row: &Row,
        index: usize,
        cache: &mut SurrogateKeyCache,
    ) -> Result<i64, RunError> {
        cache.stats_mut(&schema.name).lookups += 1;
        if let Some(id) = self.find_key(table, key).await? {
            tracing::debug!(dimension = %schema.name, key = %key, id, "Found existing dimension row");
            return Ok(id);
        }

        let projected = project_row(schema, row, index)?;
        match self.warehouse.insert_returning_key(table, &projected).await {
            Ok(id) => {
                cache.stats_mut(&schema.name).inserted += 1;
                tracing::debug!(dimension = %schema.name, key = %key, id, "Inserted dimension row");
                Ok(id)
            }
            Err(e) if e.is_unique_violation() => {
                // Another writer committed the key first; read theirs
                for attempt in 1..=self.conflict_retries {
                    cache.stats_mut(&schema.name).conflict_retries += 1;
                    tracing::warn!(
                        dimension = %schema.name,
                        key = %key,
                        attempt,
                        "Insert conflict, re-reading surrogate key"
                    );
                    if let Some(id) = self.find_key(table, key).await? {
                        return Ok(id);
                    }
                }
                Err(LoadError::ConflictRetriesExhausted {
                    table: table.name.clone(),
                    key: key.to_string(),
                    attempts: self.conflict_retries,
                }
                .into())
            }
            Err(e) => Err(load_error(&table.name, e).into()),
        }
    }

    async fn find_key(&self, table: &TableSpec, key: &KeyTuple) -> Result<Option<i64>, LoadError> {
        self.warehouse
            .find_key(table, key)
            .await
            .map_err(|e| load_error(&table.name, e))
    }
}

/// Replace each reference's mapping fields with the surrogate key
fn rewrite_references(
    schema: &SchemaDefinition,
    schemas: &HashMap<String, &SchemaDefinition>,
    rows: &mut [Row],
    cache: &mut SurrogateKeyCache,
) -> Result<(), RunError> {
    if schema.references.is_empty() {
        return Ok(());
    }

    for (index, row) in rows.iter_mut().enumerate() {
        let mut resolved = Vec::with_capacity(schema.references.len());
        for reference in &schema.references {
            let dimension = schemas.get(&reference.dimension).copied().ok_or_else(|| {
                SchemaError::UnknownSchema {
                    name: reference.dimension.clone(),
                }
            })?;
            let key = reference_key(schema, reference, dimension, row, index)?;
            let id = cache.lookup(&dimension.name, &key).ok_or_else(|| {
                ResolutionError::Unresolved {
                    dimension: dimension.name.clone(),
                    key: key.to_string(),
                }
            })?;
            resolved.push((reference, id));
        }

        for (reference, id) in resolved {
            for field in reference.fields() {
                if field != reference.column && schema.find_column(field).is_none() {
                    row.remove(field);
                }
            }
            row.insert(reference.column.clone(), Value::Int(id));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stellate_core::{row, Column, KeyMapping, LogicalType, SchemaKind};
    use stellate_warehouse::MemoryWarehouse;

    fn dimension(name: &str, key: &str, attributes: &[&str]) -> SchemaDefinition {
        let mut columns = vec![Column::new(key, LogicalType::String, ColumnRole::NaturalKey)];
        columns.extend(attributes.iter().map(|a| {
            Column::new(*a, LogicalType::String, ColumnRole::Attribute).with_nullable(true)
        }));
        SchemaDefinition {
            name: name.into(),
            kind: SchemaKind::Dimension,
            columns,
            unique_key: vec![key.into()],
            source: None,
            expansions: vec![],
            references: vec![],
            on_duplicate: Default::default(),
            hooks: Default::default(),
        }
    }

    fn reference(name: &str, dimension: &str, natural_key: &str, field: &str) -> DimensionReference {
        DimensionReference {
            name: name.into(),
            dimension: dimension.into(),
            column: name.into(),
            mapping: vec![KeyMapping {
                natural_key: natural_key.into(),
                field: field.into(),
            }],
        }
    }

    fn with_reference(mut schema: SchemaDefinition, reference: DimensionReference) -> SchemaDefinition {
        schema.columns.push(Column::new(
            reference.column.clone(),
            LogicalType::Int,
            ColumnRole::DimensionKey,
        ));
        schema.references.push(reference);
        schema
    }

    fn fact_visits() -> SchemaDefinition {
        let fact = SchemaDefinition {
            name: "fact_visits".into(),
            kind: SchemaKind::Fact,
            columns: vec![],
            unique_key: vec![],
            source: None,
            expansions: vec![],
            references: vec![],
            on_duplicate: Default::default(),
            hooks: Default::default(),
        };
        with_reference(fact, reference("store", "dim_store", "store_code", "store_code"))
    }

    #[test]
    fn planning_first_seen_wins() {
        let store = dimension("dim_store", "store_code", &["name"]);
        let fact = fact_visits();

        let buffers = HashMap::from([(
            "fact_visits".to_string(),
            RowBuffer::from_rows(vec![
                row([("store_code", "S1"), ("name", "Alpha")]),
                row([("store_code", "S1"), ("name", "Beta")]),
                row([("store_code", "S2"), ("name", "Gamma")]),
            ]),
        )]);

        let plan = ResolutionPlan::build(vec![&store, &fact], buffers).unwrap();
        let pending = plan.pending("dim_store");
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].get("name"), Some(&Value::from("Alpha")));
    }

    #[test]
    fn own_rows_take_precedence() {
        let store = dimension("dim_store", "store_code", &["name"]);
        let fact = fact_visits();

        let buffers = HashMap::from([
            (
                "dim_store".to_string(),
                RowBuffer::from_rows(vec![row([("store_code", "S1"), ("name", "Official")])]),
            ),
            (
                "fact_visits".to_string(),
                RowBuffer::from_rows(vec![row([("store_code", "S1"), ("name", "Alias")])]),
            ),
        ]);

        let plan = ResolutionPlan::build(vec![&store, &fact], buffers).unwrap();
        assert_eq!(plan.pending("dim_store").len(), 1);
        assert_eq!(
            plan.pending("dim_store")[0].get("name"),
            Some(&Value::from("Official"))
        );
    }

    #[test]
    fn null_natural_key() {
        let store = dimension("dim_store", "store_code", &[]);
        let fact = fact_visits();
        let buffers = HashMap::from([(
            "fact_visits".to_string(),
            RowBuffer::from_rows(vec![
                row([("store_code", "S1")]),
                row([("store_code", Value::Null)]),
            ]),
        )]);

        let err = ResolutionPlan::build(vec![&store, &fact], buffers).err().unwrap();
        assert_eq!(
            err,
            RunError::Resolution(ResolutionError::NullNaturalKey {
                schema: "fact_visits".into(),
                dimension: "dim_store".into(),
                row: 1,
                field: "store_code".into(),
            })
        );
    }

    #[test]
    fn missing_required_attribute() {
        let mut store = dimension("dim_store", "store_code", &[]);
        store
            .columns
            .push(Column::new("name", LogicalType::String, ColumnRole::Attribute));
        let fact = fact_visits();
        let buffers = HashMap::from([(
            "fact_visits".to_string(),
            RowBuffer::from_rows(vec![row([("store_code", "S1")])]),
        )]);

        let err = ResolutionPlan::build(vec![&store, &fact], buffers).err().unwrap();
        assert!(matches!(
            err,
            RunError::Resolution(ResolutionError::MissingAttribute { .. })
        ));
    }

    #[tokio::test]
    async fn dimension_of_dimension() {
        let region = dimension("dim_region", "region_code", &[]);
        let store = with_reference(
            dimension("dim_store", "store_code", &[]),
            reference("region", "dim_region", "region_code", "region_code"),
        );
        let fact = fact_visits();

        let buffers = HashMap::from([(
            "fact_visits".to_string(),
            RowBuffer::from_rows(vec![
                row([("store_code", "S1"), ("region_code", "N")]),
                row([("store_code", "S2"), ("region_code", "N")]),
                row([("store_code", "S1"), ("region_code", "N")]),
            ]),
        )]);

        let warehouse = MemoryWarehouse::new();
        for schema in [&region, &store, &fact] {
            warehouse
                .create_table(&TableSpec::from_definition(schema))
                .await
                .unwrap();
        }

        let plan = ResolutionPlan::build(vec![&region, &store, &fact], buffers).unwrap();
        let mut cache = SurrogateKeyCache::new();
        let rows = Resolver::new(&warehouse, 3)
            .execute(plan, &mut cache)
            .await
            .unwrap();

        assert_eq!(warehouse.row_count("dim_region").await.unwrap(), 1);
        assert_eq!(warehouse.row_count("dim_store").await.unwrap(), 2);

        let stores = warehouse.fetch_rows("dim_store").await.unwrap();
        assert!(stores.iter().all(|s| s.get("region") == Some(&Value::Int(1))));

        assert_eq!(rows.len(), 3);
        assert_eq!(rows.rows()[0].get("store"), rows.rows()[2].get("store"));
        assert!(!rows.rows()[0].contains_key("store_code"));

        let stats = cache.stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[1].dimension, "dim_store");
        assert_eq!(stats[1].inserted, 2);
    }

    #[tokio::test]
    async fn conflict_is_retried() {
        let store = dimension("dim_store", "store_code", &[]);
        let fact = fact_visits();
        let warehouse = MemoryWarehouse::new();
        warehouse
            .create_table(&TableSpec::from_definition(&store))
            .await
            .unwrap();
        warehouse
            .simulate_concurrent_insert("dim_store", row([("store_code", "S1")]))
            .await;

        let buffers = HashMap::from([(
            "fact_visits".to_string(),
            RowBuffer::from_rows(vec![row([("store_code", "S1")])]),
        )]);
        let plan = ResolutionPlan::build(vec![&store, &fact], buffers).unwrap();
        let mut cache = SurrogateKeyCache::new();
        Resolver::new(&warehouse, 3)
            .execute(plan, &mut cache)
            .await
            .unwrap();

        let stats = cache.stats();
        assert_eq!(stats[0].inserted, 0);
        assert_eq!(stats[0].conflict_retries, 1);
        assert_eq!(warehouse.row_count("dim_store").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn conflict_retries_exhausted() {
        let store = dimension("dim_store", "store_code", &[]);
        let fact = fact_visits();
        let warehouse = MemoryWarehouse::new();
        warehouse
            .create_table(&TableSpec::from_definition(&store))
            .await
            .unwrap();
        warehouse.add_phantom_conflict("dim_store").await;

        let buffers = HashMap::from([(
            "fact_visits".to_string(),
            RowBuffer::from_rows(vec![row([("store_code", "S1")])]),
        )]);
        let plan = ResolutionPlan::build(vec![&store, &fact], buffers).unwrap();
        let err = Resolver::new(&warehouse, 2)
            .execute(plan, &mut SurrogateKeyCache::new())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            RunError::Load(LoadError::ConflictRetriesExhausted {
                table: "dim_store".into(),
                key: "(S1)".into(),
                attempts: 2,
            })
        );
    }
}
