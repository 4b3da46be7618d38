//! In-memory warehouse and source connection
//!
//! Behaves like a small relational store: surrogate keys are assigned from
//! a sequence, unique and NOT NULL constraints are enforced, and batch
//! inserts are atomic. Useful for:
//! - Unit and integration testing of the engine
//! - Demos without a database
//! - Simulating failures and concurrent writers
//!
//! ## Simulating Failures
//!
//! ```rust,ignore
//! // Every operation on dim_store fails
//! warehouse.add_error_for_table("dim_store", WarehouseError::QueryError("boom".into())).await;
//!
//! // Another writer commits this row right before our next insert into dim_store
//! warehouse.simulate_concurrent_insert("dim_store", row([("store_code", "S1")])).await;
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use stellate_core::{KeyTuple, Row, Value, SURROGATE_KEY};

use crate::adapter::{
    ColumnSpec, Connection, ExistingColumn, OnConflict, QueryResult, TableSpec, Warehouse,
    WarehouseError,
};

#[derive(Debug, Clone)]
struct MemoryTable {
    spec: TableSpec,
    rows: Vec<Row>,
    next_id: i64,
}

impl MemoryTable {
    fn new(spec: TableSpec) -> Self {
        Self {
            spec,
            rows: Vec::new(),
            next_id: 1,
        }
    }

    /// Apply defaults, NOT NULL and types the way the database would
    fn prepare(&self, row: &Row) -> Result<Row, WarehouseError> {
        if let Some(unknown) = row.keys().find(|k| self.spec.column(k).is_none()) {
            return Err(WarehouseError::QueryError(format!(
                "column \"{}\" of relation \"{}\" does not exist",
                unknown, self.spec.name
            )));
        }

        let mut prepared = Row::new();
        for column in &self.spec.columns {
            let value = match row.get(&column.name) {
                Some(value) if !value.is_null() => value.coerce(&column.logical_type).map_err(|e| {
                    WarehouseError::TypeError(format!("{}.{}: {}", self.spec.name, column.name, e))
                })?,
                _ => column.default.clone().unwrap_or(Value::Null),
            };

            if value.is_null() && !column.nullable {
                return Err(WarehouseError::QueryError(format!(
                    "null value in column \"{}\" of relation \"{}\" violates not-null constraint",
                    column.name, self.spec.name
                )));
            }
            prepared.insert(column.name.clone(), value);
        }
        Ok(prepared)
    }

    /// Unique key of a row, or `None` if the constraint does not apply
    fn key(&self, row: &Row) -> Option<KeyTuple> {
        if self.spec.unique_key.is_empty() {
            return None;
        }
        let key = self.spec.key_of(row);
        // NULLs never collide under SQL semantics
        if key.values().iter().any(Value::is_null) {
            None
        } else {
            Some(key)
        }
    }

    fn conflicts(&self, row: &Row) -> Option<KeyTuple> {
        let key = self.key(row)?;
        self.rows
            .iter()
            .any(|existing| self.key(existing).as_ref() == Some(&key))
            .then_some(key)
    }

    fn push(&mut self, mut row: Row) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        row.insert(SURROGATE_KEY.to_string(), Value::Int(id));
        self.rows.push(row);
        id
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, MemoryTable>,
    views: BTreeMap<String, String>,
}

/// In-memory warehouse
///
/// Clones share the same state, so a clone can play the part of a second
/// concurrent writer.
///
/// # Example
///
/// ```rust,ignore
/// let warehouse = MemoryWarehouse::new()
///     .with_latency(5)              // 5ms simulated latency
///     .with_connection_failure();   // Fail connection tests
/// ```
#[derive(Clone)]
pub struct MemoryWarehouse {
    state: Arc<RwLock<MemoryState>>,

    /// Errors to return for specific tables
    errors: Arc<RwLock<HashMap<String, WarehouseError>>>,

    /// Rows another writer commits right before our next insert
    races: Arc<RwLock<HashMap<String, Vec<Row>>>>,

    /// Tables whose inserts always conflict while lookups keep missing
    phantom_conflicts: Arc<RwLock<HashSet<String>>>,

    /// Simulate connection failure
    fail_connection: bool,

    /// Simulate query latency (milliseconds)
    latency_ms: u64,

    /// Name to return from name() method
    warehouse_name: &'static str,
}

impl MemoryWarehouse {
    /// Create a new, empty warehouse
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(MemoryState::default())),
            errors: Arc::new(RwLock::new(HashMap::new())),
            races: Arc::new(RwLock::new(HashMap::new())),
            phantom_conflicts: Arc::new(RwLock::new(HashSet::new())),
            fail_connection: false,
            latency_ms: 0,
            warehouse_name: "Memory",
        }
    }

    /// Configure to fail all connection tests
    pub fn with_connection_failure(mut self) -> Self {
        self.fail_connection = true;
        self
    }

    /// Configure simulated latency for all operations
    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// Set a custom warehouse name
    pub fn with_name(mut self, name: &'static str) -> Self {
        self.warehouse_name = name;
        self
    }

    /// Configure an error to be returned for every operation on a table
    pub async fn add_error_for_table(&self, table: &str, error: WarehouseError) {
        self.errors.write().await.insert(table.to_string(), error);
    }

    /// Clear all configured errors
    pub async fn clear_errors(&self) {
        self.errors.write().await.clear();
    }

    /// Have another writer commit `row` just before our next insert
    ///
    /// Models two runs racing to create the same dimension row.
    pub async fn simulate_concurrent_insert(&self, table: &str, row: Row) {
        self.races
            .write()
            .await
            .entry(table.to_string())
            .or_default()
            .push(row);
    }

    /// Make every single-row insert into `table` conflict without the
    /// conflicting row ever becoming visible
    pub async fn add_phantom_conflict(&self, table: &str) {
        self.phantom_conflicts.write().await.insert(table.to_string());
    }

    /// Names of all tables
    pub async fn table_names(&self) -> Vec<String> {
        self.state.read().await.tables.keys().cloned().collect()
    }

    /// Check if a table exists
    pub async fn has_table(&self, table: &str) -> bool {
        self.state.read().await.tables.contains_key(table)
    }

    /// SQL text of a stored view
    pub async fn view_sql(&self, name: &str) -> Option<String> {
        self.state.read().await.views.get(name).cloned()
    }

    /// Simulate latency if configured
    async fn simulate_latency(&self) {
        if self.latency_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.latency_ms)).await;
        }
    }

    async fn check_error(&self, table: &str) -> Result<(), WarehouseError> {
        self.simulate_latency().await;
        match self.errors.read().await.get(table) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    async fn apply_races(&self, state: &mut MemoryState, table: &str) {
        let pending = self.races.write().await.remove(table).unwrap_or_default();
        if let Some(target) = state.tables.get_mut(table) {
            for row in pending {
                if let Ok(prepared) = target.prepare(&row) {
                    if target.conflicts(&prepared).is_none() {
                        target.push(prepared);
                    }
                }
            }
        }
    }
}

impl Default for MemoryWarehouse {
    fn default() -> Self {
        Self::new()
    }
}

fn table_not_found(table: &str) -> WarehouseError {
    WarehouseError::TableNotFound(table.to_string())
}

#[async_trait::async_trait]
impl Warehouse for MemoryWarehouse {
    fn name(&self) -> &'static str {
        self.warehouse_name
    }

    async fn test_connection(&self) -> Result<(), WarehouseError> {
        self.simulate_latency().await;

        if self.fail_connection {
            Err(WarehouseError::ConnectionError(
                "Simulated connection failure".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    async fn describe_table(
        &self,
        table: &str,
    ) -> Result<Option<Vec<ExistingColumn>>, WarehouseError> {
        self.check_error(table).await?;

        let state = self.state.read().await;
        Ok(state.tables.get(table).map(|t| {
            std::iter::once(ExistingColumn {
                name: SURROGATE_KEY.to_string(),
                logical_type: Some(stellate_core::LogicalType::Int),
                nullable: false,
            })
            .chain(t.spec.columns.iter().map(|c| ExistingColumn {
                name: c.name.clone(),
                logical_type: Some(c.logical_type.clone()),
                nullable: c.nullable,
            }))
            .collect()
        }))
    }

    async fn create_table(&self, table: &TableSpec) -> Result<(), WarehouseError> {
        self.check_error(&table.name).await?;

        let mut state = self.state.write().await;
        state
            .tables
            .entry(table.name.clone())
            .or_insert_with(|| MemoryTable::new(table.clone()));
        Ok(())
    }

    async fn add_column(&self, table: &str, column: &ColumnSpec) -> Result<(), WarehouseError> {
        self.check_error(table).await?;

        let mut state = self.state.write().await;
        let target = state.tables.get_mut(table).ok_or_else(|| table_not_found(table))?;
        if target.spec.column(&column.name).is_some() {
            return Ok(());
        }

        let mut column = column.clone();
        if column.default.is_none() {
            column.nullable = true;
        }
        let fill = column.default.clone().unwrap_or(Value::Null);
        for row in &mut target.rows {
            row.insert(column.name.clone(), fill.clone());
        }
        target.spec.columns.push(column);
        Ok(())
    }

    async fn unique_key(&self, table: &str) -> Result<Vec<String>, WarehouseError> {
        self.check_error(table).await?;

        let state = self.state.read().await;
        let target = state.tables.get(table).ok_or_else(|| table_not_found(table))?;
        Ok(target.spec.unique_key.clone())
    }

    async fn add_unique_key(&self, table: &TableSpec) -> Result<(), WarehouseError> {
        self.check_error(&table.name).await?;

        let mut state = self.state.write().await;
        let target = state
            .tables
            .get_mut(&table.name)
            .ok_or_else(|| table_not_found(&table.name))?;

        let mut seen = HashSet::new();
        for row in &target.rows {
            let key = table.key_of(row);
            if key.values().iter().any(Value::is_null) {
                continue;
            }
            if !seen.insert(key.clone()) {
                return Err(WarehouseError::UniqueViolation(
                    table.name.clone(),
                    key.to_string(),
                ));
            }
        }
        target.spec.unique_key = table.unique_key.clone();
        Ok(())
    }

    async fn replace_view(&self, name: &str, sql: &str) -> Result<(), WarehouseError> {
        self.check_error(name).await?;
        self.state
            .write()
            .await
            .views
            .insert(name.to_string(), sql.to_string());
        Ok(())
    }

    async fn find_key(
        &self,
        table: &TableSpec,
        key: &KeyTuple,
    ) -> Result<Option<i64>, WarehouseError> {
        self.check_error(&table.name).await?;

        let state = self.state.read().await;
        let target = state
            .tables
            .get(&table.name)
            .ok_or_else(|| table_not_found(&table.name))?;

        Ok(target
            .rows
            .iter()
            .find(|row| &target.spec.key_of(row) == key)
            .and_then(|row| match row.get(SURROGATE_KEY) {
                Some(Value::Int(id)) => Some(*id),
                _ => None,
            }))
    }

    async fn insert_returning_key(
        &self,
        table: &TableSpec,
        row: &Row,
    ) -> Result<i64, WarehouseError> {
        self.check_error(&table.name).await?;

        let mut state = self.state.write().await;
        self.apply_races(&mut state, &table.name).await;

        let target = state
            .tables
            .get_mut(&table.name)
            .ok_or_else(|| table_not_found(&table.name))?;
        let prepared = target.prepare(row)?;

        if self.phantom_conflicts.read().await.contains(&table.name) {
            let key = target.spec.key_of(&prepared);
            return Err(WarehouseError::UniqueViolation(table.name.clone(), key.to_string()));
        }
        if let Some(key) = target.conflicts(&prepared) {
            return Err(WarehouseError::UniqueViolation(table.name.clone(), key.to_string()));
        }

        Ok(target.push(prepared))
    }

    async fn insert_rows(
        &self,
        table: &TableSpec,
        rows: &[Row],
        on_conflict: OnConflict,
    ) -> Result<usize, WarehouseError> {
        self.check_error(&table.name).await?;

        let mut state = self.state.write().await;
        let target = state
            .tables
            .get_mut(&table.name)
            .ok_or_else(|| table_not_found(&table.name))?;

        let prepared = rows
            .iter()
            .map(|row| target.prepare(row))
            .collect::<Result<Vec<_>, _>>()?;

        // Work on a copy so a failure leaves the table untouched
        let mut staged = target.clone();
        let mut inserted = 0;
        for row in prepared {
            match staged.conflicts(&row) {
                None => {
                    staged.push(row);
                    inserted += 1;
                }
                Some(key) => match on_conflict {
                    OnConflict::Ignore => {}
                    OnConflict::Error => {
                        return Err(WarehouseError::UniqueViolation(
                            table.name.clone(),
                            key.to_string(),
                        ))
                    }
                },
            }
        }

        *target = staged;
        Ok(inserted)
    }

    async fn row_count(&self, table: &str) -> Result<usize, WarehouseError> {
        self.check_error(table).await?;

        let state = self.state.read().await;
        state
            .tables
            .get(table)
            .map(|t| t.rows.len())
            .ok_or_else(|| table_not_found(table))
    }

    async fn fetch_rows(&self, table: &str) -> Result<Vec<Row>, WarehouseError> {
        self.check_error(table).await?;

        let state = self.state.read().await;
        state
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .ok_or_else(|| table_not_found(table))
    }
}

/// In-memory source database answering predefined queries
///
/// # Example
///
/// ```rust,ignore
/// let shop = MemoryConnection::new("shop")
///     .with_result("SELECT * FROM sales", vec![row([("store_code", "S1")])]);
/// ```
#[derive(Clone)]
pub struct MemoryConnection {
    name: String,
    results: Arc<RwLock<HashMap<String, QueryResult>>>,
    fail: bool,
}

impl MemoryConnection {
    /// Create a connection with no predefined queries
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            results: Arc::new(RwLock::new(HashMap::new())),
            fail: false,
        }
    }

    /// Predefine the rows returned for a query
    pub fn with_result(self, sql: &str, rows: Vec<Row>) -> Self {
        if let Ok(mut results) = self.results.try_write() {
            results.insert(normalize_sql(sql), query_result(rows));
        }
        self
    }

    /// Predefine the rows returned for a query
    pub async fn add_result(&self, sql: &str, rows: Vec<Row>) {
        self.results
            .write()
            .await
            .insert(normalize_sql(sql), query_result(rows));
    }

    /// Make every query fail
    pub fn with_failure(mut self) -> Self {
        self.fail = true;
        self
    }
}

fn normalize_sql(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn query_result(rows: Vec<Row>) -> QueryResult {
    let mut columns: Vec<String> = rows.iter().flat_map(|r| r.keys().cloned()).collect();
    columns.sort();
    columns.dedup();
    QueryResult { columns, rows }
}

#[async_trait::async_trait]
impl Connection for MemoryConnection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn query(&self, sql: &str) -> Result<QueryResult, WarehouseError> {
        if self.fail {
            return Err(WarehouseError::ConnectionError(format!(
                "Simulated failure on {}",
                self.name
            )));
        }

        self.results
            .read()
            .await
            .get(&normalize_sql(sql))
            .cloned()
            .ok_or_else(|| WarehouseError::QueryError(format!("no result for query: {}", sql)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stellate_core::{row, LogicalType};

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
            ],
            vec!["store_code".into()],
        )
    }

    #[tokio::test]
    async fn insert_assigns_sequential_keys() {
        let warehouse = MemoryWarehouse::new();
        let table = store_table();
        warehouse.create_table(&table).await.unwrap();

        let s1 = warehouse
            .insert_returning_key(&table, &row([("store_code", "S1"), ("name", "Alpha")]))
            .await
            .unwrap();
        let s2 = warehouse
            .insert_returning_key(&table, &row([("store_code", "S2")]))
            .await
            .unwrap();
        assert_eq!((s1, s2), (1, 2));

        let key = KeyTuple(vec![Value::from("S2")]);
        assert_eq!(warehouse.find_key(&table, &key).await.unwrap(), Some(2));

        let rows = warehouse.fetch_rows("dim_store").await.unwrap();
        assert_eq!(rows[1].get("name"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn unique_violation_on_duplicate_key() {
        let warehouse = MemoryWarehouse::new();
        let table = store_table();
        warehouse.create_table(&table).await.unwrap();
        warehouse
            .insert_returning_key(&table, &row([("store_code", "S1")]))
            .await
            .unwrap();

        let err = warehouse
            .insert_returning_key(&table, &row([("store_code", "S1")]))
            .await
            .unwrap_err();
        assert!(err.is_unique_violation());
    }

    #[tokio::test]
    async fn batch_insert_is_atomic() {
        let warehouse = MemoryWarehouse::new();
        let table = store_table();
        warehouse.create_table(&table).await.unwrap();

        let rows = vec![
            row([("store_code", "S1")]),
            row([("store_code", "S2")]),
            row([("store_code", "S1")]),
        ];
        let err = warehouse
            .insert_rows(&table, &rows, OnConflict::Error)
            .await
            .unwrap_err();
        assert!(err.is_unique_violation());
        assert_eq!(warehouse.row_count("dim_store").await.unwrap(), 0);

        let inserted = warehouse
            .insert_rows(&table, &rows, OnConflict::Ignore)
            .await
            .unwrap();
        assert_eq!(inserted, 2);
        assert_eq!(warehouse.row_count("dim_store").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn not_null_enforced() {
        let warehouse = MemoryWarehouse::new();
        let table = store_table();
        warehouse.create_table(&table).await.unwrap();

        let err = warehouse
            .insert_returning_key(&table, &row([("name", "Alpha")]))
            .await
            .unwrap_err();
        assert!(matches!(err, WarehouseError::QueryError(_)));
    }

    #[tokio::test]
    async fn add_column_is_additive() {
        let warehouse = MemoryWarehouse::new();
        let table = store_table();
        warehouse.create_table(&table).await.unwrap();
        warehouse
            .insert_returning_key(&table, &row([("store_code", "S1")]))
            .await
            .unwrap();

        let city = ColumnSpec {
            name: "city".into(),
            logical_type: LogicalType::String,
            nullable: false,
            default: None,
        };
        warehouse.add_column("dim_store", &city).await.unwrap();

        let columns = warehouse.describe_table("dim_store").await.unwrap().unwrap();
        let added = columns.iter().find(|c| c.name == "city").unwrap();
        assert!(added.nullable);
        assert!(columns[0].is_surrogate_key());

        let rows = warehouse.fetch_rows("dim_store").await.unwrap();
        assert_eq!(rows[0].get("city"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn unique_key_added_to_existing_table() {
        let warehouse = MemoryWarehouse::new();
        let mut table = store_table();
        table.unique_key.clear();
        warehouse.create_table(&table).await.unwrap();
        assert!(warehouse.unique_key("dim_store").await.unwrap().is_empty());

        warehouse
            .insert_returning_key(&table, &row([("store_code", "S1")]))
            .await
            .unwrap();
        warehouse
            .insert_returning_key(&table, &row([("store_code", "S1")]))
            .await
            .unwrap();

        // Existing duplicates block the constraint
        let keyed = store_table();
        let err = warehouse.add_unique_key(&keyed).await.unwrap_err();
        assert!(err.is_unique_violation());
        assert!(warehouse.unique_key("dim_store").await.unwrap().is_empty());

        let fresh = TableSpec::new("dim_city", keyed.columns.clone(), vec![]);
        warehouse.create_table(&fresh).await.unwrap();
        warehouse
            .add_unique_key(&TableSpec::new("dim_city", keyed.columns.clone(), keyed.unique_key.clone()))
            .await
            .unwrap();
        assert_eq!(warehouse.unique_key("dim_city").await.unwrap(), vec!["store_code"]);
    }

    #[tokio::test]
    async fn concurrent_insert_wins_first() {
        let warehouse = MemoryWarehouse::new();
        let table = store_table();
        warehouse.create_table(&table).await.unwrap();
        warehouse
            .simulate_concurrent_insert("dim_store", row([("store_code", "S1"), ("name", "Other")]))
            .await;

        let err = warehouse
            .insert_returning_key(&table, &row([("store_code", "S1"), ("name", "Mine")]))
            .await
            .unwrap_err();
        assert!(err.is_unique_violation());

        let key = KeyTuple(vec![Value::from("S1")]);
        assert_eq!(warehouse.find_key(&table, &key).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn configured_errors_and_connection_failure() {
        let warehouse = MemoryWarehouse::new().with_connection_failure();
        assert!(matches!(
            warehouse.test_connection().await,
            Err(WarehouseError::ConnectionError(_))
        ));

        warehouse
            .add_error_for_table("dim_store", WarehouseError::QueryError("boom".into()))
            .await;
        assert!(warehouse.create_table(&store_table()).await.is_err());

        warehouse.clear_errors().await;
        assert!(warehouse.create_table(&store_table()).await.is_ok());
        assert_eq!(warehouse.table_names().await, vec!["dim_store"]);
    }

    #[tokio::test]
    async fn clones_share_state() {
        let warehouse = MemoryWarehouse::new();
        let other = warehouse.clone();
        other.create_table(&store_table()).await.unwrap();
        assert!(warehouse.has_table("dim_store").await);
    }

    #[tokio::test]
    async fn memory_connection_queries() {
        let shop = MemoryConnection::new("shop")
            .with_result("SELECT *\n  FROM sales", vec![row([("amount", Value::Int(10))])]);

        let result = shop.query("SELECT * FROM sales").await.unwrap();
        assert_eq!(result.columns, vec!["amount"]);
        assert_eq!(result.rows.len(), 1);

        assert!(shop.query("SELECT 1").await.is_err());
        assert!(MemoryConnection::new("down").with_failure().query("SELECT 1").await.is_err());
    }
}
