//! Warehouse and source connection traits

use stellate_core::{
    Column, KeyTuple, LogicalType, Row, SchemaDefinition, Value, SURROGATE_KEY,
};

/// A column of a table to create or extend
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub name: String,
    pub logical_type: LogicalType,
    pub nullable: bool,
    pub default: Option<Value>,
}

impl From<&Column> for ColumnSpec {
    fn from(column: &Column) -> Self {
        Self {
            name: column.name.clone(),
            logical_type: column.logical_type.clone(),
            nullable: column.nullable,
            default: column.default.clone(),
        }
    }
}

/// Physical layout of a warehouse table
///
/// Every table also carries the `id` surrogate key column, which is not
/// listed in `columns`.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSpec {
    /// Table name
    pub name: String,

    /// Declared columns in order
    pub columns: Vec<ColumnSpec>,

    /// Columns covered by the table's UNIQUE constraint (may be empty)
    pub unique_key: Vec<String>,
}

impl TableSpec {
    /// Create a new table spec
    pub fn new(name: impl Into<String>, columns: Vec<ColumnSpec>, unique_key: Vec<String>) -> Self {
        Self {
            name: name.into(),
            columns,
            unique_key,
        }
    }

    /// Derive the table layout from a schema definition
    pub fn from_definition(definition: &SchemaDefinition) -> Self {
        Self {
            name: definition.table().to_string(),
            columns: definition.columns.iter().map(ColumnSpec::from).collect(),
            unique_key: definition.unique_key.clone(),
        }
    }

    /// Find a column by name
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Declared column names
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Unique-key values of a row
    pub fn key_of(&self, row: &Row) -> KeyTuple {
        KeyTuple(
            self.unique_key
                .iter()
                .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
                .collect(),
        )
    }
}

/// A column as it currently exists in the warehouse
#[derive(Debug, Clone, PartialEq)]
pub struct ExistingColumn {
    pub name: String,

    /// `None` when the physical type has no portable equivalent
    pub logical_type: Option<LogicalType>,

    pub nullable: bool,
}

impl ExistingColumn {
    /// Whether this is the surrogate key column
    pub fn is_surrogate_key(&self) -> bool {
        self.name == SURROGATE_KEY
    }
}

/// What to do when an inserted row violates a unique constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnConflict {
    /// Fail the whole statement; nothing is written
    Error,

    /// Skip conflicting rows
    Ignore,
}

/// Rows returned by a source query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

/// Errors raised by warehouses and source connections
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WarehouseError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Unique constraint violated on {0}: {1}")]
    UniqueViolation(String, String),

    #[error("Query failed: {0}")]
    QueryError(String),

    #[error("Unsupported value: {0}")]
    TypeError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl WarehouseError {
    /// Whether this error is a unique-constraint violation
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::UniqueViolation(..))
    }
}

/// Target warehouse holding fact and dimension tables
///
/// Implementations must make `insert_rows` atomic: with
/// [`OnConflict::Error`] either every row is written or none is.
#[async_trait::async_trait]
pub trait Warehouse: Send + Sync {
    /// Get the warehouse name (e.g., "PostgreSQL")
    fn name(&self) -> &'static str;

    /// Test the connection to the warehouse
    async fn test_connection(&self) -> Result<(), WarehouseError>;

    /// Columns of an existing table, or `None` if the table is absent
    async fn describe_table(&self, table: &str)
        -> Result<Option<Vec<ExistingColumn>>, WarehouseError>;

    /// Create a table (with surrogate key and unique constraint)
    async fn create_table(&self, table: &TableSpec) -> Result<(), WarehouseError>;

    /// Add a column to an existing table
    async fn add_column(&self, table: &str, column: &ColumnSpec) -> Result<(), WarehouseError>;

    /// Columns of the table's unique constraint, empty if it has none
    async fn unique_key(&self, table: &str) -> Result<Vec<String>, WarehouseError>;

    /// Add the unique constraint of `table` to an existing table
    ///
    /// Fails with [`WarehouseError::UniqueViolation`] if existing rows
    /// already collide on the key.
    async fn add_unique_key(&self, table: &TableSpec) -> Result<(), WarehouseError>;

    /// Create or replace a view
    async fn replace_view(&self, name: &str, sql: &str) -> Result<(), WarehouseError>;

    /// Surrogate key of the row whose unique key equals `key`
    async fn find_key(&self, table: &TableSpec, key: &KeyTuple)
        -> Result<Option<i64>, WarehouseError>;

    /// Insert one row and return its surrogate key
    ///
    /// Fails with [`WarehouseError::UniqueViolation`] if the key exists.
    async fn insert_returning_key(&self, table: &TableSpec, row: &Row)
        -> Result<i64, WarehouseError>;

    /// Insert a batch of rows atomically; returns the number written
    async fn insert_rows(
        &self,
        table: &TableSpec,
        rows: &[Row],
        on_conflict: OnConflict,
    ) -> Result<usize, WarehouseError>;

    /// Number of rows in a table
    async fn row_count(&self, table: &str) -> Result<usize, WarehouseError>;

    /// All rows of a table ordered by surrogate key, `id` included
    async fn fetch_rows(&self, table: &str) -> Result<Vec<Row>, WarehouseError>;
}

/// Source database that answers extraction queries
#[async_trait::async_trait]
pub trait Connection: Send + Sync {
    /// Connection name, for logs
    fn name(&self) -> &str;

    /// Run a query and buffer the complete result set
    async fn query(&self, sql: &str) -> Result<QueryResult, WarehouseError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use stellate_core::{row, ColumnRole};

    #[test]
    fn table_spec_from_columns() {
        let spec = TableSpec::new(
            "dim_store",
            vec![
                ColumnSpec::from(&Column::new("store_code", LogicalType::String, ColumnRole::NaturalKey)),
                ColumnSpec::from(
                    &Column::new("name", LogicalType::String, ColumnRole::Attribute).with_nullable(true),
                ),
            ],
            vec!["store_code".into()],
        );

        assert_eq!(spec.column_names(), vec!["store_code", "name"]);
        assert!(spec.column("name").unwrap().nullable);
        assert_eq!(
            spec.key_of(&row([("store_code", "S1"), ("name", "Alpha")])),
            KeyTuple(vec![Value::from("S1")])
        );
    }

    #[test]
    fn unique_violation_predicate() {
        assert!(WarehouseError::UniqueViolation("t".into(), "(1)".into()).is_unique_violation());
        assert!(!WarehouseError::QueryError("boom".into()).is_unique_violation());
    }
}
