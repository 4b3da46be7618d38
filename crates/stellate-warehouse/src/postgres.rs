//! PostgreSQL warehouse and source connection
//!
//! Works with PostgreSQL 10+ (identity columns) and compatible databases.
//! The same handle serves as a target warehouse and as a source database.
//!
//! ## Usage
//!
//! ```rust,ignore
//! // Plain connection
//! let warehouse = PostgresWarehouse::from_connection_string(
//!     "host=localhost port=5432 dbname=warehouse user=etl password=secret"
//! ).await?;
//!
//! // TLS connection
//! let warehouse = PostgresWarehouse::from_connection_string_with_tls(
//!     "host=db.example.com port=5432 dbname=warehouse user=etl password=secret"
//! ).await?;
//! ```

use stellate_core::LogicalType;

use crate::adapter::WarehouseError;

#[cfg(feature = "postgres")]
use crate::adapter::{ColumnSpec, Connection, ExistingColumn, OnConflict, QueryResult, TableSpec, Warehouse};
#[cfg(feature = "postgres")]
use crate::ddl;
#[cfg(feature = "postgres")]
use stellate_core::{KeyTuple, Row, Value, SURROGATE_KEY};

#[cfg(feature = "postgres")]
use tokio_postgres::{error::SqlState, types::ToSql, types::Type, Client, Config as PgConfig, NoTls};

#[cfg(feature = "postgres")]
use postgres_native_tls::MakeTlsConnector;

#[cfg(feature = "postgres")]
use native_tls::TlsConnector;

/// PostgreSQL warehouse
///
/// Statements are serialized over one client so that transactions from
/// different callers never interleave.
pub struct PostgresWarehouse {
    /// PostgreSQL client (only available with postgres feature)
    #[cfg(feature = "postgres")]
    client: tokio::sync::Mutex<Client>,

    /// Connection host
    host: String,

    /// Connection port
    port: u16,

    /// Database name
    database: String,
}

impl PostgresWarehouse {
    /// Connect using a PostgreSQL connection string
    ///
    /// Supports the key/value format:
    /// `host=localhost port=5432 dbname=warehouse user=etl password=secret`
    #[cfg(feature = "postgres")]
    pub async fn from_connection_string(conn_str: &str) -> Result<Self, WarehouseError> {
        let (host, port, database) = Self::describe_config(conn_str)?;

        let (client, connection) = tokio_postgres::connect(conn_str, NoTls)
            .await
            .map_err(|e| {
                WarehouseError::ConnectionError(format!(
                    "Failed to connect to PostgreSQL at {}:{}: {}",
                    host, port, e
                ))
            })?;

        // Spawn connection handler in background
        let (log_host, log_port) = (host.clone(), port);
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(host = %log_host, port = log_port, "PostgreSQL connection error: {}", e);
            }
        });

        Ok(Self {
            client: tokio::sync::Mutex::new(client),
            host,
            port,
            database,
        })
    }

    /// Create warehouse without postgres feature (returns error)
    #[cfg(not(feature = "postgres"))]
    pub async fn from_connection_string(_conn_str: &str) -> Result<Self, WarehouseError> {
        Err(not_compiled())
    }

    /// Connect using a connection string, always over TLS
    #[cfg(feature = "postgres")]
    pub async fn from_connection_string_with_tls(conn_str: &str) -> Result<Self, WarehouseError> {
        let (host, port, database) = Self::describe_config(conn_str)?;

        // Create TLS connector
        let connector = TlsConnector::builder().build().map_err(|e| {
            WarehouseError::ConfigError(format!("Failed to create TLS connector: {}", e))
        })?;
        let tls = MakeTlsConnector::new(connector);

        let (client, connection) = tokio_postgres::connect(conn_str, tls)
            .await
            .map_err(|e| {
                WarehouseError::ConnectionError(format!(
                    "Failed to connect to PostgreSQL at {}:{} with TLS: {}",
                    host, port, e
                ))
            })?;

        // Spawn connection handler in background
        let (log_host, log_port) = (host.clone(), port);
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(host = %log_host, port = log_port, "PostgreSQL TLS connection error: {}", e);
            }
        });

        Ok(Self {
            client: tokio::sync::Mutex::new(client),
            host,
            port,
            database,
        })
    }

    /// Create warehouse without postgres feature (returns error)
    #[cfg(not(feature = "postgres"))]
    pub async fn from_connection_string_with_tls(_conn_str: &str) -> Result<Self, WarehouseError> {
        Err(not_compiled())
    }

    #[cfg(feature = "postgres")]
    fn describe_config(conn_str: &str) -> Result<(String, u16, String), WarehouseError> {
        let config: PgConfig = conn_str
            .parse()
            .map_err(|e| WarehouseError::ConfigError(format!("Invalid connection string: {}", e)))?;

        let host = config
            .get_hosts()
            .first()
            .map(|h| format!("{:?}", h))
            .unwrap_or_else(|| "localhost".to_string());
        let port = config.get_ports().first().copied().unwrap_or(5432);
        let database = config.get_dbname().unwrap_or("postgres").to_string();

        Ok((host, port, database))
    }

    /// Convert a PostgreSQL type name to a LogicalType
    ///
    /// Returns `None` for types with no portable equivalent (arrays, JSON,
    /// geometry, ranges, ...).
    pub fn map_postgres_type(pg_type: &str) -> Option<LogicalType> {
        let base_type = pg_type
            .split('(')
            .next()
            .unwrap_or(pg_type)
            .trim()
            .to_lowercase();

        match base_type.as_str() {
            // Boolean types
            "boolean" | "bool" => Some(LogicalType::Bool),

            // Integer types
            "smallint" | "int2" | "integer" | "int" | "int4" | "bigint" | "int8" | "serial"
            | "serial4" | "bigserial" | "serial8" | "smallserial" | "serial2" => {
                Some(LogicalType::Int)
            }

            // Numeric/Decimal types
            "numeric" | "decimal" => Some(Self::parse_numeric_type(pg_type)),
            "real" | "float4" | "double precision" | "float8" | "float" => {
                Some(LogicalType::Decimal {
                    precision: None,
                    scale: None,
                })
            }
            "money" => Some(LogicalType::Decimal {
                precision: Some(19),
                scale: Some(2),
            }),

            // String types
            "character varying" | "varchar" | "character" | "char" | "bpchar" | "text"
            | "name" | "citext" | "uuid" => Some(LogicalType::String),

            // Date/Time types
            "date" => Some(LogicalType::Date),
            "timestamp without time zone" | "timestamp" | "timestamp with time zone"
            | "timestamptz" => Some(LogicalType::Timestamp),

            _ => None,
        }
    }

    /// Parse numeric type with precision and scale
    fn parse_numeric_type(type_str: &str) -> LogicalType {
        if let Some(params) = type_str.split('(').nth(1) {
            if let Some(params) = params.strip_suffix(')') {
                let parts: Vec<&str> = params.split(',').collect();
                if parts.len() == 2 {
                    let precision = parts[0].trim().parse().ok();
                    let scale = parts[1].trim().parse().ok();
                    return LogicalType::Decimal { precision, scale };
                } else if parts.len() == 1 {
                    let precision = parts[0].trim().parse().ok();
                    return LogicalType::Decimal {
                        precision,
                        scale: Some(0),
                    };
                }
            }
        }

        // NUMERIC without precision has arbitrary precision
        LogicalType::Decimal {
            precision: None,
            scale: None,
        }
    }

    /// Get the connection host
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Get the connection port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get the database name
    pub fn database(&self) -> &str {
        &self.database
    }
}

#[cfg(not(feature = "postgres"))]
fn not_compiled() -> WarehouseError {
    WarehouseError::ConfigError(
        "PostgreSQL support not compiled. Rebuild with: cargo build --features postgres".to_string(),
    )
}

#[cfg(feature = "postgres")]
fn map_pg_error(error: tokio_postgres::Error, table: &str) -> WarehouseError {
    if error.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        let detail = error
            .as_db_error()
            .and_then(|db| db.detail().map(str::to_string))
            .unwrap_or_else(|| error.to_string());
        WarehouseError::UniqueViolation(table.to_string(), detail)
    } else if error.code() == Some(&SqlState::UNDEFINED_TABLE) {
        WarehouseError::TableNotFound(table.to_string())
    } else if error.is_closed() {
        WarehouseError::ConnectionError(error.to_string())
    } else {
        WarehouseError::QueryError(format!("{}: {}", table, error))
    }
}

#[cfg(feature = "postgres")]
type Param = Box<dyn ToSql + Sync + Send>;

/// Bind a value with the type the target column expects
#[cfg(feature = "postgres")]
fn to_param(value: &Value, column: &ColumnSpec) -> Result<Param, WarehouseError> {
    let value = value
        .coerce(&column.logical_type)
        .map_err(|e| WarehouseError::TypeError(format!("{}: {}", column.name, e)))?;

    Ok(match (&column.logical_type, value) {
        (LogicalType::Bool, Value::Bool(b)) => Box::new(b),
        (LogicalType::Bool, _) => Box::new(None::<bool>),
        (LogicalType::Int, Value::Int(i)) => Box::new(i),
        (LogicalType::Int, _) => Box::new(None::<i64>),
        (LogicalType::Decimal { .. }, Value::Decimal(d)) => Box::new(d),
        (LogicalType::Decimal { .. }, _) => Box::new(None::<rust_decimal::Decimal>),
        (LogicalType::String, Value::String(s)) => Box::new(s),
        (LogicalType::String, _) => Box::new(None::<String>),
        (LogicalType::Date, Value::Date(d)) => Box::new(d),
        (LogicalType::Date, _) => Box::new(None::<chrono::NaiveDate>),
        (LogicalType::Timestamp, Value::Timestamp(ts)) => Box::new(ts),
        (LogicalType::Timestamp, _) => Box::new(None::<chrono::NaiveDateTime>),
    })
}

#[cfg(feature = "postgres")]
fn param_refs(params: &[Param]) -> Vec<&(dyn ToSql + Sync)> {
    params
        .iter()
        .map(|p| p.as_ref() as &(dyn ToSql + Sync))
        .collect()
}

/// Parameters for the row's values of the given columns
#[cfg(feature = "postgres")]
fn row_params(table: &TableSpec, columns: &[String], row: &Row) -> Result<Vec<Param>, WarehouseError> {
    columns
        .iter()
        .map(|name| {
            let column = table.column(name).ok_or_else(|| {
                WarehouseError::QueryError(format!("unknown column {}.{}", table.name, name))
            })?;
            to_param(row.get(name).unwrap_or(&Value::Null), column)
        })
        .collect()
}

/// Columns to write: provided values plus declared defaults
#[cfg(feature = "postgres")]
fn insert_columns(table: &TableSpec, rows: &[Row]) -> Vec<String> {
    table
        .columns
        .iter()
        .filter(|c| {
            c.default.is_none() || rows.iter().any(|r| r.get(&c.name).map_or(false, |v| !v.is_null()))
        })
        .map(|c| c.name.clone())
        .collect()
}

#[cfg(feature = "postgres")]
fn read_value(row: &tokio_postgres::Row, idx: usize) -> Result<Value, WarehouseError> {
    let column = &row.columns()[idx];
    let ty = column.type_();
    let err = |e: tokio_postgres::Error| {
        WarehouseError::TypeError(format!("column {}: {}", column.name(), e))
    };

    let value = if *ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(idx).map_err(err)?.map(Value::Bool)
    } else if *ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(idx).map_err(err)?.map(|v| Value::Int(i64::from(v)))
    } else if *ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(idx).map_err(err)?.map(|v| Value::Int(i64::from(v)))
    } else if *ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(idx).map_err(err)?.map(Value::Int)
    } else if *ty == Type::NUMERIC {
        row.try_get::<_, Option<rust_decimal::Decimal>>(idx).map_err(err)?.map(Value::Decimal)
    } else if *ty == Type::FLOAT4 || *ty == Type::FLOAT8 {
        let float = if *ty == Type::FLOAT4 {
            row.try_get::<_, Option<f32>>(idx).map_err(err)?.map(f64::from)
        } else {
            row.try_get::<_, Option<f64>>(idx).map_err(err)?
        };
        match float {
            Some(f) => Some(Value::Decimal(rust_decimal::Decimal::try_from(f).map_err(|e| {
                WarehouseError::TypeError(format!("column {}: {}", column.name(), e))
            })?)),
            None => None,
        }
    } else if *ty == Type::DATE {
        row.try_get::<_, Option<chrono::NaiveDate>>(idx).map_err(err)?.map(Value::Date)
    } else if *ty == Type::TIMESTAMP {
        row.try_get::<_, Option<chrono::NaiveDateTime>>(idx).map_err(err)?.map(Value::Timestamp)
    } else if *ty == Type::TIMESTAMPTZ {
        row.try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)
            .map_err(err)?
            .map(|ts| Value::Timestamp(ts.naive_utc()))
    } else {
        row.try_get::<_, Option<String>>(idx).map_err(err)?.map(Value::String)
    };

    Ok(value.unwrap_or(Value::Null))
}

#[cfg(feature = "postgres")]
fn read_rows(rows: &[tokio_postgres::Row]) -> Result<Vec<Row>, WarehouseError> {
    rows.iter()
        .map(|row| {
            (0..row.len())
                .map(|idx| Ok((row.columns()[idx].name().to_string(), read_value(row, idx)?)))
                .collect()
        })
        .collect()
}

#[cfg(feature = "postgres")]
#[async_trait::async_trait]
impl Warehouse for PostgresWarehouse {
    fn name(&self) -> &'static str {
        "PostgreSQL"
    }

    async fn test_connection(&self) -> Result<(), WarehouseError> {
        self.client
            .lock()
            .await
            .simple_query("SELECT 1")
            .await
            .map_err(|e| WarehouseError::ConnectionError(format!("Connection test failed: {}", e)))?;
        Ok(())
    }

    async fn describe_table(
        &self,
        table: &str,
    ) -> Result<Option<Vec<ExistingColumn>>, WarehouseError> {
        let query = r#"
            SELECT
                column_name::text,
                data_type::text,
                is_nullable::text,
                numeric_precision::int4,
                numeric_scale::int4
            FROM information_schema.columns
            WHERE table_schema = current_schema()
              AND table_name = $1
            ORDER BY ordinal_position
        "#;

        let rows = self
            .client
            .lock()
            .await
            .query(query, &[&table])
            .await
            .map_err(|e| map_pg_error(e, table))?;

        if rows.is_empty() {
            return Ok(None);
        }

        let columns = rows
            .iter()
            .map(|row| {
                let name: String = row.get(0);
                let data_type: String = row.get(1);
                let is_nullable: String = row.get(2);
                let precision: Option<i32> = row.get(3);
                let scale: Option<i32> = row.get(4);

                // Build full type string for numeric types with precision/scale
                let full_type = match (data_type.as_str(), precision, scale) {
                    ("numeric", Some(p), Some(s)) => format!("numeric({},{})", p, s),
                    _ => data_type,
                };

                ExistingColumn {
                    name,
                    logical_type: Self::map_postgres_type(&full_type),
                    nullable: is_nullable.eq_ignore_ascii_case("YES"),
                }
            })
            .collect();

        Ok(Some(columns))
    }

    async fn create_table(&self, table: &TableSpec) -> Result<(), WarehouseError> {
        let sql = ddl::create_table_sql(table);
        tracing::debug!(table = %table.name, "{}", sql);
        self.client
            .lock()
            .await
            .batch_execute(&sql)
            .await
            .map_err(|e| map_pg_error(e, &table.name))
    }

    async fn add_column(&self, table: &str, column: &ColumnSpec) -> Result<(), WarehouseError> {
        let sql = ddl::add_column_sql(table, column);
        tracing::debug!(table = %table, "{}", sql);
        self.client
            .lock()
            .await
            .batch_execute(&sql)
            .await
            .map_err(|e| map_pg_error(e, table))
    }

    async fn unique_key(&self, table: &str) -> Result<Vec<String>, WarehouseError> {
        let query = r#"
            SELECT
                tc.constraint_name::text,
                kcu.column_name::text
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
              ON kcu.constraint_name = tc.constraint_name
             AND kcu.table_schema = tc.table_schema
             AND kcu.table_name = tc.table_name
            WHERE tc.table_schema = current_schema()
              AND tc.table_name = $1
              AND tc.constraint_type = 'UNIQUE'
            ORDER BY tc.constraint_name, kcu.ordinal_position
        "#;

        let rows = self
            .client
            .lock()
            .await
            .query(query, &[&table])
            .await
            .map_err(|e| map_pg_error(e, table))?;

        // Only the first constraint counts when a table has several
        let Some(first) = rows.first().map(|row| row.get::<_, String>(0)) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .iter()
            .filter(|row| row.get::<_, String>(0) == first)
            .map(|row| row.get(1))
            .collect())
    }

    async fn add_unique_key(&self, table: &TableSpec) -> Result<(), WarehouseError> {
        let sql = ddl::add_unique_key_sql(table);
        tracing::debug!(table = %table.name, "{}", sql);
        self.client
            .lock()
            .await
            .batch_execute(&sql)
            .await
            .map_err(|e| map_pg_error(e, &table.name))
    }

    async fn replace_view(&self, name: &str, sql: &str) -> Result<(), WarehouseError> {
        self.client
            .lock()
            .await
            .batch_execute(&ddl::replace_view_sql(name, sql))
            .await
            .map_err(|e| map_pg_error(e, name))
    }

    async fn find_key(
        &self,
        table: &TableSpec,
        key: &KeyTuple,
    ) -> Result<Option<i64>, WarehouseError> {
        let mut params = Vec::with_capacity(table.unique_key.len());
        for (name, value) in table.unique_key.iter().zip(key.values()) {
            let column = table.column(name).ok_or_else(|| {
                WarehouseError::QueryError(format!("unknown key column {}.{}", table.name, name))
            })?;
            params.push(to_param(value, column)?);
        }

        let sql = ddl::find_key_sql(&table.name, &table.unique_key);
        let row = self
            .client
            .lock()
            .await
            .query_opt(&sql, &param_refs(&params))
            .await
            .map_err(|e| map_pg_error(e, &table.name))?;

        Ok(row.map(|r| r.get::<_, i64>(0)))
    }

    async fn insert_returning_key(
        &self,
        table: &TableSpec,
        row: &Row,
    ) -> Result<i64, WarehouseError> {
        let columns = insert_columns(table, std::slice::from_ref(row));
        let params = row_params(table, &columns, row)?;
        let sql = ddl::insert_returning_sql(&table.name, &columns);

        let inserted = self
            .client
            .lock()
            .await
            .query_one(&sql, &param_refs(&params))
            .await
            .map_err(|e| map_pg_error(e, &table.name))?;

        Ok(inserted.get::<_, i64>(SURROGATE_KEY))
    }

    async fn insert_rows(
        &self,
        table: &TableSpec,
        rows: &[Row],
        on_conflict: OnConflict,
    ) -> Result<usize, WarehouseError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let columns = insert_columns(table, rows);
        let sql = ddl::insert_sql(&table.name, &columns, on_conflict);

        let mut client = self.client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|e| map_pg_error(e, &table.name))?;
        let statement = tx.prepare(&sql).await.map_err(|e| map_pg_error(e, &table.name))?;

        let mut inserted = 0;
        for row in rows {
            let params = row_params(table, &columns, row)?;
            inserted += tx
                .execute(&statement, &param_refs(&params))
                .await
                .map_err(|e| map_pg_error(e, &table.name))?;
        }

        // Dropping the transaction on error rolls it back
        tx.commit().await.map_err(|e| map_pg_error(e, &table.name))?;
        Ok(inserted as usize)
    }

    async fn row_count(&self, table: &str) -> Result<usize, WarehouseError> {
        let row = self
            .client
            .lock()
            .await
            .query_one(&ddl::count_sql(table), &[])
            .await
            .map_err(|e| map_pg_error(e, table))?;
        Ok(row.get::<_, i64>(0) as usize)
    }

    async fn fetch_rows(&self, table: &str) -> Result<Vec<Row>, WarehouseError> {
        let rows = self
            .client
            .lock()
            .await
            .query(&ddl::select_all_sql(table), &[])
            .await
            .map_err(|e| map_pg_error(e, table))?;
        read_rows(&rows)
    }
}

#[cfg(feature = "postgres")]
#[async_trait::async_trait]
impl Connection for PostgresWarehouse {
    fn name(&self) -> &str {
        &self.database
    }

    async fn query(&self, sql: &str) -> Result<QueryResult, WarehouseError> {
        let rows = self
            .client
            .lock()
            .await
            .query(sql, &[])
            .await
            .map_err(|e| WarehouseError::QueryError(e.to_string()))?;

        let columns = rows
            .first()
            .map(|r| r.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();

        Ok(QueryResult {
            columns,
            rows: read_rows(&rows)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_type_mapping() {
        assert_eq!(PostgresWarehouse::map_postgres_type("boolean"), Some(LogicalType::Bool));
        assert_eq!(PostgresWarehouse::map_postgres_type("integer"), Some(LogicalType::Int));
        assert_eq!(PostgresWarehouse::map_postgres_type("bigint"), Some(LogicalType::Int));
        assert_eq!(PostgresWarehouse::map_postgres_type("text"), Some(LogicalType::String));
        assert_eq!(
            PostgresWarehouse::map_postgres_type("character varying"),
            Some(LogicalType::String)
        );
        assert_eq!(PostgresWarehouse::map_postgres_type("date"), Some(LogicalType::Date));
        assert_eq!(
            PostgresWarehouse::map_postgres_type("timestamp without time zone"),
            Some(LogicalType::Timestamp)
        );
    }

    #[test]
    fn test_numeric_type_parsing() {
        assert_eq!(
            PostgresWarehouse::map_postgres_type("numeric(12,2)"),
            Some(LogicalType::Decimal { precision: Some(12), scale: Some(2) })
        );
        assert_eq!(
            PostgresWarehouse::map_postgres_type("numeric(10)"),
            Some(LogicalType::Decimal { precision: Some(10), scale: Some(0) })
        );
        assert_eq!(
            PostgresWarehouse::map_postgres_type("numeric"),
            Some(LogicalType::Decimal { precision: None, scale: None })
        );
    }

    #[test]
    fn test_unportable_types() {
        assert_eq!(PostgresWarehouse::map_postgres_type("jsonb"), None);
        assert_eq!(PostgresWarehouse::map_postgres_type("point"), None);
        assert_eq!(PostgresWarehouse::map_postgres_type("integer[]"), None);
    }
}
