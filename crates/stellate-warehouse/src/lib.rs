//! Warehouse and source database access
//!
//! The engine talks to storage only through two traits:
//!
//! - [`Warehouse`] - the target holding fact and dimension tables
//! - [`Connection`] - a source database answering extraction queries
//!
//! ## Features
//!
//! Enable database support via Cargo features:
//! - `postgres` - PostgreSQL warehouse and sources
//!
//! [`MemoryWarehouse`] and [`MemoryConnection`] are always available and
//! back the test suites.
//!
//! ## Example
//!
//! ```rust,ignore
//! use stellate_warehouse::{PostgresWarehouse, TableSpec, Warehouse};
//!
//! let warehouse = PostgresWarehouse::from_connection_string("host=localhost dbname=dw").await?;
//! warehouse.create_table(&TableSpec::from_definition(&dim_store)).await?;
//! ```

pub mod adapter;
pub mod connect;
pub mod ddl;
pub mod memory;
pub mod postgres;

pub use adapter::{
    ColumnSpec, Connection, ExistingColumn, OnConflict, QueryResult, TableSpec, Warehouse,
    WarehouseError,
};
pub use connect::{connect_source, connect_warehouse};
pub use memory::{MemoryConnection, MemoryWarehouse};
pub use postgres::PostgresWarehouse;
