//! Stellate Core
//!
//! Core domain model: typed values and rows, fact/dimension definitions,
//! the error taxonomy, configuration and the versioned run report.

pub mod value;
pub mod schema;
pub mod error;
pub mod config;
pub mod report;

pub use value::{row, KeyTuple, Row, RowBuffer, Value};
pub use rust_decimal::Decimal;
pub use schema::{
    Column, ColumnRole, DimensionReference, DuplicatePolicy, ExpansionSpec, FilterOp, HookSpec,
    Hooks, KeyMapping, LogicalType, SchemaDefinition, SchemaKind, SourceSpec, SURROGATE_KEY,
    is_valid_identifier,
};
pub use error::{ExpansionError, HookError, LoadError, ResolutionError, SchemaError, SourceError};
pub use config::{Config, ConfigError, ConnectionConfig, ConnectionKind, RunConfig};
pub use report::{DimensionStats, FactStats, ReportVersion, RunFailure, RunReport, RunSummary};
