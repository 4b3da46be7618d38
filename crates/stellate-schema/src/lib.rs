//! Definition parsing, validation and dependency ordering
//!
//! This crate handles:
//! - Parsing fact/dimension definition files (TOML or JSON)
//! - Validating and normalizing them into schema definitions
//! - Building the reference graph (DAG) between schemas
//! - Dependency-first resolution order and cycle detection

pub mod definitions;
pub mod loader;
pub mod dag;
pub mod catalog;

pub use definitions::{DefinitionError, DefinitionFile, RawColumn, RawReference, RawSchema};
pub use loader::SchemaLoader;
pub use dag::{DependencyGraph, NodeId};
pub use catalog::{Catalog, ALL_FACTS};
