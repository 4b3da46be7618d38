//! Error taxonomy
//!
//! One enum per pipeline stage. Every variant carries the identity of the
//! schema, stage or table it was raised for, so errors can be reported
//! without extra context.

use thiserror::Error;

/// Definition validation errors (fatal at load time, never retried)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("{schema}: invalid identifier '{name}'")]
    InvalidIdentifier { schema: String, name: String },

    #[error("{schema}: duplicate column '{column}'")]
    DuplicateColumn { schema: String, column: String },

    #[error("{schema}: duplicate reference '{reference}'")]
    DuplicateReference { schema: String, reference: String },

    #[error("schema '{name}' is defined more than once")]
    DuplicateSchema { name: String },

    #[error("{schema}: unique key column '{column}' is not a declared column")]
    UnknownKeyColumn { schema: String, column: String },

    #[error("{schema}: column '{column}' has unknown type '{declared}'")]
    UnknownType {
        schema: String,
        column: String,
        declared: String,
    },

    #[error("{schema}: reference '{reference}' names unknown dimension '{dimension}'")]
    UnknownDimension {
        schema: String,
        reference: String,
        dimension: String,
    },

    #[error("{schema}: reference '{reference}' targets fact '{target}'")]
    ReferenceToFact {
        schema: String,
        reference: String,
        target: String,
    },

    #[error("{schema}: dimension declares no natural key")]
    MissingNaturalKey { schema: String },

    #[error("{schema}: natural key column '{column}' cannot be nullable")]
    NullableNaturalKey { schema: String, column: String },

    #[error("{schema}: reference '{reference}' does not map natural key column '{column}'")]
    IncompleteMapping {
        schema: String,
        reference: String,
        column: String,
    },

    #[error("{schema}: reference '{reference}' maps '{column}', which is not a natural key")]
    InvalidMapping {
        schema: String,
        reference: String,
        column: String,
    },

    #[error("{schema}: column '{column}' is reserved for the surrogate key")]
    ReservedColumn { schema: String, column: String },

    #[error("{schema}: reference column '{column}' collides with a declared column")]
    ReferenceColumnConflict { schema: String, column: String },

    #[error("{schema}: fact declares no source")]
    MissingSource { schema: String },

    #[error("{schema}: default for '{column}' is invalid: {message}")]
    InvalidDefault {
        schema: String,
        column: String,
        message: String,
    },

    #[error("dimension cycle: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("unknown schema '{name}'")]
    UnknownSchema { name: String },
}

/// Extraction errors (fatal to the run, no automatic retry)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("{schema}: unknown source database '{database}'")]
    UnknownDatabase { schema: String, database: String },

    #[error("{schema}: query failed: {message}")]
    Query { schema: String, message: String },

    #[error("{schema}: cannot read {path}: {message}")]
    Io {
        schema: String,
        path: String,
        message: String,
    },

    #[error("{schema}: malformed source data: {message}")]
    Parse { schema: String, message: String },

    #[error("{schema}: unknown generator '{generator}'")]
    UnknownGenerator { schema: String, generator: String },

    #[error("{schema}: generator '{generator}' failed: {message}")]
    Generator {
        schema: String,
        generator: String,
        message: String,
    },

    #[error("{schema}: row {row}, column '{column}': {message}")]
    InvalidValue {
        schema: String,
        row: usize,
        column: String,
        message: String,
    },
}

/// Expansion pipeline errors (raised before any write)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpansionError {
    #[error("{schema}: expansion {stage} failed: {message}")]
    Failed {
        schema: String,
        stage: String,
        message: String,
    },

    #[error("{schema}: expansion {stage} changed row count from {before} to {after}")]
    RowCountChanged {
        schema: String,
        stage: String,
        before: usize,
        after: usize,
    },

    #[error("{schema}: expansion {stage} names unregistered custom expansion '{name}'")]
    UnknownCustom {
        schema: String,
        stage: String,
        name: String,
    },
}

impl ExpansionError {
    /// Identity of the failing stage
    pub fn stage(&self) -> &str {
        match self {
            Self::Failed { stage, .. }
            | Self::RowCountChanged { stage, .. }
            | Self::UnknownCustom { stage, .. } => stage,
        }
    }
}

/// Dimension resolution errors (no fact rows are written)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("{schema}: row {row} has no value for '{field}' required by dimension {dimension}")]
    NullNaturalKey {
        schema: String,
        dimension: String,
        row: usize,
        field: String,
    },

    #[error("{schema}: row {row}, field '{field}' is not a valid key for {dimension}: {message}")]
    InvalidKeyValue {
        schema: String,
        dimension: String,
        row: usize,
        field: String,
        message: String,
    },

    #[error("{dimension}: no value for non-nullable column '{column}' of key {key}")]
    MissingAttribute {
        dimension: String,
        column: String,
        key: String,
    },

    #[error("{dimension}: key {key} was not resolved")]
    Unresolved { dimension: String, key: String },
}

/// Warehouse write errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("{table}: duplicate row for unique key {key}")]
    DuplicateFact { table: String, key: String },

    #[error("{table}: row {row} has no value for non-nullable column '{column}'")]
    MissingValue {
        table: String,
        row: usize,
        column: String,
    },

    #[error("{table}: row {row}, column '{column}': {message}")]
    InvalidValue {
        table: String,
        row: usize,
        column: String,
        message: String,
    },

    #[error("{table}: key {key} still conflicting after {attempts} attempts")]
    ConflictRetriesExhausted {
        table: String,
        key: String,
        attempts: u32,
    },

    #[error("{table}: {message}")]
    Warehouse { table: String, message: String },
}

/// Pre-/post-run hook errors (always fatal)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HookError {
    #[error("{stage} hook '{command}' could not be started: {message}")]
    Spawn {
        stage: String,
        command: String,
        message: String,
    },

    #[error("{stage} hook '{command}' exited with {}", exit_description(.status))]
    Failed {
        stage: String,
        command: String,
        status: Option<i32>,
    },
}

fn exit_description(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("status {}", code),
        None => "a signal".to_string(),
    }
}
