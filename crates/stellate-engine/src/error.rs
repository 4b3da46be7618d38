//! Run-level error wrapping every failure class

use stellate_core::{
    ExpansionError, HookError, LoadError, ResolutionError, SchemaError, SourceError,
};
use stellate_warehouse::WarehouseError;
use thiserror::Error;

/// Anything that can abort a fact run
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Expansion(#[from] ExpansionError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Hook(#[from] HookError),

    #[error("Warehouse error: {0}")]
    Warehouse(#[from] WarehouseError),
}

impl RunError {
    /// Process exit code for this failure class
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Schema(_) => 2,
            Self::Source(_) => 3,
            Self::Expansion(_) => 4,
            Self::Resolution(_) => 5,
            Self::Load(_) | Self::Warehouse(_) => 6,
            Self::Hook(_) => 7,
        }
    }

    /// Short failure class label
    pub fn class(&self) -> &'static str {
        match self {
            Self::Schema(_) => "schema",
            Self::Source(_) => "source",
            Self::Expansion(_) => "expansion",
            Self::Resolution(_) => "resolution",
            Self::Load(_) => "load",
            Self::Warehouse(_) => "warehouse",
            Self::Hook(_) => "hook",
        }
    }
}

/// Wrap a warehouse failure on `table` as a load error
pub(crate) fn load_error(table: &str, error: WarehouseError) -> LoadError {
    match error {
        WarehouseError::UniqueViolation(table, key) => LoadError::DuplicateFact { table, key },
        other => LoadError::Warehouse {
            table: table.to_string(),
            message: other.to_string(),
        },
    }
}
