//! Table materialization
//!
//! Tables are reconciled additively against their definitions: missing
//! tables are created, missing columns and a missing unique constraint are
//! added, and nothing is ever dropped or retyped. Type and nullability
//! drift, and a unique constraint that differs from the declared one, are
//! only reported.

use stellate_core::{LogicalType, SchemaDefinition};
use stellate_schema::Catalog;
use stellate_warehouse::{ColumnSpec, ExistingColumn, TableSpec, Warehouse};

use crate::error::{load_error, RunError};

/// Difference between a declared column and the warehouse column
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnDrift {
    /// Physical type differs from the declared type
    Type {
        column: String,
        declared: String,
        existing: String,
    },

    /// Nullability differs
    Nullability {
        column: String,
        declared_nullable: bool,
        existing_nullable: bool,
    },

    /// The table enforces a different unique key
    UniqueKey {
        declared: Vec<String>,
        existing: Vec<String>,
    },
}

impl std::fmt::Display for ColumnDrift {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Type {
                column,
                declared,
                existing,
            } => write!(
                f,
                "column '{}' is {} in the warehouse but declared {}",
                column, existing, declared
            ),
            Self::Nullability {
                column,
                declared_nullable,
                existing_nullable,
            } => write!(
                f,
                "column '{}' is {} in the warehouse but declared {}",
                column,
                nullability(*existing_nullable),
                nullability(*declared_nullable)
            ),
            Self::UniqueKey { declared, existing } => write!(
                f,
                "unique key is ({}) in the warehouse but declared ({})",
                existing.join(", "),
                declared.join(", ")
            ),
        }
    }
}

fn nullability(nullable: bool) -> &'static str {
    if nullable {
        "NULL"
    } else {
        "NOT NULL"
    }
}

/// Outcome of reconciling one table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub table: String,

    /// Table did not exist and was created
    pub created: bool,

    /// Columns added to an existing table
    pub added: Vec<String>,

    /// Unique constraint added to an existing table
    pub unique_key_added: bool,

    /// Drift left untouched
    pub drift: Vec<ColumnDrift>,
}

impl Reconciliation {
    /// Whether the warehouse was modified
    pub fn changed(&self) -> bool {
        self.created || !self.added.is_empty() || self.unique_key_added
    }
}

fn types_match(declared: &LogicalType, existing: &LogicalType) -> bool {
    match (declared, existing) {
        // Unconstrained NUMERIC accepts any declared precision
        (
            LogicalType::Decimal { precision: p1, scale: s1 },
            LogicalType::Decimal { precision: p2, scale: s2 },
        ) => p2.is_none() || (p1 == p2 && s1 == s2),
        (a, b) => a == b,
    }
}

/// Compare declared columns with what the warehouse has
///
/// Returns the declared columns missing from the table and the drift of
/// the ones present. Extra warehouse columns are ignored.
pub fn compare_columns<'a>(
    declared: &'a TableSpec,
    existing: &[ExistingColumn],
) -> (Vec<&'a ColumnSpec>, Vec<ColumnDrift>) {
    let mut missing = Vec::new();
    let mut drift = Vec::new();

    for column in &declared.columns {
        let Some(actual) = existing.iter().find(|c| c.name == column.name) else {
            missing.push(column);
            continue;
        };

        // Types with no portable equivalent can't be compared
        if let Some(actual_type) = &actual.logical_type {
            if !types_match(&column.logical_type, actual_type) {
                drift.push(ColumnDrift::Type {
                    column: column.name.clone(),
                    declared: column.logical_type.to_string(),
                    existing: actual_type.to_string(),
                });
            }
        }

        if column.nullable != actual.nullable {
            drift.push(ColumnDrift::Nullability {
                column: column.name.clone(),
                declared_nullable: column.nullable,
                existing_nullable: actual.nullable,
            });
        }
    }

    (missing, drift)
}

/// Creates and extends warehouse tables
pub struct Materializer<'a> {
    warehouse: &'a dyn Warehouse,
}

impl<'a> Materializer<'a> {
    pub fn new(warehouse: &'a dyn Warehouse) -> Self {
        Self { warehouse }
    }

    /// Make sure the table of a schema exists with every declared column
    pub async fn ensure_table(&self, schema: &SchemaDefinition) -> Result<Reconciliation, RunError> {
        let table = TableSpec::from_definition(schema);
        let mut outcome = Reconciliation {
            table: table.name.clone(),
            ..Default::default()
        };

        let existing = self
            .warehouse
            .describe_table(&table.name)
            .await
            .map_err(|e| load_error(&table.name, e))?;

        let Some(existing) = existing else {
            self.warehouse
                .create_table(&table)
                .await
                .map_err(|e| load_error(&table.name, e))?;
            tracing::info!(table = %table.name, columns = table.columns.len(), "Created table");
            outcome.created = true;
            return Ok(outcome);
        };

        let (missing, mut drift) = compare_columns(&table, &existing);

        for column in missing {
            self.warehouse
                .add_column(&table.name, column)
                .await
                .map_err(|e| load_error(&table.name, e))?;
            tracing::info!(table = %table.name, column = %column.name, "Added column");
            outcome.added.push(column.name.clone());
        }

        // The constraint goes in after the columns it covers
        let existing_key = self
            .warehouse
            .unique_key(&table.name)
            .await
            .map_err(|e| load_error(&table.name, e))?;
        if existing_key.is_empty() && !table.unique_key.is_empty() {
            self.warehouse
                .add_unique_key(&table)
                .await
                .map_err(|e| load_error(&table.name, e))?;
            tracing::info!(table = %table.name, key = ?table.unique_key, "Added unique key");
            outcome.unique_key_added = true;
        } else if existing_key != table.unique_key {
            drift.push(ColumnDrift::UniqueKey {
                declared: table.unique_key.clone(),
                existing: existing_key,
            });
        }

        for item in &drift {
            tracing::warn!(table = %table.name, "Schema drift: {}", item);
        }
        outcome.drift = drift;

        Ok(outcome)
    }

    /// Materialize a schema and every dimension it reaches, dependencies first
    pub async fn ensure_closure(
        &self,
        catalog: &Catalog,
        name: &str,
    ) -> Result<Vec<Reconciliation>, RunError> {
        let mut outcomes = Vec::new();
        for schema in catalog.resolution_order(name)? {
            outcomes.push(self.ensure_table(schema).await?);
        }
        Ok(outcomes)
    }
}
