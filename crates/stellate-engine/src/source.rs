//! Source extraction
//!
//! Every source kind produces a fully buffered [`RowBuffer`]. Field names
//! are normalized to the declared spelling and declared columns are
//! coerced to their types before the buffer leaves this module.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use stellate_core::{
    ColumnRole, Row, RowBuffer, SchemaDefinition, SourceError, SourceSpec, Value,
};
use stellate_warehouse::Connection;

use crate::calendar::CalendarGenerator;

/// Callable that produces rows for `generator` sources
pub trait RowGenerator: Send + Sync {
    /// Name used in definitions (`source = { type = "generator", name = ... }`)
    fn name(&self) -> &str;

    /// Produce rows for the given parameters
    fn generate(&self, params: &BTreeMap<String, serde_json::Value>) -> Result<Vec<Row>, String>;
}

/// Connections and generators available to sources
#[derive(Clone)]
pub struct SourceRegistry {
    connections: HashMap<String, Arc<dyn Connection>>,
    generators: HashMap<String, Arc<dyn RowGenerator>>,
    base_dir: PathBuf,
}

impl SourceRegistry {
    /// Registry with the built-in generators
    pub fn new() -> Self {
        let mut registry = Self {
            connections: HashMap::new(),
            generators: HashMap::new(),
            base_dir: PathBuf::new(),
        };
        registry.add_generator(Arc::new(CalendarGenerator));
        registry
    }

    /// Register a named source database
    pub fn add_connection(&mut self, name: impl Into<String>, connection: Arc<dyn Connection>) {
        self.connections.insert(name.into(), connection);
    }

    /// Register a generator under its own name
    pub fn add_generator(&mut self, generator: Arc<dyn RowGenerator>) {
        self.generators.insert(generator.name().to_string(), generator);
    }

    /// Directory that relative `json` source paths are resolved against
    pub fn set_base_dir(&mut self, dir: impl Into<PathBuf>) {
        self.base_dir = dir.into();
    }

    /// Extract and normalize the rows of a schema
    ///
    /// Schemas without a source yield an empty buffer.
    pub async fn extract(&self, schema: &SchemaDefinition) -> Result<RowBuffer, SourceError> {
        let Some(source) = &schema.source else {
            return Ok(RowBuffer::new());
        };

        let rows = match source {
            SourceSpec::Sql { database, query } => {
                let connection =
                    self.connections
                        .get(database)
                        .ok_or_else(|| SourceError::UnknownDatabase {
                            schema: schema.name.clone(),
                            database: database.clone(),
                        })?;

                tracing::debug!(schema = %schema.name, database = %database, "Running source query");
                connection
                    .query(query)
                    .await
                    .map_err(|e| SourceError::Query {
                        schema: schema.name.clone(),
                        message: e.to_string(),
                    })?
                    .rows
            }
            SourceSpec::Inline { rows } => rows.iter().map(json_row).collect(),
            SourceSpec::Json { path } => self.read_json(schema, path).await?,
            SourceSpec::Generator { name, params } => {
                let generator =
                    self.generators
                        .get(name)
                        .ok_or_else(|| SourceError::UnknownGenerator {
                            schema: schema.name.clone(),
                            generator: name.clone(),
                        })?;

                generator
                    .generate(params)
                    .map_err(|message| SourceError::Generator {
                        schema: schema.name.clone(),
                        generator: name.clone(),
                        message,
                    })?
            }
        };

        let buffer = normalize(schema, rows)?;
        tracing::info!(
            schema = %schema.name,
            source = source.kind(),
            rows = buffer.len(),
            "Extracted source rows"
        );
        Ok(buffer)
    }

    async fn read_json(&self, schema: &SchemaDefinition, path: &Path) -> Result<Vec<Row>, SourceError> {
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        };

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| SourceError::Io {
                schema: schema.name.clone(),
                path: path.display().to_string(),
                message: e.to_string(),
            })?;

        parse_json_rows(&content).map_err(|message| SourceError::Parse {
            schema: schema.name.clone(),
            message: format!("{}: {}", path.display(), message),
        })
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn json_row(object: &serde_json::Map<String, serde_json::Value>) -> Row {
    object
        .iter()
        .map(|(k, v)| (k.clone(), Value::from_json(v)))
        .collect()
}

/// Parse a JSON array of objects, or one object per line
pub fn parse_json_rows(content: &str) -> Result<Vec<Row>, String> {
    let trimmed = content.trim_start();

    let values: Vec<serde_json::Value> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed).map_err(|e| e.to_string())?
    } else {
        trimmed
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| {
                serde_json::from_str(line).map_err(|e| format!("line {}: {}", i + 1, e))
            })
            .collect::<Result<_, _>>()?
    };

    values
        .iter()
        .enumerate()
        .map(|(i, value)| match value {
            serde_json::Value::Object(object) => Ok(json_row(object)),
            other => Err(format!("record {} is not an object: {}", i + 1, other)),
        })
        .collect()
}

/// Rename fields to their declared spelling and coerce declared columns
///
/// Field names are matched case-insensitively against columns and against
/// reference mapping fields. Unknown fields are kept.
pub fn normalize(schema: &SchemaDefinition, rows: Vec<Row>) -> Result<RowBuffer, SourceError> {
    let mut spellings: HashMap<String, String> = HashMap::new();
    for name in schema
        .columns
        .iter()
        .map(|c| c.name.as_str())
        .chain(schema.references.iter().flat_map(|r| r.fields()))
    {
        spellings
            .entry(name.to_lowercase())
            .or_insert_with(|| name.to_string());
    }

    rows.into_iter()
        .enumerate()
        .map(|(index, raw)| {
            let mut row = Row::new();
            for (field, value) in raw {
                let name = spellings
                    .get(&field.to_lowercase())
                    .cloned()
                    .unwrap_or(field);
                // First non-null value wins among differently-cased duplicates
                if row.get(&name).map_or(false, |v| !v.is_null()) {
                    continue;
                }
                row.insert(name, value);
            }

            // Surrogate key columns are filled in by resolution. A mapping
            // field may share the name and still carry the natural key.
            for column in schema
                .columns
                .iter()
                .filter(|c| c.role != ColumnRole::DimensionKey)
            {
                if let Some(value) = row.get_mut(&column.name) {
                    *value = value.coerce(&column.logical_type).map_err(|message| {
                        SourceError::InvalidValue {
                            schema: schema.name.clone(),
                            row: index,
                            column: column.name.clone(),
                            message,
                        }
                    })?;
                }
            }

            Ok(row)
        })
        .collect()
}
