//! Expansion pipeline
//!
//! An expansion reshapes a whole [`RowBuffer`] at once. Stages run in
//! declaration order and every stage except a filter must keep the row
//! count. Stages are deterministic: they only see the rows they are given.

use std::collections::HashMap;
use std::sync::Arc;

use minijinja::{Environment, UndefinedBehavior};
use stellate_core::{
    ExpansionError, ExpansionSpec, FilterOp, LogicalType, Row, RowBuffer, SchemaDefinition, Value,
};

/// One stage of the pipeline
pub trait Expansion: Send + Sync {
    /// Stage name, used in stage identities (`"<index>:<name>"`)
    fn name(&self) -> &str;

    /// Whether this stage may drop rows
    fn is_filter(&self) -> bool {
        false
    }

    /// Transform the buffer
    fn apply(&self, rows: RowBuffer) -> Result<RowBuffer, String>;
}

/// Programmatically registered expansions, referenced by `custom` stages
#[derive(Clone, Default)]
pub struct ExpansionRegistry {
    expansions: HashMap<String, Arc<dyn Expansion>>,
}

impl ExpansionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an expansion under its own name
    pub fn register(&mut self, expansion: Arc<dyn Expansion>) {
        self.expansions.insert(expansion.name().to_string(), expansion);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Expansion>> {
        self.expansions.get(name).cloned()
    }
}

/// Rename a field
pub struct Rename {
    from: String,
    to: String,
}

impl Expansion for Rename {
    fn name(&self) -> &str {
        "rename"
    }

    fn apply(&self, mut rows: RowBuffer) -> Result<RowBuffer, String> {
        for row in rows.iter_mut() {
            // Rows without the field keep whatever `to` already holds
            if let Some(value) = row.remove(&self.from) {
                row.insert(self.to.clone(), value);
            }
        }
        Ok(rows)
    }
}

/// Remove fields
pub struct DropFields {
    columns: Vec<String>,
}

impl Expansion for DropFields {
    fn name(&self) -> &str {
        "drop"
    }

    fn apply(&self, mut rows: RowBuffer) -> Result<RowBuffer, String> {
        for row in rows.iter_mut() {
            for column in &self.columns {
                row.remove(column);
            }
        }
        Ok(rows)
    }
}

/// Set a field to a constant
pub struct SetValue {
    column: String,
    value: Value,
}

impl Expansion for SetValue {
    fn name(&self) -> &str {
        "set"
    }

    fn apply(&self, mut rows: RowBuffer) -> Result<RowBuffer, String> {
        for row in rows.iter_mut() {
            row.insert(self.column.clone(), self.value.clone());
        }
        Ok(rows)
    }
}

/// Copy a field under another name
pub struct CopyField {
    from: String,
    to: String,
}

impl Expansion for CopyField {
    fn name(&self) -> &str {
        "copy"
    }

    fn apply(&self, mut rows: RowBuffer) -> Result<RowBuffer, String> {
        for row in rows.iter_mut() {
            let value = row.get(&self.from).cloned().unwrap_or(Value::Null);
            row.insert(self.to.clone(), value);
        }
        Ok(rows)
    }
}

/// Convert a field to another type
pub struct Cast {
    column: String,
    to: LogicalType,
}

impl Expansion for Cast {
    fn name(&self) -> &str {
        "cast"
    }

    fn apply(&self, mut rows: RowBuffer) -> Result<RowBuffer, String> {
        for (index, row) in rows.iter_mut().enumerate() {
            if let Some(value) = row.get_mut(&self.column) {
                *value = value
                    .coerce(&self.to)
                    .map_err(|e| format!("row {}, field '{}': {}", index, self.column, e))?;
            }
        }
        Ok(rows)
    }
}

/// Render a template against each row
///
/// Referencing a field the row does not have is an error.
pub struct Template {
    column: String,
    source: String,
    env: Environment<'static>,
}

impl Template {
    pub fn new(column: impl Into<String>, source: impl Into<String>) -> Result<Self, String> {
        let source = source.into();
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);

        // Surface syntax errors before any row is processed
        env.template_from_str(&source).map_err(|e| e.to_string())?;

        Ok(Self {
            column: column.into(),
            source,
            env,
        })
    }
}

fn template_context(row: &Row) -> serde_json::Map<String, serde_json::Value> {
    row.iter().map(|(k, v)| (k.clone(), v.to_json())).collect()
}

impl Expansion for Template {
    fn name(&self) -> &str {
        "template"
    }

    fn apply(&self, mut rows: RowBuffer) -> Result<RowBuffer, String> {
        for (index, row) in rows.iter_mut().enumerate() {
            let rendered = self
                .env
                .render_str(&self.source, template_context(row))
                .map_err(|e| format!("row {}: {}", index, e))?;
            row.insert(self.column.clone(), Value::String(rendered));
        }
        Ok(rows)
    }
}

/// Keep rows matching a condition
pub struct Filter {
    column: String,
    op: FilterOp,
    value: Value,
}

/// Type a constant is compared as, given the row value
fn comparable_type(value: &Value) -> Option<LogicalType> {
    match value {
        Value::Null => None,
        Value::Bool(_) => Some(LogicalType::Bool),
        Value::Int(_) => Some(LogicalType::Int),
        Value::Decimal(_) => Some(LogicalType::Decimal {
            precision: None,
            scale: None,
        }),
        Value::String(_) => Some(LogicalType::String),
        Value::Date(_) => Some(LogicalType::Date),
        Value::Timestamp(_) => Some(LogicalType::Timestamp),
    }
}

impl Filter {
    fn matches(&self, row: &Row) -> bool {
        let field = row.get(&self.column).unwrap_or(&Value::Null);
        let equal = || match comparable_type(field) {
            Some(ty) => self.value.coerce(&ty).map_or(false, |c| &c == field),
            None => self.value.is_null(),
        };

        match self.op {
            FilterOp::NotNull => !field.is_null(),
            FilterOp::Equals => equal(),
            FilterOp::NotEquals => !equal(),
        }
    }
}

impl Expansion for Filter {
    fn name(&self) -> &str {
        "filter"
    }

    fn is_filter(&self) -> bool {
        true
    }

    fn apply(&self, rows: RowBuffer) -> Result<RowBuffer, String> {
        Ok(rows.into_iter().filter(|row| self.matches(row)).collect())
    }
}

/// Build the stage for a declarative spec
pub fn build_stage(
    spec: &ExpansionSpec,
    registry: &ExpansionRegistry,
) -> Result<Arc<dyn Expansion>, BuildError> {
    let stage: Arc<dyn Expansion> = match spec {
        ExpansionSpec::Rename { from, to } => Arc::new(Rename {
            from: from.clone(),
            to: to.clone(),
        }),
        ExpansionSpec::Drop { columns } => Arc::new(DropFields {
            columns: columns.clone(),
        }),
        ExpansionSpec::Set { column, value } => Arc::new(SetValue {
            column: column.clone(),
            value: Value::from_json(value),
        }),
        ExpansionSpec::Copy { from, to } => Arc::new(CopyField {
            from: from.clone(),
            to: to.clone(),
        }),
        ExpansionSpec::Cast { column, to } => Arc::new(Cast {
            column: column.clone(),
            to: to.clone(),
        }),
        ExpansionSpec::Template { column, template } => {
            Arc::new(Template::new(column.clone(), template.clone()).map_err(BuildError::Invalid)?)
        }
        ExpansionSpec::Filter { column, op, value } => {
            if *op != FilterOp::NotNull && value.is_none() {
                return Err(BuildError::Invalid(format!(
                    "filter on '{}' needs a value",
                    column
                )));
            }
            Arc::new(Filter {
                column: column.clone(),
                op: *op,
                value: value.as_ref().map(Value::from_json).unwrap_or(Value::Null),
            })
        }
        ExpansionSpec::Custom { name } => registry
            .get(name)
            .ok_or_else(|| BuildError::UnknownCustom(name.clone()))?,
    };
    Ok(stage)
}

/// Why a stage could not be built
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("{0}")]
    Invalid(String),

    #[error("unknown custom expansion '{0}'")]
    UnknownCustom(String),
}

/// Ordered, validated stages of one schema
pub struct Pipeline {
    schema: String,
    stages: Vec<(String, Arc<dyn Expansion>)>,
}

impl Pipeline {
    /// Create an empty pipeline
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            stages: Vec::new(),
        }
    }

    /// Build the pipeline declared by a schema
    pub fn for_schema(
        schema: &SchemaDefinition,
        registry: &ExpansionRegistry,
    ) -> Result<Self, ExpansionError> {
        let mut pipeline = Self::new(&schema.name);

        for (index, spec) in schema.expansions.iter().enumerate() {
            let stage = build_stage(spec, registry).map_err(|e| {
                let stage = format!("{}:{}", index + 1, spec_label(spec));
                match e {
                    BuildError::Invalid(message) => ExpansionError::Failed {
                        schema: schema.name.clone(),
                        stage,
                        message,
                    },
                    BuildError::UnknownCustom(name) => ExpansionError::UnknownCustom {
                        schema: schema.name.clone(),
                        stage,
                        name,
                    },
                }
            })?;
            pipeline.push(stage);
        }

        Ok(pipeline)
    }

    /// Append a stage
    pub fn push(&mut self, expansion: Arc<dyn Expansion>) {
        let id = format!("{}:{}", self.stages.len() + 1, expansion.name());
        self.stages.push((id, expansion));
    }

    /// Stage identities in order
    pub fn stage_ids(&self) -> Vec<&str> {
        self.stages.iter().map(|(id, _)| id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run every stage in order
    pub fn run(&self, mut rows: RowBuffer) -> Result<RowBuffer, ExpansionError> {
        for (id, stage) in &self.stages {
            let before = rows.len();
            rows = stage.apply(rows).map_err(|message| ExpansionError::Failed {
                schema: self.schema.clone(),
                stage: id.clone(),
                message,
            })?;

            if !stage.is_filter() && rows.len() != before {
                return Err(ExpansionError::RowCountChanged {
                    schema: self.schema.clone(),
                    stage: id.clone(),
                    before,
                    after: rows.len(),
                });
            }
            tracing::debug!(schema = %self.schema, stage = %id, rows = rows.len(), "Applied expansion");
        }
        Ok(rows)
    }
}

fn spec_label(spec: &ExpansionSpec) -> &str {
    match spec {
        ExpansionSpec::Rename { .. } => "rename",
        ExpansionSpec::Drop { .. } => "drop",
        ExpansionSpec::Set { .. } => "set",
        ExpansionSpec::Copy { .. } => "copy",
        ExpansionSpec::Cast { .. } => "cast",
        ExpansionSpec::Template { .. } => "template",
        ExpansionSpec::Filter { .. } => "filter",
        ExpansionSpec::Custom { name } => name,
    }
}
