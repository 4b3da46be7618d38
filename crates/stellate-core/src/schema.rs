//! Schema definitions for facts and dimensions

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::OnceLock;

use crate::value::Value;

/// Name of the warehouse-assigned key column present on every table
pub const SURROGATE_KEY: &str = "id";

/// Whether a name is safe to interpolate into DDL unquoted
pub fn is_valid_identifier(name: &str) -> bool {
    static IDENT: OnceLock<Regex> = OnceLock::new();
    IDENT
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap_or_else(|_| unreachable!()))
        .is_match(name)
}

/// Portable logical type system
///
/// Maps declared column types to the portable subset every warehouse
/// supports.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LogicalType {
    /// Boolean type
    Bool,

    /// Integer type (64-bit)
    Int,

    /// Decimal with optional precision and scale
    Decimal {
        precision: Option<u16>,
        scale: Option<u16>,
    },

    /// String/text type
    String,

    /// Date (no time component)
    Date,

    /// Timestamp (with time component)
    Timestamp,
}

impl LogicalType {
    /// Parse a declared type string
    ///
    /// Accepts the common spellings used in warehouse DDL, e.g. `integer`,
    /// `bigint`, `decimal(10, 2)`, `varchar(255)`, `datetime`.
    pub fn parse(declared: &str) -> Option<Self> {
        let lower = declared.trim().to_lowercase();
        let base = lower.split('(').next().unwrap_or(&lower).trim();

        match base {
            "int" | "integer" | "bigint" | "smallint" | "tinyint" | "int2" | "int4" | "int8"
            | "int64" => Some(Self::Int),

            "decimal" | "numeric" | "float" | "double" | "real" | "money" => {
                Some(Self::parse_decimal(&lower))
            }

            "string" | "varchar" | "char" | "text" | "character varying" | "character" => {
                Some(Self::String)
            }

            "bool" | "boolean" => Some(Self::Bool),

            "date" => Some(Self::Date),

            "timestamp" | "datetime" | "timestamp_ntz" | "timestamp without time zone" => {
                Some(Self::Timestamp)
            }

            _ => None,
        }
    }

    fn parse_decimal(s: &str) -> Self {
        if let (Some(start), Some(end)) = (s.find('('), s.find(')')) {
            let params: Vec<&str> = s[start + 1..end].split(',').map(|p| p.trim()).collect();
            let precision = params.first().and_then(|p| p.parse().ok());
            let scale = params.get(1).and_then(|p| p.parse().ok());
            return Self::Decimal { precision, scale };
        }
        Self::Decimal {
            precision: None,
            scale: None,
        }
    }
}

impl std::fmt::Display for LogicalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool => write!(f, "BOOL"),
            Self::Int => write!(f, "INT"),
            Self::Decimal { precision, scale } => match (precision, scale) {
                (Some(p), Some(s)) => write!(f, "DECIMAL({}, {})", p, s),
                (Some(p), None) => write!(f, "DECIMAL({})", p),
                _ => write!(f, "DECIMAL"),
            },
            Self::String => write!(f, "STRING"),
            Self::Date => write!(f, "DATE"),
            Self::Timestamp => write!(f, "TIMESTAMP"),
        }
    }
}

impl TryFrom<String> for LogicalType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("unknown column type '{}'", value))
    }
}

impl From<LogicalType> for String {
    fn from(value: LogicalType) -> Self {
        value.to_string()
    }
}

/// What a column means within its table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnRole {
    /// Part of a dimension's natural key
    NaturalKey,

    /// Descriptive dimension column
    Attribute,

    /// Fact measure or degenerate attribute
    Metric,

    /// Fact column holding a dimension's surrogate key
    DimensionKey,
}

/// A column in a schema definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Column name
    pub name: String,

    /// Logical type
    pub logical_type: LogicalType,

    /// Whether NULL is allowed
    pub nullable: bool,

    /// Value used when a row carries none
    pub default: Option<Value>,

    /// Role within the table
    pub role: ColumnRole,
}

impl Column {
    /// Create a new non-nullable column without default
    pub fn new(name: impl Into<String>, logical_type: LogicalType, role: ColumnRole) -> Self {
        Self {
            name: name.into(),
            logical_type,
            nullable: false,
            default: None,
            role,
        }
    }

    /// Set nullability
    pub fn with_nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    /// Set default value
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// Tagged variant distinguishing the two table kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaKind {
    Fact,
    Dimension,
}

impl std::fmt::Display for SchemaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fact => write!(f, "fact"),
            Self::Dimension => write!(f, "dimension"),
        }
    }
}

/// Maps one field of the referencing row onto one natural-key column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMapping {
    /// Natural-key column of the referenced dimension
    pub natural_key: String,

    /// Field of the referencing row supplying the value
    pub field: String,
}

/// Reference from a fact (or dimension) to a dimension
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionReference {
    /// Reference name, unique within the referencing schema
    pub name: String,

    /// Referenced dimension
    pub dimension: String,

    /// Column receiving the surrogate key
    pub column: String,

    /// Field mapping, ordered like the dimension's natural key
    pub mapping: Vec<KeyMapping>,
}

impl DimensionReference {
    /// Fields of the referencing row consumed by this reference
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.mapping.iter().map(|m| m.field.as_str())
    }
}

/// Where a schema's rows come from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceSpec {
    /// Query against a named source database
    Sql { database: String, query: String },

    /// Literal rows declared alongside the schema
    Inline {
        rows: Vec<serde_json::Map<String, serde_json::Value>>,
    },

    /// JSON array or JSON-lines file
    Json { path: PathBuf },

    /// Rows produced by a registered generator
    Generator {
        name: String,
        #[serde(default)]
        params: BTreeMap<String, serde_json::Value>,
    },
}

impl SourceSpec {
    /// Short label for logs and errors
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sql { .. } => "sql",
            Self::Inline { .. } => "inline",
            Self::Json { .. } => "json",
            Self::Generator { .. } => "generator",
        }
    }
}

/// Comparison used by filter expansions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Equals,
    NotEquals,
    NotNull,
}

/// Declarative expansion stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExpansionSpec {
    Rename { from: String, to: String },
    Drop { columns: Vec<String> },
    Set { column: String, value: serde_json::Value },
    Copy { from: String, to: String },
    Cast { column: String, to: LogicalType },
    Template { column: String, template: String },
    Filter {
        column: String,
        op: FilterOp,
        #[serde(default)]
        value: Option<serde_json::Value>,
    },
    Custom { name: String },
}

/// External command run around a fact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Pre-/post-run hooks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hooks {
    #[serde(default)]
    pub pre: Option<HookSpec>,
    #[serde(default)]
    pub post: Option<HookSpec>,
}

impl Hooks {
    /// Fill unset hooks from defaults
    pub fn or(&self, defaults: &Hooks) -> Hooks {
        Hooks {
            pre: self.pre.clone().or_else(|| defaults.pre.clone()),
            post: self.post.clone().or_else(|| defaults.post.clone()),
        }
    }
}

/// What happens when a fact row collides with the declared unique key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Fail the batch with the offending key
    #[default]
    Reject,

    /// Keep the existing row and skip the new one
    Skip,
}

/// A validated fact or dimension definition
///
/// Built once by the schema loader and never mutated during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    /// Schema (and table) name
    pub name: String,

    /// Fact or dimension
    pub kind: SchemaKind,

    /// Ordered columns, excluding the surrogate key
    pub columns: Vec<Column>,

    /// Unique key columns (the natural key for dimensions)
    pub unique_key: Vec<String>,

    /// Row source, if any
    pub source: Option<SourceSpec>,

    /// Expansion stages applied after extraction
    pub expansions: Vec<ExpansionSpec>,

    /// Dimension references
    pub references: Vec<DimensionReference>,

    /// Duplicate handling for facts
    pub on_duplicate: DuplicatePolicy,

    /// Hooks around a fact run
    pub hooks: Hooks,
}

impl SchemaDefinition {
    /// Warehouse table name
    pub fn table(&self) -> &str {
        &self.name
    }

    pub fn is_fact(&self) -> bool {
        self.kind == SchemaKind::Fact
    }

    pub fn is_dimension(&self) -> bool {
        self.kind == SchemaKind::Dimension
    }

    /// Find a column by name
    pub fn find_column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Get column names
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Natural-key columns in key order (empty for facts)
    pub fn natural_key(&self) -> Vec<&Column> {
        self.unique_key
            .iter()
            .filter_map(|name| self.find_column(name))
            .filter(|c| c.role == ColumnRole::NaturalKey)
            .collect()
    }

    /// Natural-key column names in key order
    pub fn natural_key_names(&self) -> Vec<String> {
        self.natural_key().iter().map(|c| c.name.clone()).collect()
    }

    /// Columns that are neither keys nor surrogate references
    pub fn measure_columns(&self) -> Vec<&Column> {
        self.columns
            .iter()
            .filter(|c| matches!(c.role, ColumnRole::Metric | ColumnRole::Attribute))
            .collect()
    }

    /// Find a reference by name
    pub fn find_reference(&self, name: &str) -> Option<&DimensionReference> {
        self.references.iter().find(|r| r.name == name)
    }

    /// Stable SHA-256 fingerprint of the definition
    pub fn fingerprint(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&json))
    }
}
