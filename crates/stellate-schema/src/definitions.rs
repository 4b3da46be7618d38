//! Definition file parsing
//!
//! Parses the declarative fact/dimension files (TOML or JSON) into raw,
//! unvalidated records. Validation and normalization happen in
//! [`crate::loader`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use stellate_core::{DuplicatePolicy, ExpansionSpec, Hooks, SchemaError, SourceSpec};

/// One definition file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DefinitionFile {
    /// Dimension definitions (`[[dimension]]` in TOML)
    #[serde(default, rename = "dimension", alias = "dimensions")]
    pub dimensions: Vec<RawSchema>,

    /// Fact definitions (`[[fact]]` in TOML)
    #[serde(default, rename = "fact", alias = "facts")]
    pub facts: Vec<RawSchema>,
}

impl DefinitionFile {
    /// Load a definition file, choosing the format by extension
    pub fn from_file(path: &Path) -> Result<Self, DefinitionError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| DefinitionError::IoError(path.display().to_string(), e.to_string()))?;

        let parsed = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&contents),
            Some("json") => Self::from_json(&contents),
            _ => return Err(DefinitionError::UnsupportedFormat(path.display().to_string())),
        };

        parsed.map_err(|e| match e {
            DefinitionError::ParseError(_, msg) => {
                DefinitionError::ParseError(path.display().to_string(), msg)
            }
            other => other,
        })
    }

    /// Parse TOML definitions
    pub fn from_toml(toml: &str) -> Result<Self, DefinitionError> {
        toml::from_str(toml).map_err(|e| DefinitionError::ParseError("<toml>".into(), e.to_string()))
    }

    /// Parse JSON definitions
    pub fn from_json(json: &str) -> Result<Self, DefinitionError> {
        serde_json::from_str(json)
            .map_err(|e| DefinitionError::ParseError("<json>".into(), e.to_string()))
    }

    /// Merge several files into one
    pub fn merge(files: impl IntoIterator<Item = DefinitionFile>) -> Self {
        files.into_iter().fold(Self::default(), |mut acc, file| {
            acc.dimensions.extend(file.dimensions);
            acc.facts.extend(file.facts);
            acc
        })
    }
}

/// A fact or dimension as written in a definition file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawSchema {
    pub name: String,

    /// Natural-key columns (dimensions)
    #[serde(default)]
    pub natural_key: Vec<String>,

    #[serde(default)]
    pub columns: Vec<RawColumn>,

    /// Unique-key columns (facts); may name reference columns
    #[serde(default)]
    pub unique_key: Vec<String>,

    #[serde(default)]
    pub on_duplicate: DuplicatePolicy,

    #[serde(default)]
    pub source: Option<SourceSpec>,

    #[serde(default)]
    pub expansions: Vec<ExpansionSpec>,

    /// Dimension references
    #[serde(default)]
    pub dimensions: Vec<RawReference>,

    #[serde(default)]
    pub hooks: Hooks,
}

/// A column as written in a definition file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawColumn {
    pub name: String,

    /// Declared type, e.g. `decimal(12,2)`
    #[serde(rename = "type")]
    pub data_type: String,

    #[serde(default)]
    pub nullable: bool,

    #[serde(default)]
    pub default: Option<serde_json::Value>,
}

/// A dimension reference as written in a definition file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawReference {
    /// Reference name (defaults to the dimension name)
    #[serde(default)]
    pub name: Option<String>,

    /// Referenced dimension
    pub dimension: String,

    /// Column receiving the surrogate key (defaults to the reference name)
    #[serde(default)]
    pub column: Option<String>,

    /// Natural-key column -> source field
    #[serde(default)]
    pub fields: BTreeMap<String, String>,

    /// Shorthand for single-column natural keys
    #[serde(default)]
    pub field: Option<String>,
}

impl RawReference {
    /// Effective reference name
    pub fn reference_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.dimension)
    }
}

/// Definition parsing errors
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("Failed to read definition file {0}: {1}")]
    IoError(String, String),

    #[error("Failed to parse definitions in {0}: {1}")]
    ParseError(String, String),

    #[error("Unsupported definition format: {0} (expected .toml or .json)")]
    UnsupportedFormat(String),

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use stellate_core::LogicalType;

    const SALES: &str = r#"
[[dimension]]
name = "dim_store"
natural_key = ["store_code"]
columns = [
  { name = "store_code", type = "varchar" },
  { name = "name", type = "varchar", nullable = true },
]

[[fact]]
name = "fact_sales"
unique_key = ["store", "sale_date"]
on_duplicate = "skip"
source = { type = "sql", database = "shop", query = "SELECT * FROM sales" }
columns = [ { name = "amount", type = "decimal(12,2)" } ]
expansions = [
  { kind = "set", column = "currency", value = "EUR" },
  { kind = "cast", column = "amount", to = "decimal(12,2)" },
]

[[fact.dimensions]]
name = "store"
dimension = "dim_store"
fields = { store_code = "store_code" }
"#;

    #[test]
    fn parse_toml_definitions() {
        let file = DefinitionFile::from_toml(SALES).unwrap();
        assert_eq!(file.dimensions.len(), 1);
        assert_eq!(file.facts.len(), 1);

        let store = &file.dimensions[0];
        assert_eq!(store.natural_key, vec!["store_code"]);
        assert!(store.columns[1].nullable);

        let sales = &file.facts[0];
        assert_eq!(sales.on_duplicate, DuplicatePolicy::Skip);
        assert_eq!(sales.dimensions[0].reference_name(), "store");
        assert_eq!(sales.dimensions[0].fields["store_code"], "store_code");
        assert!(matches!(sales.source, Some(SourceSpec::Sql { .. })));
        assert_eq!(
            sales.expansions[1],
            ExpansionSpec::Cast {
                column: "amount".into(),
                to: LogicalType::Decimal { precision: Some(12), scale: Some(2) },
            }
        );
    }

    #[test]
    fn parse_json_definitions() {
        let file = DefinitionFile::from_json(
            r#"{
                "dimensions": [
                    {"name": "dim_date", "natural_key": ["date"],
                     "columns": [{"name": "date", "type": "date"}],
                     "source": {"type": "generator", "name": "calendar",
                                "params": {"start": "2024-01-01", "end": "2024-01-31"}}}
                ],
                "facts": []
            }"#,
        )
        .unwrap();

        assert_eq!(file.dimensions[0].name, "dim_date");
        assert!(matches!(
            file.dimensions[0].source,
            Some(SourceSpec::Generator { ref name, .. }) if name == "calendar"
        ));
    }

    #[test]
    fn reference_name_defaults_to_dimension() {
        let reference = RawReference {
            dimension: "dim_date".into(),
            field: Some("sale_date".into()),
            ..Default::default()
        };
        assert_eq!(reference.reference_name(), "dim_date");
    }

    #[test]
    fn file_format_by_extension() {
        let dir = tempfile::tempdir().unwrap();

        let toml_path = dir.path().join("schema.toml");
        std::fs::write(&toml_path, SALES).unwrap();
        assert_eq!(DefinitionFile::from_file(&toml_path).unwrap().facts.len(), 1);

        let yaml_path = dir.path().join("schema.yaml");
        std::fs::write(&yaml_path, "").unwrap();
        assert!(matches!(
            DefinitionFile::from_file(&yaml_path),
            Err(DefinitionError::UnsupportedFormat(_))
        ));

        let bad_path = dir.path().join("bad.toml");
        std::fs::write(&bad_path, "[[fact]]\nname = 1\n").unwrap();
        match DefinitionFile::from_file(&bad_path) {
            Err(DefinitionError::ParseError(path, _)) => assert!(path.ends_with("bad.toml")),
            other => panic!("expected parse error, got {:?}", other),
        }
    }
}
