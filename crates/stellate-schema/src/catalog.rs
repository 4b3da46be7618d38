//! Validated set of schemas with dependency ordering

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use stellate_core::{SchemaDefinition, SchemaError, SchemaKind};

use crate::dag::DependencyGraph;
use crate::definitions::{DefinitionError, DefinitionFile};
use crate::loader::SchemaLoader;

/// Selector that expands to every declared fact
pub const ALL_FACTS: &str = "all";

/// All validated schemas of a project
#[derive(Debug, Clone)]
pub struct Catalog {
    schemas: BTreeMap<String, SchemaDefinition>,
    graph: DependencyGraph,
}

impl Catalog {
    /// Validate a full definition set
    ///
    /// Rejects dependency cycles among dimensions.
    pub fn load(file: &DefinitionFile) -> Result<Self, SchemaError> {
        let loader = SchemaLoader::new(file)?;
        let definitions = loader.load_all()?;

        let graph = DependencyGraph::from_definitions(&definitions);
        if graph.topological_sort().is_none() {
            let path = graph.find_cycle().unwrap_or_default();
            return Err(SchemaError::Cycle { path });
        }

        let schemas = definitions
            .into_iter()
            .map(|definition| (definition.name.clone(), definition))
            .collect();

        Ok(Self { schemas, graph })
    }

    /// Parse and validate definition files
    pub fn from_paths(paths: &[PathBuf]) -> Result<Self, DefinitionError> {
        let files = paths
            .iter()
            .map(|path| DefinitionFile::from_file(path))
            .collect::<Result<Vec<_>, _>>()?;

        let catalog = Self::load(&DefinitionFile::merge(files))?;
        tracing::info!(
            files = paths.len(),
            facts = catalog.facts().count(),
            dimensions = catalog.dimensions().count(),
            "Loaded schema definitions"
        );
        Ok(catalog)
    }

    /// Build a catalog from already-validated definitions
    pub fn from_definitions(definitions: Vec<SchemaDefinition>) -> Result<Self, SchemaError> {
        let mut schemas = BTreeMap::new();
        for definition in definitions {
            if schemas.contains_key(&definition.name) {
                return Err(SchemaError::DuplicateSchema {
                    name: definition.name,
                });
            }
            schemas.insert(definition.name.clone(), definition);
        }

        let graph = DependencyGraph::from_definitions(schemas.values());
        if graph.topological_sort().is_none() {
            let path = graph.find_cycle().unwrap_or_default();
            return Err(SchemaError::Cycle { path });
        }

        Ok(Self { schemas, graph })
    }

    /// Look up a schema by name
    pub fn get(&self, name: &str) -> Option<&SchemaDefinition> {
        self.schemas.get(name)
    }

    /// Look up a schema, failing for unknown names
    pub fn schema(&self, name: &str) -> Result<&SchemaDefinition, SchemaError> {
        self.get(name).ok_or_else(|| SchemaError::UnknownSchema {
            name: name.to_string(),
        })
    }

    /// Facts, sorted by name
    pub fn facts(&self) -> impl Iterator<Item = &SchemaDefinition> {
        self.schemas.values().filter(|s| s.kind == SchemaKind::Fact)
    }

    /// Dimensions, sorted by name
    pub fn dimensions(&self) -> impl Iterator<Item = &SchemaDefinition> {
        self.schemas.values().filter(|s| s.kind == SchemaKind::Dimension)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Reference graph between schemas
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// The schema and every dimension it reaches, dependencies first
    ///
    /// The named schema is always last. Ties are broken by name, so the
    /// order is stable across runs.
    pub fn resolution_order(&self, name: &str) -> Result<Vec<&SchemaDefinition>, SchemaError> {
        self.schema(name)?;

        let mut closure: BTreeSet<String> = self.graph.upstream(name).into_iter().collect();
        closure.insert(name.to_string());

        let order = self.graph.topological_sort().ok_or_else(|| SchemaError::Cycle {
            path: self.graph.find_cycle().unwrap_or_default(),
        })?;

        order
            .iter()
            .filter(|node| closure.contains(*node))
            .map(|node| self.schema(node))
            .collect()
    }

    /// Expand fact selectors into known fact names
    ///
    /// `all` selects every fact. Duplicates are removed while keeping the
    /// first occurrence. Returns `(facts, unknown)`.
    pub fn select_facts(&self, selectors: &[String]) -> (Vec<String>, Vec<String>) {
        let mut selected = Vec::new();
        let mut unknown = Vec::new();
        let mut seen = BTreeSet::new();

        for selector in selectors {
            let names: Vec<String> = if selector == ALL_FACTS {
                self.facts().map(|f| f.name.clone()).collect()
            } else if self.get(selector).map_or(false, |s| s.is_fact()) {
                vec![selector.clone()]
            } else {
                tracing::debug!(fact = %selector, "Skipping unknown fact");
                unknown.push(selector.clone());
                continue;
            };

            for name in names {
                if seen.insert(name.clone()) {
                    selected.push(name);
                }
            }
        }

        (selected, unknown)
    }
}
