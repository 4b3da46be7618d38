//! Fact runs
//!
//! A run executes one fact and its dimension closure as a strictly
//! sequential pipeline:
//!
//! 1. pre hook
//! 2. extract and expand every schema in the closure
//! 3. plan dimension rows (pure, fails before any write)
//! 4. materialize tables, dimensions first
//! 5. resolve surrogate keys, inserting missing dimension rows
//! 6. load the fact batch
//! 7. post hook
//!
//! Independent facts can run concurrently through [`Engine::run_many`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use stellate_core::{Hooks, RunConfig, RunFailure, RunReport, RunSummary};
use stellate_schema::Catalog;
use stellate_warehouse::{Connection, Warehouse};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::error::{load_error, RunError};
use crate::expansion::{Expansion, ExpansionRegistry, Pipeline};
use crate::hooks::{run_hook, HookStage};
use crate::loader::FactLoader;
use crate::materializer::{Materializer, Reconciliation};
use crate::resolver::{ResolutionPlan, Resolver, SurrogateKeyCache};
use crate::source::{RowGenerator, SourceRegistry};
use crate::view;

/// Runs facts of a catalog against a warehouse
#[derive(Clone)]
pub struct Engine {
    catalog: Arc<Catalog>,
    warehouse: Arc<dyn Warehouse>,
    sources: SourceRegistry,
    expansions: ExpansionRegistry,
    run: RunConfig,
    hooks: Hooks,
}

impl Engine {
    pub fn new(catalog: Arc<Catalog>, warehouse: Arc<dyn Warehouse>) -> Self {
        Self {
            catalog,
            warehouse,
            sources: SourceRegistry::new(),
            expansions: ExpansionRegistry::new(),
            run: RunConfig::default(),
            hooks: Hooks::default(),
        }
    }

    /// Register a named source database
    pub fn with_connection(mut self, name: impl Into<String>, connection: Arc<dyn Connection>) -> Self {
        self.sources.add_connection(name, connection);
        self
    }

    /// Register a row generator
    pub fn with_generator(mut self, generator: Arc<dyn RowGenerator>) -> Self {
        self.sources.add_generator(generator);
        self
    }

    /// Register a custom expansion
    pub fn with_expansion(mut self, expansion: Arc<dyn Expansion>) -> Self {
        self.expansions.register(expansion);
        self
    }

    pub fn with_run_config(mut self, run: RunConfig) -> Self {
        self.run = run;
        self
    }

    /// Hooks used by facts that don't declare their own
    pub fn with_default_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Directory relative `json` source paths are read from
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.sources.set_base_dir(dir);
        self
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn warehouse(&self) -> &dyn Warehouse {
        self.warehouse.as_ref()
    }

    /// Run one schema and its dimension closure
    ///
    /// Usually a fact; running a dimension loads it and the dimensions it
    /// references.
    pub async fn run_fact(&self, name: &str) -> Result<RunReport, RunError> {
        let target = self.catalog.schema(name)?;
        let hooks = target.hooks.or(&self.hooks);
        let mut report = RunReport::new(&target.name, target.fingerprint());
        tracing::info!(fact = %target.name, "Starting run");

        if let Some(hook) = &hooks.pre {
            run_hook(HookStage::Pre, hook, &target.name).await?;
        }

        let order = self.catalog.resolution_order(name)?;
        let names: Vec<String> = order.iter().map(|s| s.name.clone()).collect();

        let mut buffers = HashMap::new();
        for schema in &order {
            if schema.source.is_none() {
                continue;
            }
            let extracted = self.sources.extract(schema).await?;
            let extracted_rows = extracted.len();

            let expanded = Pipeline::for_schema(schema, &self.expansions)?.run(extracted)?;
            if schema.name == target.name {
                report.extracted = extracted_rows;
                report.expanded = expanded.len();
            }
            buffers.insert(schema.name.clone(), expanded);
        }

        let plan = ResolutionPlan::build(order, buffers)?;

        Materializer::new(self.warehouse.as_ref())
            .ensure_closure(&self.catalog, name)
            .await?;

        let mut cache = SurrogateKeyCache::new();
        let rows = Resolver::new(self.warehouse.as_ref(), self.run.conflict_retries)
            .execute(plan, &mut cache)
            .await?;

        let stats = cache.stats();
        report.dimensions = names
            .iter()
            .filter_map(|n| stats.iter().find(|s| &s.dimension == n).cloned())
            .collect();

        if target.is_fact() {
            report.fact_rows = FactLoader::new(self.warehouse.as_ref())
                .load(target, rows)
                .await?;
        }

        if let Some(hook) = &hooks.post {
            run_hook(HookStage::Post, hook, &target.name).await?;
        }

        report.finish();
        tracing::info!(
            fact = %target.name,
            extracted = report.extracted,
            dimension_rows = report.dimension_rows_inserted(),
            fact_rows = report.fact_rows.inserted,
            "Run complete"
        );
        Ok(report)
    }

    /// Materialize a schema's tables without loading anything
    pub async fn build(&self, name: &str) -> Result<Vec<Reconciliation>, RunError> {
        Materializer::new(self.warehouse.as_ref())
            .ensure_closure(&self.catalog, name)
            .await
    }

    /// `CREATE OR REPLACE VIEW` text for a fact
    pub fn view(&self, name: &str) -> Result<String, RunError> {
        let fact = self.catalog.schema(name)?;
        Ok(view::generate(fact, &self.catalog)?)
    }

    /// Create or replace the reporting view of a fact
    pub async fn apply_view(&self, name: &str) -> Result<String, RunError> {
        let fact = self.catalog.schema(name)?;
        let view_name = view::view_name(fact);
        let select = view::view_select(fact, &self.catalog)?;

        self.warehouse
            .replace_view(&view_name, &select)
            .await
            .map_err(|e| load_error(&view_name, e))?;
        tracing::info!(fact = %fact.name, view = %view_name, "Replaced view");
        Ok(view_name)
    }

    /// Run several facts, at most `jobs` at a time
    ///
    /// Every fact runs to completion or failure independently. Reports and
    /// failures keep the order of `facts`.
    pub async fn run_many(&self, facts: &[String], jobs: usize) -> RunSummary {
        let semaphore = Arc::new(Semaphore::new(jobs.max(1)));
        let mut tasks = JoinSet::new();

        for (index, fact) in facts.iter().enumerate() {
            let engine = self.clone();
            let semaphore = semaphore.clone();
            let fact = fact.clone();
            tasks.spawn(async move {
                // The semaphore is never closed
                let _permit = semaphore.acquire_owned().await;
                let result = engine.run_fact(&fact).await;
                (index, fact, result)
            });
        }

        let mut results = Vec::with_capacity(facts.len());
        let mut summary = RunSummary::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::error!(error = %e, "Fact task aborted");
                    summary.failures.push(RunFailure {
                        fact: "<unknown>".to_string(),
                        error: e.to_string(),
                        exit_code: 1,
                    });
                }
            }
        }
        results.sort_by_key(|(index, _, _)| *index);

        for (_, fact, result) in results {
            match result {
                Ok(report) => summary.runs.push(report),
                Err(e) => {
                    tracing::error!(fact = %fact, class = e.class(), error = %e, "Run failed");
                    summary.failures.push(RunFailure {
                        fact,
                        error: e.to_string(),
                        exit_code: e.exit_code(),
                    });
                }
            }
        }
        summary
    }
}
