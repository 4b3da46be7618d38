use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use stellate_core::{Config, ConfigError, RunSummary, SchemaError, SchemaKind};
use stellate_engine::{Engine, Reconciliation, RunError};
use stellate_schema::Catalog;
use stellate_warehouse::{connect_source, connect_warehouse, WarehouseError};

/// Stellate - declarative star-schema loading
#[derive(Parser)]
#[command(name = "stellate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, default_value = "stellate.toml")]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract, resolve and load facts
    Run {
        /// Facts to run, or `all`
        #[arg(required = true)]
        facts: Vec<String>,

        /// Facts run concurrently (default: run.jobs from the config)
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Write the run summary as JSON
        #[arg(short, long)]
        report: Option<PathBuf>,
    },

    /// Create or extend the tables of facts and dimensions without loading
    Build {
        /// Schemas to build, or `all`
        #[arg(required = true)]
        schemas: Vec<String>,
    },

    /// Print (or apply) the reporting view of a fact
    View {
        fact: String,

        /// Create or replace the view in the warehouse
        #[arg(long)]
        apply: bool,
    },

    /// Validate configuration and definitions
    Check,

    /// List declared facts and dimensions
    List,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // A missing .env file is fine
    dotenvy::dotenv().ok();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let code = match execute(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            exit_code(&e)
        }
    };
    std::process::exit(code);
}

async fn execute(cli: Cli) -> Result<i32> {
    let config = Config::from_file(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    let catalog = Catalog::from_paths(&config.definition_paths())?;

    if cli.verbose {
        eprintln!(
            "{} {} dimensions, {} facts",
            "Loaded".cyan(),
            catalog.dimensions().count(),
            catalog.facts().count()
        );
    }

    match cli.command {
        Commands::Run {
            facts,
            jobs,
            report,
        } => {
            let engine = engine(&config, catalog).await?;
            run_command(&engine, &facts, jobs.unwrap_or(config.run.jobs), report.as_deref()).await
        }
        Commands::Build { schemas } => {
            let engine = engine(&config, catalog).await?;
            build_command(&engine, &schemas).await
        }
        Commands::View { fact, apply } => view_command(&config, catalog, &fact, apply).await,
        Commands::Check => check_command(&config, &catalog).await,
        Commands::List => {
            list_command(&catalog);
            Ok(0)
        }
    }
}

/// Engine wired to the configured warehouse and source databases
async fn engine(config: &Config, catalog: Catalog) -> Result<Engine> {
    let warehouse_config = config.warehouse.as_ref().ok_or_else(|| {
        ConfigError::MissingValue(
            "No warehouse configured. Add a [warehouse] section to stellate.toml.".to_string(),
        )
    })?;
    let warehouse = connect_warehouse(warehouse_config).await?;

    let mut engine = Engine::new(Arc::new(catalog), warehouse)
        .with_run_config(config.run.clone())
        .with_default_hooks(config.hooks.clone())
        .with_base_dir(&config.project_root);

    for (name, database) in &config.databases {
        let connection = connect_source(name, database).await?;
        tracing::debug!(database = %name, "Registered source database");
        engine = engine.with_connection(name, connection);
    }
    Ok(engine)
}

async fn run_command(
    engine: &Engine,
    selectors: &[String],
    jobs: usize,
    report: Option<&Path>,
) -> Result<i32> {
    let (facts, unknown) = engine.catalog().select_facts(selectors);
    for name in &unknown {
        eprintln!("{} unknown fact '{}', skipping", "warning:".yellow().bold(), name);
    }
    if facts.is_empty() {
        return Err(SchemaError::UnknownSchema {
            name: selectors.join(", "),
        }
        .into());
    }

    let summary = engine.run_many(&facts, jobs).await;

    if let Some(path) = report {
        summary.save_to_file(path)?;
        eprintln!("{} {}", "Run summary saved to:".green(), path.display());
    }

    print_run_summary(&summary);
    Ok(summary.exit_code())
}

async fn build_command(engine: &Engine, selectors: &[String]) -> Result<i32> {
    let names: Vec<String> = if selectors.iter().any(|s| s == stellate_schema::ALL_FACTS) {
        engine
            .catalog()
            .dimensions()
            .chain(engine.catalog().facts())
            .map(|s| s.name.clone())
            .collect()
    } else {
        selectors.to_vec()
    };

    let mut seen = std::collections::BTreeSet::new();
    for name in &names {
        for outcome in engine.build(name).await? {
            if seen.insert(outcome.table.clone()) {
                print_reconciliation(&outcome);
            }
        }
    }
    Ok(0)
}

async fn view_command(config: &Config, catalog: Catalog, fact: &str, apply: bool) -> Result<i32> {
    if !apply {
        let schema = catalog.schema(fact)?;
        println!("{};", stellate_engine::view::generate(schema, &catalog)?);
        return Ok(0);
    }

    let engine = engine(config, catalog).await?;
    let name = engine.apply_view(fact).await?;
    println!("{} {}", "✓ Replaced view".green().bold(), name);
    Ok(0)
}

async fn check_command(config: &Config, catalog: &Catalog) -> Result<i32> {
    println!("{}", "Definitions OK".green().bold());

    for fact in catalog.facts() {
        let order: Vec<String> = catalog
            .resolution_order(&fact.name)?
            .iter()
            .map(|s| s.name.clone())
            .collect();
        println!("  {} {}", fact.name.bold(), order.join(" -> ").dimmed());
    }

    if let Some(warehouse) = &config.warehouse {
        let warehouse = connect_warehouse(warehouse).await?;
        warehouse.test_connection().await?;
        println!("{} {}", "Warehouse reachable:".green().bold(), warehouse.name());
    } else {
        println!("{}", "No warehouse configured".yellow());
    }

    for (name, database) in &config.databases {
        connect_source(name, database).await?;
        println!("{} {}", "Source reachable:".green().bold(), name);
    }

    Ok(0)
}

fn list_command(catalog: &Catalog) {
    for schema in catalog.dimensions().chain(catalog.facts()) {
        let kind = match schema.kind {
            SchemaKind::Dimension => "dimension".cyan(),
            SchemaKind::Fact => "fact".magenta(),
        };
        println!("{} {}", kind, schema.name.bold());

        for column in &schema.columns {
            println!("    {:<24} {}", column.name, column.logical_type.to_string().dimmed());
        }
        for reference in &schema.references {
            println!("    {} {} -> {}", "ref".dimmed(), reference.name, reference.dimension);
        }
    }
}

fn print_reconciliation(outcome: &Reconciliation) {
    if outcome.created {
        println!("  {} {}", "created".green(), outcome.table);
    } else if outcome.changed() {
        let mut changes = outcome.added.clone();
        if outcome.unique_key_added {
            changes.push("unique key".to_string());
        }
        println!(
            "  {} {} ({})",
            "altered".yellow(),
            outcome.table,
            changes.join(", ")
        );
    } else {
        println!("  {} {}", "unchanged".dimmed(), outcome.table);
    }

    for drift in &outcome.drift {
        println!("    {} {}", "drift:".yellow(), drift);
    }
}

/// Print run summary to stdout
fn print_run_summary(summary: &RunSummary) {
    println!("\n{}", "=".repeat(60).bright_blue());
    println!("{}", "Stellate Run Summary".bold().bright_blue());
    println!("{}", "=".repeat(60).bright_blue());
    println!();

    for run in &summary.runs {
        println!("{} {}", "✓".green().bold(), run.fact.bold());
        println!(
            "    extracted {}, expanded {}, inserted {}, skipped {}",
            run.extracted, run.expanded, run.fact_rows.inserted, run.fact_rows.skipped
        );
        for dimension in &run.dimensions {
            println!(
                "    {:<24} keys {}, cache hits {}, lookups {}, inserted {}",
                dimension.dimension,
                dimension.keys,
                dimension.cache_hits,
                dimension.lookups,
                dimension.inserted
            );
        }
    }

    if !summary.failures.is_empty() {
        println!();
        println!("{}", "Failures:".bold());
        for failure in &summary.failures {
            println!(
                "  [{}] {}: {}",
                format!("exit {}", failure.exit_code).red().bold(),
                failure.fact,
                failure.error
            );
        }
    }

    println!();
    let totals = format!(
        "{} succeeded, {} failed",
        summary.runs.len(),
        summary.failures.len()
    );
    if summary.has_failures() {
        println!("{}", totals.red().bold());
    } else {
        println!("{}", totals.green().bold());
    }
    println!("{}", "=".repeat(60).bright_blue());
}

/// Exit code for an error that ended the command
fn exit_code(error: &anyhow::Error) -> i32 {
    if let Some(run) = error.downcast_ref::<RunError>() {
        return run.exit_code();
    }
    if error.downcast_ref::<WarehouseError>().is_some() {
        return 6;
    }
    // Configuration, definitions and anything else
    2
}
