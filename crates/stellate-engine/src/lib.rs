//! Stellate engine
//!
//! Runs declared facts end to end:
//! - Source extraction and the calendar generator
//! - Expansion pipelines
//! - Additive table materialization
//! - Dimension resolution with a per-run surrogate key cache
//! - Fact loading under a duplicate policy
//! - Reporting views and run hooks

pub mod error;
pub mod source;
pub mod calendar;
pub mod expansion;
pub mod materializer;
pub mod resolver;
pub mod loader;
pub mod view;
pub mod hooks;
pub mod runner;

pub use error::RunError;
pub use source::{RowGenerator, SourceRegistry};
pub use calendar::CalendarGenerator;
pub use expansion::{Expansion, ExpansionRegistry, Pipeline};
pub use materializer::{ColumnDrift, Materializer, Reconciliation};
pub use resolver::{ResolutionPlan, Resolver, SurrogateKeyCache};
pub use loader::FactLoader;
pub use hooks::{run_hook, HookStage};
pub use runner::Engine;
