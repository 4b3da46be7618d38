//! Run report schema (stable v1)
//!
//! This schema is STABLE and VERSIONED.
//! Breaking changes require a new version.

use serde::{Deserialize, Serialize};

/// Report schema version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportVersion {
    /// Major version (breaking changes)
    pub major: u32,

    /// Minor version (backward-compatible additions)
    pub minor: u32,
}

impl ReportVersion {
    /// Current report schema version
    pub const CURRENT: ReportVersion = ReportVersion { major: 1, minor: 0 };
}

impl std::fmt::Display for ReportVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Per-dimension resolution counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionStats {
    /// Dimension name
    pub dimension: String,

    /// Rows extracted from the dimension's own source
    pub extracted: usize,

    /// Distinct natural keys resolved
    pub keys: usize,

    /// Keys answered from the run cache
    pub cache_hits: usize,

    /// Warehouse lookups issued
    pub lookups: usize,

    /// Rows inserted
    pub inserted: usize,

    /// Lookups repeated after an insert conflict
    pub conflict_retries: usize,
}

/// Fact load counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactStats {
    /// Rows written
    pub inserted: usize,

    /// Rows skipped as duplicates
    pub skipped: usize,
}

/// Summary of one fact run (run.json v1)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Schema version
    pub version: ReportVersion,

    /// Fact name
    pub fact: String,

    /// SHA-256 of the fact definition
    pub fingerprint: String,

    /// Start timestamp (ISO 8601)
    pub started_at: String,

    /// End timestamp (ISO 8601)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,

    /// Rows extracted from the fact source
    pub extracted: usize,

    /// Rows left after expansions
    pub expanded: usize,

    /// Per-dimension counters, in resolution order
    pub dimensions: Vec<DimensionStats>,

    /// Fact load counters
    pub fact_rows: FactStats,
}

impl RunReport {
    /// Create a new report for a fact run starting now
    pub fn new(fact: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        Self {
            version: ReportVersion::CURRENT,
            fact: fact.into(),
            fingerprint: fingerprint.into(),
            started_at: chrono::Utc::now().to_rfc3339(),
            finished_at: None,
            extracted: 0,
            expanded: 0,
            dimensions: Vec::new(),
            fact_rows: FactStats::default(),
        }
    }

    /// Stamp the end time
    pub fn finish(&mut self) {
        self.finished_at = Some(chrono::Utc::now().to_rfc3339());
    }

    /// Counters for a dimension, if it took part in the run
    pub fn dimension(&self, name: &str) -> Option<&DimensionStats> {
        self.dimensions.iter().find(|d| d.dimension == name)
    }

    /// Total dimension rows inserted
    pub fn dimension_rows_inserted(&self) -> usize {
        self.dimensions.iter().map(|d| d.inserted).sum()
    }

    /// Serialize to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// A fact that failed during a multi-fact run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    /// Fact name
    pub fact: String,

    /// Error message
    pub error: String,

    /// Process exit code for the error class
    pub exit_code: i32,
}

/// Aggregated result of a multi-fact run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Schema version
    pub version: ReportVersion,

    /// Timestamp (ISO 8601)
    pub timestamp: String,

    /// Successful runs
    pub runs: Vec<RunReport>,

    /// Failed runs
    pub failures: Vec<RunFailure>,
}

impl RunSummary {
    /// Create a new empty summary
    pub fn new() -> Self {
        Self {
            version: ReportVersion::CURRENT,
            timestamp: chrono::Utc::now().to_rfc3339(),
            runs: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// Check if any fact failed
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Exit code of the first failure, or 0
    pub fn exit_code(&self) -> i32 {
        self.failures.first().map(|f| f.exit_code).unwrap_or(0)
    }

    /// Serialize to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Save to file
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<(), std::io::Error> {
        let json = self
            .to_json()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(path, json)
    }
}

impl Default for RunSummary {
    fn default() -> Self {
        Self::new()
    }
}
