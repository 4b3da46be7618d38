//! Configuration schema (stellate.toml)

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::schema::Hooks;

/// Kind of database behind a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    /// PostgreSQL
    Postgres,

    /// In-process store (tests, demos)
    Memory,
}

impl Default for ConnectionKind {
    fn default() -> Self {
        Self::Postgres
    }
}

/// Connection settings shared by the warehouse and source databases
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Database kind
    #[serde(rename = "type", default)]
    pub kind: ConnectionKind,

    /// Connection string (e.g. "host=localhost user=etl dbname=warehouse")
    #[serde(default)]
    pub connection: Option<String>,

    /// Environment variable holding the connection string
    #[serde(default)]
    pub connection_env: Option<String>,

    /// Use TLS
    #[serde(default)]
    pub tls: bool,

    /// Extra `key=value` options appended to the connection string
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl ConnectionConfig {
    /// Resolve the final connection string
    ///
    /// An explicit `connection` wins over `connection_env`.
    pub fn connection_string(&self) -> Result<String, ConfigError> {
        let base = match (&self.connection, &self.connection_env) {
            (Some(conn), _) => conn.clone(),
            (None, Some(var)) => std::env::var(var).map_err(|_| {
                ConfigError::MissingValue(format!("environment variable {} is not set", var))
            })?,
            (None, None) => {
                if self.kind == ConnectionKind::Memory {
                    String::new()
                } else {
                    return Err(ConfigError::MissingValue(
                        "connection or connection_env is required".to_string(),
                    ));
                }
            }
        };

        let mut parts = vec![base];
        parts.extend(self.options.iter().map(|(k, v)| format!("{}={}", k, v)));
        Ok(parts
            .into_iter()
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join(" "))
    }
}

/// Run tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Re-lookups after a dimension insert conflict
    #[serde(default = "default_conflict_retries")]
    pub conflict_retries: u32,

    /// Facts run concurrently
    #[serde(default = "default_jobs")]
    pub jobs: usize,
}

fn default_conflict_retries() -> u32 {
    3
}

fn default_jobs() -> usize {
    1
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            conflict_retries: default_conflict_retries(),
            jobs: default_jobs(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Definition files, relative to the config file
    #[serde(default)]
    pub definitions: Vec<PathBuf>,

    /// Target warehouse
    #[serde(default)]
    pub warehouse: Option<ConnectionConfig>,

    /// Named source databases
    #[serde(default)]
    pub databases: BTreeMap<String, ConnectionConfig>,

    /// Run tuning
    #[serde(default)]
    pub run: RunConfig,

    /// Default hooks for every fact
    #[serde(default)]
    pub hooks: Hooks,

    /// Project root path (for resolving relative paths)
    #[serde(skip)]
    pub project_root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            definitions: Vec::new(),
            warehouse: None,
            databases: BTreeMap::new(),
            run: RunConfig::default(),
            hooks: Hooks::default(),
            project_root: std::env::current_dir().unwrap_or_default(),
        }
    }
}

impl Config {
    /// Load config from TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let mut config = Self::from_toml(&contents)?;

        // Set project root to parent of config file
        if let Some(parent) = path.parent() {
            config.project_root = parent.to_path_buf();
        }

        Ok(config)
    }

    /// Load config from TOML string
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(toml).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Definition paths resolved against the project root
    pub fn definition_paths(&self) -> Vec<PathBuf> {
        self.definitions
            .iter()
            .map(|p| {
                if p.is_absolute() {
                    p.clone()
                } else {
                    self.project_root.join(p)
                }
            })
            .collect()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.run.jobs == 0 {
            return Err(ConfigError::InvalidValue("run.jobs must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Config error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Missing value: {0}")]
    MissingValue(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}
