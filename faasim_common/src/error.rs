//! Error types shared across the faasim workspace.
//!
//! Startup concerns (configuration, workload files, model artifacts,
//! result output) are recoverable `Result`s and surface through these
//! enums. Invariant violations inside the simulation itself are not
//! represented here: they abort the run (see the engine crate).

use std::path::PathBuf;

/// Configuration loading/override/validation error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// TOML parse error (includes unknown keys).
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Parameter out of bounds.
    #[error("config validation: {0}")]
    Validation(String),

    /// `--config.<section>.<KEY>` override referencing an unknown key.
    #[error("unknown config override: {0}")]
    UnknownOverride(String),

    /// Override value failed to parse for the target key.
    #[error("bad value for {key}: {value:?}")]
    BadOverrideValue { key: String, value: String },
}

/// Workload loading error (workflow JSON, DAG bundles, invocation traces).
#[derive(Debug, thiserror::Error)]
pub enum WorkloadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("workflow parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invocation trace error: {0}")]
    Trace(#[from] csv::Error),

    /// A workflow graph contains a cycle.
    #[error("task DAG {0} is cyclic")]
    CyclicDag(String),

    /// A DAG does not have exactly one root.
    #[error("task DAG {0} has {1} roots (expected 1)")]
    BadRootCount(String, usize),

    #[error("workload path is invalid: {0}")]
    BadPath(PathBuf),

    /// Unsupported synthetic DAG dimensions.
    #[error("invalid DAG dimensions: {0}")]
    BadDimensions(String),
}

/// Result CSV writing error.
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("failed to create {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("csv write error: {0}")]
    Csv(#[from] csv::Error),
}

/// Harvest-VM model artifact error.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("model parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("survival model has no points")]
    EmptySurvivalModel,

    #[error("cores table is empty")]
    EmptyCoresTable,
}
