//! Error types for the Starload core.
//!
//! Uses `thiserror` for public API error types with structured error variants
//! covering the external ports, graph construction, task execution, data
//! quality, configuration, and pipeline definitions.

use crate::quality::EvaluationReport;
use std::path::PathBuf;

/// Top-level error type for the Starload core library.
#[derive(Debug, thiserror::Error)]
pub enum StarloadError {
    #[error("Port error: {0}")]
    Port(#[from] PortError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Quality error: {0}")]
    Quality(#[from] QualityError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by the SQL execution and source credential ports.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    #[error("SQL execution failed on '{table}': {message}")]
    Sql { table: String, message: String },

    #[error("Credential resolution failed for '{credential_ref}': {message}")]
    Credential {
        credential_ref: String,
        message: String,
    },

    #[error("Warehouse connection failed: {message}")]
    Connection { message: String },
}

/// Errors from building a task graph. All of them are fatal and abort before
/// any run starts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("Cycle detected: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("Edge {from} -> {to} references unknown task '{missing}'")]
    DanglingEdge {
        from: String,
        to: String,
        missing: String,
    },

    #[error("Duplicate task name: '{name}'")]
    DuplicateTask { name: String },

    #[error("Task name '{name}' is reserved for the graph boundary")]
    ReservedName { name: String },

    #[error("Graph has no tasks")]
    EmptyGraph,
}

/// Errors from a single attempt of a task body.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    #[error(transparent)]
    Port(#[from] PortError),

    #[error("Template error: {message}")]
    Template { message: String },

    #[error(transparent)]
    Quality(#[from] QualityError),

    #[error("Task was cancelled")]
    Cancelled,
}

impl TaskError {
    /// Whether re-running the same task with identical parameters could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            TaskError::Port(_) => true,
            TaskError::Template { .. } => false,
            TaskError::Quality(QualityError::ChecksFailed { report }) => report.has_port_errors(),
            TaskError::Cancelled => false,
        }
    }
}

/// The single aggregated error surfaced by the data quality engine after
/// every rule has run.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QualityError {
    #[error("Data quality check failed: {} of {} rules failed", .report.failure_count(), .report.results.len())]
    ChecksFailed { report: EvaluationReport },
}

impl QualityError {
    pub fn report(&self) -> &EvaluationReport {
        match self {
            QualityError::ChecksFailed { report } => report,
        }
    }
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// Errors from pipeline definitions and runs.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Pipeline parse error: {message}")]
    ParseError { message: String },

    #[error("Pipeline validation failed: {message}")]
    ValidationFailed { message: String },

    #[error("Unknown built-in pipeline: {name}")]
    UnknownBuiltin { name: String },

    #[error("Run failed: {} task(s) did not succeed ({})", .failed.len(), .failed.join(", "))]
    RunFailed { failed: Vec<String> },
}

/// A type alias for results using the top-level `StarloadError`.
pub type Result<T> = std::result::Result<T, StarloadError>;
