//! # Starload Core
//!
//! Core library for the Starload batch-ETL orchestrator.
//! Provides the task graph, the execution engine, load strategies for
//! staging, fact and dimension tables, the data quality engine, the
//! warehouse and credential ports, configuration, and error types.

pub mod config;
pub mod credentials;
pub mod error;
pub mod pipeline;
pub mod ports;
pub mod quality;

// Re-export commonly used types at the crate root.
pub use config::{StarloadConfig, load_config};
pub use credentials::{
    CredentialProvider, Credentials, EnvCredentialProvider, KeyringCredentialProvider,
    StaticCredentialProvider,
};
pub use error::{
    ConfigError, GraphError, PipelineError, PortError, QualityError, Result, StarloadError,
    TaskError,
};
pub use pipeline::{PipelineExecutor, RunContext, RunState, RunStatus, TaskGraph, TaskStatus};
pub use ports::{DryRunWarehouse, SqlExecutor, Statement, StatementKind};
pub use quality::{CountRule, EvaluationReport, NotNullRule, QualityEngine, QualityRules};
