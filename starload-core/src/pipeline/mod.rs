//! Pipeline engine for Starload.
//!
//! Declarative YAML pipelines are turned into an immutable task graph and
//! executed by a concurrent dispatch loop with retries, upstream-failure
//! propagation, and cancellation.

pub mod builtins;
pub mod executor;
pub mod graph;
pub mod parser;
pub mod strategies;
pub mod templates;
pub mod types;

pub use builtins::{all_builtins, get_builtin, list_builtin_names};
pub use executor::{PipelineExecutor, TaskOutput};
pub use graph::{BEGIN, END, Edge, TaskGraph};
pub use parser::{parse_pipeline, validate_pipeline};
pub use strategies::{SqlRequest, dimension_request, fact_request, stage_request};
pub use templates::RunContext;
pub use types::{
    Backoff, DimensionParams, FactParams, OperationKind, PipelineDefinition, QualityParams,
    RetryPolicy, RunState, RunStatus, StageParams, Task, TaskOperation, TaskRecord, TaskSpec,
    TaskStatus, Transition,
};
