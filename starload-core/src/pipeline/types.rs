//! Pipeline type definitions for the Starload engine.
//!
//! Defines the core data structures: pipeline definitions, tasks and their
//! operation kinds, retry policies, per-task run records, and run state.

use crate::quality::{CountRule, EvaluationReport, NotNullRule};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// A complete pipeline definition parsed from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub defaults: PipelineDefaults,
    pub tasks: Vec<TaskSpec>,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// Pipeline-wide defaults applied to every task that does not override them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

/// A task as declared in a pipeline file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    #[serde(flatten)]
    pub operation: TaskOperation,
    /// Tasks that must succeed before this one starts.
    #[serde(default)]
    pub upstream: Vec<String>,
    /// Wire this task to `begin` even when it has upstream tasks.
    #[serde(default)]
    pub entry: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

/// The closed set of things a task can do, with kind-specific parameters.
///
/// `params` may be left out for `validate_quality` (configured rules apply)
/// and `no_op`; every other kind requires it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "kind",
    content = "params",
    rename_all = "snake_case",
    try_from = "RawOperation"
)]
pub enum TaskOperation {
    Stage(StageParams),
    LoadFact(FactParams),
    LoadDimension(DimensionParams),
    ValidateQuality(QualityParams),
    NoOp,
}

/// Wire shape of a task operation before its params are checked against the kind.
#[derive(Deserialize)]
struct RawOperation {
    kind: OperationKind,
    #[serde(default)]
    params: Option<serde_json::Value>,
}

impl TryFrom<RawOperation> for TaskOperation {
    type Error = String;

    fn try_from(raw: RawOperation) -> Result<Self, Self::Error> {
        fn params<T: DeserializeOwned>(
            kind: OperationKind,
            value: Option<serde_json::Value>,
        ) -> Result<T, String> {
            let value = value.ok_or_else(|| format!("task kind '{kind}' requires params"))?;
            serde_json::from_value(value).map_err(|e| format!("invalid params for '{kind}': {e}"))
        }

        let kind = raw.kind;
        Ok(match kind {
            OperationKind::Stage => TaskOperation::Stage(params(kind, raw.params)?),
            OperationKind::LoadFact => TaskOperation::LoadFact(params(kind, raw.params)?),
            OperationKind::LoadDimension => {
                TaskOperation::LoadDimension(params(kind, raw.params)?)
            }
            OperationKind::ValidateQuality => match raw.params {
                Some(value) => TaskOperation::ValidateQuality(params(kind, Some(value))?),
                None => TaskOperation::ValidateQuality(QualityParams::default()),
            },
            OperationKind::NoOp => TaskOperation::NoOp,
        })
    }
}

impl TaskOperation {
    pub fn kind(&self) -> OperationKind {
        match self {
            TaskOperation::Stage(_) => OperationKind::Stage,
            TaskOperation::LoadFact(_) => OperationKind::LoadFact,
            TaskOperation::LoadDimension(_) => OperationKind::LoadDimension,
            TaskOperation::ValidateQuality(_) => OperationKind::ValidateQuality,
            TaskOperation::NoOp => OperationKind::NoOp,
        }
    }

    /// Whether re-running the operation leaves the warehouse as a single run would.
    ///
    /// A fact append is the one operation that duplicates rows on retry.
    pub fn is_idempotent(&self) -> bool {
        !matches!(self, TaskOperation::LoadFact(_))
    }

    /// The table the operation writes to, if any.
    pub fn target_table(&self) -> Option<&str> {
        match self {
            TaskOperation::Stage(p) => Some(&p.table),
            TaskOperation::LoadFact(p) => Some(&p.table),
            TaskOperation::LoadDimension(p) => Some(&p.table),
            TaskOperation::ValidateQuality(_) | TaskOperation::NoOp => None,
        }
    }
}

/// Operation kind without its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Stage,
    LoadFact,
    LoadDimension,
    ValidateQuality,
    NoOp,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Stage => write!(f, "stage"),
            OperationKind::LoadFact => write!(f, "load_fact"),
            OperationKind::LoadDimension => write!(f, "load_dimension"),
            OperationKind::ValidateQuality => write!(f, "validate_quality"),
            OperationKind::NoOp => write!(f, "no_op"),
        }
    }
}

/// Bulk load from the object store into a staging table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageParams {
    pub table: String,
    /// Object key under the bucket; may contain run-time tokens such as
    /// `{{ execution_date.year }}`.
    pub source_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_ref: Option<String>,
}

/// Append the output of a transform query to a fact table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactParams {
    pub table: String,
    pub query: String,
}

/// Load a dimension table, replacing its content by default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionParams {
    pub table: String,
    pub query: String,
    #[serde(default = "default_replace")]
    pub replace: bool,
}

fn default_replace() -> bool {
    true
}

/// Rules for a validation task. Missing lists fall back to the configured
/// defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count_rules: Option<Vec<CountRule>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_null_rules: Option<Vec<NotNullRule>>,
}

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    #[default]
    Fixed,
    Exponential,
}

/// Per-task retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Always at least 1.
    pub max_attempts: u32,
    #[serde(rename = "delay_secs", with = "duration_secs")]
    pub delay: Duration,
    #[serde(default)]
    pub backoff: Backoff,
    #[serde(
        rename = "max_delay_secs",
        with = "duration_secs",
        default = "default_max_delay"
    )]
    pub max_delay: Duration,
}

fn default_max_delay() -> Duration {
    Duration::from_secs(3600)
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            backoff,
            max_delay: default_max_delay().max(delay),
        }
    }

    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Backoff::Fixed)
    }

    /// Delay to wait after the given (1-based) attempt failed.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential => {
                let exp = attempt.saturating_sub(1).min(31);
                self.delay
                    .checked_mul(1u32 << exp)
                    .unwrap_or(self.max_delay)
                    .min(self.max_delay)
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(4, Duration::from_secs(300), Backoff::Fixed)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// A unit of work in the task graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub name: String,
    pub operation: TaskOperation,
    pub retry: RetryPolicy,
    pub entry: bool,
}

impl Task {
    pub fn new(name: impl Into<String>, operation: TaskOperation) -> Self {
        Self {
            name: name.into(),
            operation,
            retry: RetryPolicy::no_retry(),
            entry: false,
        }
    }

    pub fn no_op(name: impl Into<String>) -> Self {
        Self::new(name, TaskOperation::NoOp)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn as_entry(mut self) -> Self {
        self.entry = true;
        self
    }
}

/// Execution state of a single task within a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Retrying,
    Success,
    Failed,
    UpstreamFailed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Success
                | TaskStatus::Failed
                | TaskStatus::UpstreamFailed
                | TaskStatus::Cancelled
        )
    }

    /// Terminal and not a success: blocks every downstream task.
    pub fn is_failure(self) -> bool {
        self.is_terminal() && self != TaskStatus::Success
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Retrying => write!(f, "retrying"),
            TaskStatus::Success => write!(f, "success"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::UpstreamFailed => write!(f, "upstream_failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What happened to one task during a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRecord {
    pub kind: Option<OperationKind>,
    pub status: TaskStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<EvaluationReport>,
}

/// One state change, in the order the engine applied it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub task: String,
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub at: DateTime<Utc>,
}

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Success => write!(f, "success"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// State of one run of a task graph. Discarded when the run concludes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: Uuid,
    pub pipeline: String,
    pub logical_date: DateTime<Utc>,
    pub status: RunStatus,
    pub tasks: BTreeMap<String, TaskRecord>,
    pub transitions: Vec<Transition>,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunState {
    /// Create a new run state for a fresh run.
    pub fn new(run_id: Uuid, pipeline: String, logical_date: DateTime<Utc>) -> Self {
        Self {
            run_id,
            pipeline,
            logical_date,
            status: RunStatus::Running,
            tasks: BTreeMap::new(),
            transitions: Vec::new(),
            cancelled: false,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn status_of(&self, task: &str) -> TaskStatus {
        self.tasks.get(task).map(|r| r.status).unwrap_or_default()
    }

    /// Move a task to a new status and log the transition.
    pub fn transition(&mut self, task: &str, to: TaskStatus) {
        let now = Utc::now();
        let record = self.tasks.entry(task.to_string()).or_default();
        let from = record.status;
        record.status = to;
        match to {
            TaskStatus::Running if record.started_at.is_none() => record.started_at = Some(now),
            s if s.is_terminal() => record.finished_at = Some(now),
            _ => {}
        }
        tracing::debug!(task, %from, %to, "Task transition");
        self.transitions.push(Transition {
            task: task.to_string(),
            from,
            to,
            at: now,
        });
    }

    /// Position of the first transition of `task` into `to`.
    pub fn transition_index(&self, task: &str, to: TaskStatus) -> Option<usize> {
        self.transitions
            .iter()
            .position(|t| t.task == task && t.to == to)
    }

    /// Names of every task that ended Failed, UpstreamFailed, or Cancelled.
    pub fn failed_tasks(&self) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|(_, r)| r.status.is_failure())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Settle the overall outcome: Success only if every task succeeded.
    pub fn finish(&mut self) {
        self.status = if self
            .tasks
            .values()
            .all(|r| r.status == TaskStatus::Success)
        {
            RunStatus::Success
        } else {
            RunStatus::Failed
        };
        self.finished_at = Some(Utc::now());
    }

    /// Collapse the run into the single top-level error when it failed.
    pub fn into_result(self) -> Result<RunState, crate::error::PipelineError> {
        if self.status == RunStatus::Success {
            Ok(self)
        } else {
            Err(crate::error::PipelineError::RunFailed {
                failed: self.failed_tasks(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_task_status_display() {
        assert_eq!(TaskStatus::Pending.to_string(), "pending");
        assert_eq!(TaskStatus::Retrying.to_string(), "retrying");
        assert_eq!(TaskStatus::UpstreamFailed.to_string(), "upstream_failed");
        assert_eq!(TaskStatus::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn test_task_status_terminal() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Retrying.is_terminal());
        assert!(TaskStatus::Success.is_terminal());
        assert!(!TaskStatus::Success.is_failure());
        assert!(TaskStatus::Failed.is_failure());
        assert!(TaskStatus::UpstreamFailed.is_failure());
        assert!(TaskStatus::Cancelled.is_failure());
    }

    #[test]
    fn test_operation_serde_adjacent_tag() {
        let op = TaskOperation::LoadDimension(DimensionParams {
            table: "public.users".into(),
            query: "SELECT 1".into(),
            replace: false,
        });
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["kind"], "load_dimension");
        assert_eq!(json["params"]["replace"], false);

        let noop: TaskOperation = serde_json::from_str(r#"{"kind":"no_op"}"#).unwrap();
        assert_eq!(noop, TaskOperation::NoOp);
    }

    #[test]
    fn test_validate_quality_params_are_optional() {
        let op: TaskOperation = serde_json::from_str(r#"{"kind":"validate_quality"}"#).unwrap();
        assert_eq!(op, TaskOperation::ValidateQuality(QualityParams::default()));

        let op: TaskOperation = serde_json::from_str(
            r#"{"kind":"validate_quality","params":{"not_null_rules":[{"table":"users","column":"userid"}]}}"#,
        )
        .unwrap();
        match op {
            TaskOperation::ValidateQuality(p) => {
                assert!(p.count_rules.is_none());
                assert_eq!(p.not_null_rules.unwrap().len(), 1);
            }
            other => panic!("Expected ValidateQuality, got {other:?}"),
        }
    }

    #[test]
    fn test_load_kinds_require_params() {
        let err = serde_json::from_str::<TaskOperation>(r#"{"kind":"load_fact"}"#).unwrap_err();
        assert!(err.to_string().contains("requires params"), "{err}");

        let err = serde_json::from_str::<TaskOperation>(
            r#"{"kind":"load_fact","params":{"table":"songplays"}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("query"), "{err}");
    }

    #[test]
    fn test_dimension_replace_defaults_to_true() {
        let op: TaskOperation = serde_json::from_str(
            r#"{"kind":"load_dimension","params":{"table":"users","query":"SELECT 1"}}"#,
        )
        .unwrap();
        match op {
            TaskOperation::LoadDimension(p) => assert!(p.replace),
            other => panic!("Expected LoadDimension, got {other:?}"),
        }
    }

    #[test]
    fn test_only_fact_append_is_not_idempotent() {
        let fact = TaskOperation::LoadFact(FactParams {
            table: "songplays".into(),
            query: "SELECT 1".into(),
        });
        assert!(!fact.is_idempotent());
        assert!(TaskOperation::NoOp.is_idempotent());
        assert_eq!(fact.target_table(), Some("songplays"));
        assert_eq!(fact.kind().to_string(), "load_fact");
    }

    #[test]
    fn test_retry_policy_fixed_delay() {
        let policy = RetryPolicy::new(4, Duration::from_secs(300), Backoff::Fixed);
        assert_eq!(policy.delay_after(1), Duration::from_secs(300));
        assert_eq!(policy.delay_after(3), Duration::from_secs(300));
    }

    #[test]
    fn test_retry_policy_exponential_is_capped() {
        let mut policy = RetryPolicy::new(10, Duration::from_secs(1), Backoff::Exponential);
        policy.max_delay = Duration::from_secs(32);
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(4), Duration::from_secs(8));
        assert_eq!(policy.delay_after(9), Duration::from_secs(32));
        assert_eq!(policy.delay_after(40), Duration::from_secs(32));
    }

    #[test]
    fn test_retry_policy_never_below_one_attempt() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO, Backoff::Fixed).max_attempts, 1);
    }

    #[test]
    fn test_retry_policy_deserialize_secs() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"max_attempts":3,"delay_secs":0.5,"backoff":"exponential"}"#)
                .unwrap();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay, Duration::from_millis(500));
        assert_eq!(policy.backoff, Backoff::Exponential);
        assert_eq!(policy.max_delay, Duration::from_secs(3600));
    }

    #[test]
    fn test_run_state_transitions_are_logged_in_order() {
        let mut state = RunState::new(Uuid::new_v4(), "p".into(), Utc::now());
        state.transition("a", TaskStatus::Running);
        state.transition("a", TaskStatus::Success);
        state.transition("b", TaskStatus::Running);

        assert_eq!(state.transitions.len(), 3);
        assert_eq!(state.transitions[0].from, TaskStatus::Pending);
        assert_eq!(state.transition_index("a", TaskStatus::Success), Some(1));
        assert!(state.tasks["a"].started_at.is_some());
        assert!(state.tasks["a"].finished_at.is_some());
        assert!(state.tasks["b"].finished_at.is_none());
    }

    #[test]
    fn test_run_state_finish_and_result() {
        let mut state = RunState::new(Uuid::new_v4(), "p".into(), Utc::now());
        state.transition("a", TaskStatus::Success);
        state.finish();
        assert_eq!(state.status, RunStatus::Success);
        assert!(state.into_result().is_ok());

        let mut state = RunState::new(Uuid::new_v4(), "p".into(), Utc::now());
        state.transition("a", TaskStatus::Success);
        state.transition("b", TaskStatus::Failed);
        state.transition("c", TaskStatus::UpstreamFailed);
        state.finish();
        assert_eq!(state.status, RunStatus::Failed);
        match state.into_result() {
            Err(crate::error::PipelineError::RunFailed { failed }) => {
                assert_eq!(failed, vec!["b".to_string(), "c".to_string()]);
            }
            other => panic!("Expected RunFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_task_spec_yaml_flattened_operation() {
        let yaml = r#"
name: load_user_dim
kind: load_dimension
params:
  table: public.users
  query: SELECT DISTINCT userid FROM staging_events
  replace: false
upstream: [load_songplays_fact]
"#;
        let spec: TaskSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.name, "load_user_dim");
        assert_eq!(spec.upstream, vec!["load_songplays_fact".to_string()]);
        match spec.operation {
            TaskOperation::LoadDimension(p) => {
                assert_eq!(p.table, "public.users");
                assert!(!p.replace);
            }
            other => panic!("Expected LoadDimension, got {other:?}"),
        }
    }
}
