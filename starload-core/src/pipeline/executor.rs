//! Pipeline executor: drives every task of a graph through its state machine.
//!
//! A single dispatch loop owns the [`RunState`]. Task bodies run concurrently
//! on a `JoinSet`, one spawned future per attempt, and report back to the loop
//! which applies every state transition. Retry backoff is a deadline the loop
//! waits on, so cancellation interrupts it immediately.

use crate::config::{SourceConfig, StarloadConfig};
use crate::credentials::{CredentialProvider, Credentials};
use crate::error::{PortError, TaskError};
use crate::pipeline::graph::TaskGraph;
use crate::pipeline::strategies::{
    SqlRequest, dimension_request, fact_request, resolve_source, stage_request,
};
use crate::pipeline::templates::RunContext;
use crate::pipeline::types::{RunState, Task, TaskOperation, TaskStatus};
use crate::ports::SqlExecutor;
use crate::quality::{EvaluationReport, QualityEngine, QualityRules};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{Id, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Longest wait scheduled for a retry, used when a delay overflows the clock.
const MAX_RETRY_WAIT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// What a successful attempt produced.
#[derive(Debug, Clone, Default)]
pub struct TaskOutput {
    /// Number of statements executed.
    pub statements: usize,
    pub quality: Option<EvaluationReport>,
}

/// Result of one attempt, sent from the task body back to the dispatch loop.
struct Attempt {
    task: String,
    result: Result<TaskOutput, TaskError>,
}

/// Runs task bodies: dispatches on the operation kind.
#[derive(Clone)]
struct TaskRunner {
    sql: Arc<dyn SqlExecutor>,
    credentials: Arc<dyn CredentialProvider>,
    source: SourceConfig,
    quality: QualityRules,
}

impl TaskRunner {
    async fn run(&self, task: &Task, ctx: &RunContext) -> Result<TaskOutput, TaskError> {
        match &task.operation {
            TaskOperation::NoOp => Ok(TaskOutput::default()),
            TaskOperation::Stage(params) => {
                let source = resolve_source(params, &self.source, ctx)?;
                let credentials = self.resolve_credentials(&source.credential_ref).await?;
                info!(table = %params.table, uri = %source.uri, "Copying data from source to staging table");
                self.submit(stage_request(params, &source, &credentials))
                    .await
            }
            TaskOperation::LoadFact(params) => {
                info!(table = %params.table, "Loading fact table");
                self.submit(fact_request(params)).await
            }
            TaskOperation::LoadDimension(params) => {
                info!(table = %params.table, replace = params.replace, "Loading dimension table");
                self.submit(dimension_request(params)).await
            }
            TaskOperation::ValidateQuality(params) => {
                let count_rules = params
                    .count_rules
                    .as_deref()
                    .unwrap_or(&self.quality.count_rules);
                let not_null_rules = params
                    .not_null_rules
                    .as_deref()
                    .unwrap_or(&self.quality.not_null_rules);
                let report = QualityEngine::new(self.sql.clone())
                    .evaluate(count_rules, not_null_rules)
                    .await
                    .into_result()?;
                Ok(TaskOutput {
                    statements: 0,
                    quality: Some(report),
                })
            }
        }
    }

    /// Credential backends may block on the OS keychain, so lookups run on
    /// the blocking pool.
    async fn resolve_credentials(&self, credential_ref: &str) -> Result<Credentials, TaskError> {
        let provider = self.credentials.clone();
        let reference = credential_ref.to_string();
        let credentials = tokio::task::spawn_blocking(move || provider.resolve(&reference))
            .await
            .map_err(|e| PortError::Credential {
                credential_ref: credential_ref.to_string(),
                message: format!("credential lookup aborted: {e}"),
            })??;
        Ok(credentials)
    }

    async fn submit(&self, request: SqlRequest) -> Result<TaskOutput, TaskError> {
        for statement in &request.statements {
            debug!(table = %request.table, statement_kind = %statement.kind, sql = %statement, "Executing statement");
            self.sql.execute(statement).await?;
        }
        Ok(TaskOutput {
            statements: request.statements.len(),
            quality: None,
        })
    }
}

/// In-flight attempts keyed by the tokio task id.
struct Workers {
    set: JoinSet<Attempt>,
    names: HashMap<Id, String>,
}

impl Workers {
    fn new() -> Self {
        Self {
            set: JoinSet::new(),
            names: HashMap::new(),
        }
    }

    fn len(&self) -> usize {
        self.names.len()
    }

    fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// The pipeline executor runs one task graph per call.
pub struct PipelineExecutor {
    runner: TaskRunner,
    config: StarloadConfig,
}

impl PipelineExecutor {
    pub fn new(
        sql: Arc<dyn SqlExecutor>,
        credentials: Arc<dyn CredentialProvider>,
        config: StarloadConfig,
    ) -> Self {
        Self {
            runner: TaskRunner {
                sql,
                credentials,
                source: config.source.clone(),
                quality: config.quality.clone(),
            },
            config,
        }
    }

    /// Run the graph to completion.
    pub async fn run(&self, graph: &TaskGraph, ctx: RunContext, pipeline: &str) -> RunState {
        self.run_with_cancellation(graph, ctx, pipeline, CancellationToken::new())
            .await
    }

    /// Run the graph until it completes or `cancel` fires.
    ///
    /// After cancellation, running attempts finish but nothing new is
    /// dispatched: pending retries end Failed and never-dispatched tasks end
    /// Cancelled (or UpstreamFailed when an upstream task had already failed).
    pub async fn run_with_cancellation(
        &self,
        graph: &TaskGraph,
        ctx: RunContext,
        pipeline: &str,
        cancel: CancellationToken,
    ) -> RunState {
        let mut state = RunState::new(ctx.run_id, pipeline.to_string(), ctx.logical_date);
        for task in graph.tasks() {
            state.tasks.entry(task.name.clone()).or_default().kind = Some(task.operation.kind());
        }
        info!(
            run_id = %ctx.run_id,
            pipeline,
            logical_date = %ctx.logical_date,
            connection_id = %self.config.warehouse.connection_id,
            tasks = graph.len(),
            "Starting pipeline run"
        );

        let limit = match self.config.engine.max_concurrent_tasks {
            0 => usize::MAX,
            n => n,
        };
        let mut workers = Workers::new();
        let mut backoff: Vec<(Instant, String)> = Vec::new();

        loop {
            propagate_failures(graph, &mut state);

            if !state.cancelled {
                backoff.sort_by_key(|(at, _)| *at);
                let now = Instant::now();
                while workers.len() < limit && backoff.first().is_some_and(|(at, _)| *at <= now)
                {
                    let (_, name) = backoff.remove(0);
                    if let Some(task) = graph.task(&name) {
                        self.spawn_attempt(&mut workers, &mut state, task, &ctx);
                    }
                }

                let ready: Vec<&Task> = graph.ready_set(|n| state.status_of(n));
                for task in ready {
                    if workers.len() >= limit {
                        break;
                    }
                    self.spawn_attempt(&mut workers, &mut state, task, &ctx);
                }
            }

            if workers.is_empty() && backoff.is_empty() {
                break;
            }

            let next_retry = backoff.iter().map(|(at, _)| *at).min();
            let can_retry = next_retry.is_some() && workers.len() < limit;

            tokio::select! {
                biased;
                _ = cancel.cancelled(), if !state.cancelled => {
                    warn!(run_id = %ctx.run_id, running = workers.len(), "Run cancelled, no further tasks will be dispatched");
                    state.cancelled = true;
                    for (_, name) in backoff.drain(..) {
                        if let Some(record) = state.tasks.get_mut(&name) {
                            record.error = Some(TaskError::Cancelled.to_string());
                        }
                        state.transition(&name, TaskStatus::Failed);
                    }
                }
                Some(joined) = workers.set.join_next_with_id(), if !workers.is_empty() => {
                    match joined {
                        Ok((id, attempt)) => {
                            workers.names.remove(&id);
                            self.complete(graph, &mut state, &mut backoff, attempt);
                        }
                        Err(join_error) => {
                            let Some(name) = workers.names.remove(&join_error.id()) else {
                                continue;
                            };
                            error!(task = %name, error = %join_error, "Task body aborted");
                            if let Some(record) = state.tasks.get_mut(&name) {
                                record.error = Some(format!("task body aborted: {join_error}"));
                            }
                            state.transition(&name, TaskStatus::Failed);
                        }
                    }
                }
                _ = tokio::time::sleep_until(next_retry.unwrap_or_else(Instant::now)), if can_retry => {}
            }
        }

        propagate_failures(graph, &mut state);
        let never_dispatched: Vec<String> = state
            .tasks
            .iter()
            .filter(|(_, r)| r.status == TaskStatus::Pending)
            .map(|(name, _)| name.clone())
            .collect();
        for name in never_dispatched {
            if let Some(record) = state.tasks.get_mut(&name) {
                record.error = Some(TaskError::Cancelled.to_string());
            }
            state.transition(&name, TaskStatus::Cancelled);
        }

        state.finish();
        let failed = state.failed_tasks();
        if failed.is_empty() {
            info!(run_id = %state.run_id, "Pipeline run succeeded");
        } else {
            error!(run_id = %state.run_id, failed = ?failed, cancelled = state.cancelled, "Pipeline run failed");
        }
        state
    }

    fn spawn_attempt(
        &self,
        workers: &mut Workers,
        state: &mut RunState,
        task: &Task,
        ctx: &RunContext,
    ) {
        state.transition(&task.name, TaskStatus::Running);
        let attempt = match state.tasks.get_mut(&task.name) {
            Some(record) => {
                record.attempts += 1;
                record.attempts
            }
            None => 1,
        };
        debug!(task = %task.name, attempt, kind = %task.operation.kind(), "Dispatching task");

        let runner = self.runner.clone();
        let task = task.clone();
        let ctx = ctx.clone();
        let name = task.name.clone();
        let span = info_span!("task", task = %name, attempt);
        let handle = workers.set.spawn(
            async move {
                let result = runner.run(&task, &ctx).await;
                Attempt {
                    task: task.name,
                    result,
                }
            }
            .instrument(span),
        );
        workers.names.insert(handle.id(), name);
    }

    /// Attempts allowed for a task under the current configuration.
    fn max_attempts(&self, task: &Task) -> u32 {
        if !self.config.retry.retry_non_idempotent && !task.operation.is_idempotent() {
            1
        } else {
            task.retry.max_attempts
        }
    }

    fn complete(
        &self,
        graph: &TaskGraph,
        state: &mut RunState,
        backoff: &mut Vec<(Instant, String)>,
        attempt: Attempt,
    ) {
        let Some(task) = graph.task(&attempt.task) else {
            return;
        };
        let attempts = state
            .tasks
            .get(&task.name)
            .map(|r| r.attempts)
            .unwrap_or(1);

        match attempt.result {
            Ok(output) => {
                if let Some(record) = state.tasks.get_mut(&task.name) {
                    record.quality = output.quality;
                    record.error = None;
                }
                state.transition(&task.name, TaskStatus::Success);
                info!(task = %task.name, attempt = attempts, statements = output.statements, "Task succeeded");
            }
            Err(err) => {
                if let Some(record) = state.tasks.get_mut(&task.name) {
                    record.error = Some(err.to_string());
                    if let TaskError::Quality(q) = &err {
                        record.quality = Some(q.report().clone());
                    }
                }
                state.transition(&task.name, TaskStatus::Failed);

                let max_attempts = self.max_attempts(task);
                if err.is_retryable() && attempts < max_attempts && !state.cancelled {
                    let delay = task.retry.delay_after(attempts);
                    warn!(
                        task = %task.name,
                        attempt = attempts,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Task failed, retrying"
                    );
                    state.transition(&task.name, TaskStatus::Retrying);
                    backoff.push((retry_deadline(delay), task.name.clone()));
                } else {
                    error!(task = %task.name, attempt = attempts, max_attempts, error = %err, "Task failed");
                }
            }
        }
    }
}

fn retry_deadline(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay.min(MAX_RETRY_WAIT)).unwrap_or(now)
}

/// Mark every pending task with a failed upstream task as UpstreamFailed,
/// transitively.
fn propagate_failures(graph: &TaskGraph, state: &mut RunState) {
    loop {
        let blocked: Vec<String> = graph
            .blocked_set(|n| state.status_of(n))
            .into_iter()
            .map(|t| t.name.clone())
            .collect();
        if blocked.is_empty() {
            break;
        }
        for name in blocked {
            if let Some(record) = state.tasks.get_mut(&name) {
                record.error = Some("upstream task did not succeed".to_string());
            }
            state.transition(&name, TaskStatus::UpstreamFailed);
            info!(task = %name, "Skipping task, upstream failed");
        }
    }
}
