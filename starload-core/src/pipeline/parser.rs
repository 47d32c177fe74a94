//! YAML parser and validator for pipeline definitions.

use crate::error::PipelineError;
use crate::pipeline::graph::{BEGIN, END};
use crate::pipeline::templates::{KNOWN_TOKENS, extract_tokens};
use crate::pipeline::types::{PipelineDefinition, TaskOperation, TaskSpec};
use std::collections::HashSet;

/// Parse a pipeline definition from a YAML string.
pub fn parse_pipeline(yaml: &str) -> Result<PipelineDefinition, PipelineError> {
    serde_yaml::from_str::<PipelineDefinition>(yaml).map_err(|e| PipelineError::ParseError {
        message: e.to_string(),
    })
}

/// Validate a parsed pipeline definition for structural correctness.
///
/// Checks:
/// - At least one task exists
/// - No duplicate or reserved task names
/// - Tables and queries are not empty
/// - Template tokens in source keys are known
/// - Retry policies allow at least one attempt
///
/// Edges are checked when the graph is built.
pub fn validate_pipeline(pipeline: &PipelineDefinition) -> Result<(), PipelineError> {
    if pipeline.tasks.is_empty() {
        return Err(invalid("Pipeline must have at least one task".to_string()));
    }

    let mut seen = HashSet::new();
    for task in &pipeline.tasks {
        if task.name.trim().is_empty() {
            return Err(invalid("Task name must not be empty".to_string()));
        }
        if task.name == BEGIN || task.name == END {
            return Err(invalid(format!(
                "Task name '{}' is reserved for the graph boundary",
                task.name
            )));
        }
        if !seen.insert(task.name.as_str()) {
            return Err(invalid(format!("Duplicate task name: '{}'", task.name)));
        }
        validate_task(task)?;
    }

    if let Some(retry) = &pipeline.defaults.retry {
        if retry.max_attempts == 0 {
            return Err(invalid(
                "defaults.retry.max_attempts must be at least 1".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_task(task: &TaskSpec) -> Result<(), PipelineError> {
    if let Some(table) = task.operation.target_table() {
        if table.trim().is_empty() {
            return Err(invalid(format!("Task '{}' has an empty table", task.name)));
        }
    }

    match &task.operation {
        TaskOperation::Stage(params) => {
            let tokens = extract_tokens(&params.source_key).ok_or_else(|| {
                invalid(format!(
                    "Task '{}' has an unclosed template in source_key",
                    task.name
                ))
            })?;
            if let Some(unknown) = tokens
                .iter()
                .find(|t| !KNOWN_TOKENS.contains(&t.as_str()))
            {
                return Err(invalid(format!(
                    "Task '{}' uses unknown template token '{}'",
                    task.name, unknown
                )));
            }
        }
        TaskOperation::LoadFact(params) => check_query(&task.name, &params.query)?,
        TaskOperation::LoadDimension(params) => check_query(&task.name, &params.query)?,
        TaskOperation::ValidateQuality(_) | TaskOperation::NoOp => {}
    }

    if let Some(retry) = &task.retry {
        if retry.max_attempts == 0 {
            return Err(invalid(format!(
                "Task '{}' retry.max_attempts must be at least 1",
                task.name
            )));
        }
    }
    Ok(())
}

fn check_query(task: &str, query: &str) -> Result<(), PipelineError> {
    if query.trim().is_empty() {
        return Err(invalid(format!("Task '{task}' has an empty query")));
    }
    Ok(())
}

fn invalid(message: String) -> PipelineError {
    PipelineError::ValidationFailed { message }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
name: minimal
tasks:
  - name: load_users
    kind: load_dimension
    params:
      table: public.users
      query: SELECT 1
"#
    }

    #[test]
    fn test_parse_minimal_pipeline() {
        let def = parse_pipeline(minimal_yaml()).unwrap();
        assert_eq!(def.name, "minimal");
        assert_eq!(def.version, "1.0");
        assert_eq!(def.tasks.len(), 1);
        assert!(def.defaults.retry.is_none());
        validate_pipeline(&def).unwrap();
    }

    #[test]
    fn test_parse_pipeline_with_defaults_and_retry() {
        let yaml = r#"
name: with_retry
defaults:
  retry:
    max_attempts: 4
    delay_secs: 300
tasks:
  - name: stage_events
    kind: stage
    params:
      table: public.staging_events
      source_key: "log_data/{{ execution_date.year }}/"
    retry:
      max_attempts: 2
      delay_secs: 1
      backoff: exponential
  - name: done
    kind: no_op
    upstream: [stage_events]
"#;
        let def = parse_pipeline(yaml).unwrap();
        assert_eq!(def.defaults.retry.as_ref().unwrap().max_attempts, 4);
        assert_eq!(def.tasks[0].retry.as_ref().unwrap().max_attempts, 2);
        assert_eq!(def.tasks[1].operation, TaskOperation::NoOp);
        validate_pipeline(&def).unwrap();
    }

    #[test]
    fn test_parse_validate_quality_without_params() {
        let yaml = r#"
name: checks
tasks:
  - name: load_users
    kind: load_dimension
    params:
      table: public.users
      query: SELECT 1
  - name: run_quality_checks
    kind: validate_quality
    upstream: [load_users]
"#;
        let def = parse_pipeline(yaml).unwrap();
        assert_eq!(
            def.tasks[1].operation,
            TaskOperation::ValidateQuality(Default::default())
        );
        assert_eq!(def.tasks[1].upstream, vec!["load_users".to_string()]);
        validate_pipeline(&def).unwrap();
    }

    #[test]
    fn test_parse_load_without_params_returns_error() {
        let yaml = "name: bad\ntasks:\n  - name: t\n    kind: load_dimension\n";
        let err = parse_pipeline(yaml).unwrap_err();
        assert!(err.to_string().contains("requires params"), "{err}");
    }

    #[test]
    fn test_parse_invalid_yaml_returns_error() {
        let err = parse_pipeline("name: [unclosed").unwrap_err();
        assert!(matches!(err, PipelineError::ParseError { .. }));
    }

    #[test]
    fn test_parse_unknown_kind_returns_error() {
        let yaml = r#"
name: bad
tasks:
  - name: t
    kind: load_everything
"#;
        assert!(parse_pipeline(yaml).is_err());
    }

    #[test]
    fn test_validate_empty_tasks() {
        let def = parse_pipeline("name: empty\ntasks: []\n").unwrap();
        let err = validate_pipeline(&def).unwrap_err();
        assert!(err.to_string().contains("at least one task"));
    }

    #[test]
    fn test_validate_duplicate_names() {
        let yaml = r#"
name: dup
tasks:
  - name: a
    kind: no_op
  - name: a
    kind: no_op
"#;
        let err = validate_pipeline(&parse_pipeline(yaml).unwrap()).unwrap_err();
        assert!(err.to_string().contains("Duplicate task name"));
    }

    #[test]
    fn test_validate_reserved_name() {
        let yaml = "name: r\ntasks:\n  - name: begin\n    kind: no_op\n";
        let err = validate_pipeline(&parse_pipeline(yaml).unwrap()).unwrap_err();
        assert!(err.to_string().contains("reserved"));
    }

    #[test]
    fn test_validate_empty_query() {
        let yaml = r#"
name: q
tasks:
  - name: load_fact
    kind: load_fact
    params:
      table: public.songplays
      query: "   "
"#;
        let err = validate_pipeline(&parse_pipeline(yaml).unwrap()).unwrap_err();
        assert!(err.to_string().contains("empty query"));
    }

    #[test]
    fn test_validate_unknown_token() {
        let yaml = r#"
name: tokens
tasks:
  - name: stage_events
    kind: stage
    params:
      table: public.staging_events
      source_key: "log_data/{{ execution_date.minute }}/"
"#;
        let err = validate_pipeline(&parse_pipeline(yaml).unwrap()).unwrap_err();
        assert!(err.to_string().contains("execution_date.minute"));
    }

    #[test]
    fn test_validate_zero_attempts() {
        let yaml = r#"
name: zero
tasks:
  - name: a
    kind: no_op
    retry:
      max_attempts: 0
      delay_secs: 1
"#;
        let err = validate_pipeline(&parse_pipeline(yaml).unwrap()).unwrap_err();
        assert!(err.to_string().contains("max_attempts"));
    }
}
