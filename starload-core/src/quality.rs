//! Data quality engine.
//!
//! Runs a fixed vocabulary of two checks against the warehouse:
//! - count comparison: `COUNT(DISTINCT source.column) <= COUNT(*) target`
//! - not-null: `COUNT(*) WHERE column IS NULL = 0`
//!
//! Every rule runs regardless of earlier failures. Results are collected into
//! an [`EvaluationReport`]; the caller turns it into a single error with
//! [`EvaluationReport::into_result`] once all rules have run.

use crate::error::QualityError;
use crate::ports::{SqlExecutor, Statement, StatementKind, first_count};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{error, info};

/// Asserts that `source_table` has no more distinct `source_column` values
/// than `target_table` has rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountRule {
    pub source_table: String,
    pub source_column: String,
    pub target_table: String,
}

impl CountRule {
    pub fn new(source_table: &str, source_column: &str, target_table: &str) -> Self {
        Self {
            source_table: source_table.to_string(),
            source_column: source_column.to_string(),
            target_table: target_table.to_string(),
        }
    }
}

/// Asserts that `table.column` holds no NULLs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotNullRule {
    pub table: String,
    pub column: String,
}

impl NotNullRule {
    pub fn new(table: &str, column: &str) -> Self {
        Self {
            table: table.to_string(),
            column: column.to_string(),
        }
    }
}

/// The rule lists evaluated by a validation task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityRules {
    #[serde(default)]
    pub count_rules: Vec<CountRule>,
    #[serde(default)]
    pub not_null_rules: Vec<NotNullRule>,
}

impl Default for QualityRules {
    fn default() -> Self {
        Self {
            count_rules: vec![
                CountRule::new("staging_events", "userid", "users"),
                CountRule::new("staging_songs", "song_id", "songs"),
                CountRule::new("staging_songs", "artist_id", "artists"),
                CountRule::new("staging_events", "ts", "time"),
            ],
            not_null_rules: vec![
                NotNullRule::new("songplays", "start_time"),
                NotNullRule::new("users", "userid"),
                NotNullRule::new("songs", "song_id"),
                NotNullRule::new("artists", "artist_id"),
                NotNullRule::new("time", "start_time"),
            ],
        }
    }
}

/// Which rule a result belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum RuleKind {
    CountComparison {
        source_table: String,
        source_column: String,
        target_table: String,
    },
    NotNull {
        table: String,
        column: String,
    },
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleKind::CountComparison {
                source_table,
                source_column,
                target_table,
            } => write!(
                f,
                "count(distinct {source_table}.{source_column}) <= count({target_table})"
            ),
            RuleKind::NotNull { table, column } => write!(f, "{table}.{column} is not null"),
        }
    }
}

/// How a rule ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RuleOutcome {
    Passed,
    /// The assertion did not hold.
    Failed,
    /// A query returned no rows.
    NoResult { table: String },
    /// A query could not be executed.
    Errored { message: String },
}

/// Values read from the warehouse.
///
/// Count rules: `left` is the distinct source count, `right` the target row
/// count. Not-null rules: `left` is the NULL count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observed {
    pub left: Option<i64>,
    pub right: Option<i64>,
}

/// Result of one rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleResult {
    pub rule: RuleKind,
    pub outcome: RuleOutcome,
    pub observed: Observed,
}

impl RuleResult {
    pub fn passed(&self) -> bool {
        self.outcome == RuleOutcome::Passed
    }
}

impl fmt::Display for RuleResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |v: Option<i64>| v.map_or_else(|| "-".to_string(), |v| v.to_string());
        let status = match &self.outcome {
            RuleOutcome::Passed => "PASS".to_string(),
            RuleOutcome::Failed => "FAIL".to_string(),
            RuleOutcome::NoResult { table } => format!("NO RESULT ({table})"),
            RuleOutcome::Errored { message } => format!("ERROR ({message})"),
        };
        match self.rule {
            RuleKind::CountComparison { .. } => write!(
                f,
                "[{status}] {} observed {} vs {}",
                self.rule,
                show(self.observed.left),
                show(self.observed.right)
            ),
            RuleKind::NotNull { .. } => write!(
                f,
                "[{status}] {} observed {} null(s)",
                self.rule,
                show(self.observed.left)
            ),
        }
    }
}

/// Every rule's result, in the order the rules were supplied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub results: Vec<RuleResult>,
}

impl EvaluationReport {
    pub fn is_success(&self) -> bool {
        self.results.iter().all(RuleResult::passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &RuleResult> {
        self.results.iter().filter(|r| !r.passed())
    }

    pub fn failure_count(&self) -> usize {
        self.failures().count()
    }

    /// Whether any rule failed because a query could not run at all.
    pub fn has_port_errors(&self) -> bool {
        self.results
            .iter()
            .any(|r| matches!(r.outcome, RuleOutcome::Errored { .. }))
    }

    /// The single aggregated error, raised only after every rule ran.
    pub fn into_result(self) -> Result<EvaluationReport, QualityError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(QualityError::ChecksFailed { report: self })
        }
    }
}

/// Single query outcome while evaluating a rule.
enum CountQuery {
    Count(i64),
    Empty,
    Error(String),
}

/// Evaluates quality rules through the SQL execution port.
pub struct QualityEngine {
    sql: Arc<dyn SqlExecutor>,
}

impl QualityEngine {
    pub fn new(sql: Arc<dyn SqlExecutor>) -> Self {
        Self { sql }
    }

    /// Run every rule and collect the results. Never short-circuits.
    pub async fn evaluate(
        &self,
        count_rules: &[CountRule],
        not_null_rules: &[NotNullRule],
    ) -> EvaluationReport {
        info!(
            count_rules = count_rules.len(),
            not_null_rules = not_null_rules.len(),
            "Running data quality checks"
        );

        let counts = join_all(count_rules.iter().map(|r| self.check_count(r))).await;
        let nulls = join_all(not_null_rules.iter().map(|r| self.check_not_null(r))).await;

        let report = EvaluationReport {
            results: counts.into_iter().chain(nulls).collect(),
        };
        if report.is_success() {
            info!(rules = report.results.len(), "Data quality checks passed");
        } else {
            error!(
                failed = report.failure_count(),
                rules = report.results.len(),
                "Data quality checks failed"
            );
        }
        report
    }

    async fn count(&self, table: &str, sql: String) -> CountQuery {
        let statement = Statement::new(StatementKind::Select, table, sql);
        match self.sql.query(&statement).await {
            Ok(rows) => match first_count(&rows) {
                Some(n) => CountQuery::Count(n),
                None => {
                    error!(table, "Data quality check failed: query returned no results");
                    CountQuery::Empty
                }
            },
            Err(e) => {
                error!(table, error = %e, "Data quality query failed");
                CountQuery::Error(e.to_string())
            }
        }
    }

    async fn check_count(&self, rule: &CountRule) -> RuleResult {
        let distinct = self
            .count(
                &rule.source_table,
                format!(
                    "SELECT COUNT(DISTINCT {}) FROM {};",
                    rule.source_column, rule.source_table
                ),
            )
            .await;
        let total = self
            .count(
                &rule.target_table,
                format!("SELECT COUNT(*) FROM {};", rule.target_table),
            )
            .await;

        let kind = RuleKind::CountComparison {
            source_table: rule.source_table.clone(),
            source_column: rule.source_column.clone(),
            target_table: rule.target_table.clone(),
        };
        let observed = Observed {
            left: count_value(&distinct),
            right: count_value(&total),
        };

        let outcome = match (&distinct, &total) {
            (CountQuery::Error(message), _) | (_, CountQuery::Error(message)) => {
                RuleOutcome::Errored {
                    message: message.clone(),
                }
            }
            (CountQuery::Empty, _) => RuleOutcome::NoResult {
                table: rule.source_table.clone(),
            },
            (_, CountQuery::Empty) => RuleOutcome::NoResult {
                table: rule.target_table.clone(),
            },
            (CountQuery::Count(d), CountQuery::Count(t)) => {
                info!(
                    table = %rule.source_table,
                    column = %rule.source_column,
                    distinct = d,
                    "Distinct values in source column"
                );
                info!(table = %rule.target_table, rows = t, "Rows in target table");
                if d <= t {
                    RuleOutcome::Passed
                } else {
                    error!(expected = %format!("{d} <= {t}"), "Count comparison failed");
                    RuleOutcome::Failed
                }
            }
        };

        RuleResult {
            rule: kind,
            outcome,
            observed,
        }
    }

    async fn check_not_null(&self, rule: &NotNullRule) -> RuleResult {
        let nulls = self
            .count(
                &rule.table,
                format!(
                    "SELECT COUNT(*) FROM {} WHERE {} IS NULL;",
                    rule.table, rule.column
                ),
            )
            .await;

        let outcome = match &nulls {
            CountQuery::Error(message) => RuleOutcome::Errored {
                message: message.clone(),
            },
            CountQuery::Empty => RuleOutcome::NoResult {
                table: rule.table.clone(),
            },
            CountQuery::Count(0) => RuleOutcome::Passed,
            CountQuery::Count(n) => {
                error!(table = %rule.table, column = %rule.column, nulls = n, "Not-null check failed");
                RuleOutcome::Failed
            }
        };

        RuleResult {
            rule: RuleKind::NotNull {
                table: rule.table.clone(),
                column: rule.column.clone(),
            },
            outcome,
            observed: Observed {
                left: count_value(&nulls),
                right: None,
            },
        }
    }
}

fn count_value(query: &CountQuery) -> Option<i64> {
    match query {
        CountQuery::Count(n) => Some(*n),
        CountQuery::Empty | CountQuery::Error(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PortError;
    use crate::ports::Rows;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Answers queries from a map keyed by exact SQL text; unknown queries
    /// return a zero count.
    struct ScriptedWarehouse {
        answers: HashMap<String, Result<Rows, PortError>>,
        seen: Mutex<Vec<String>>,
    }

    impl ScriptedWarehouse {
        fn new() -> Self {
            Self {
                answers: HashMap::new(),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn answer(mut self, sql: &str, count: i64) -> Self {
            self.answers.insert(sql.to_string(), Ok(vec![vec![json!(count)]]));
            self
        }

        fn empty(mut self, sql: &str) -> Self {
            self.answers.insert(sql.to_string(), Ok(Vec::new()));
            self
        }

        fn fail(mut self, sql: &str) -> Self {
            self.answers.insert(
                sql.to_string(),
                Err(PortError::Connection {
                    message: "connection reset".into(),
                }),
            );
            self
        }

        fn queries(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SqlExecutor for ScriptedWarehouse {
        async fn execute(&self, _statement: &Statement) -> Result<(), PortError> {
            Ok(())
        }

        async fn query(&self, statement: &Statement) -> Result<Rows, PortError> {
            self.seen.lock().unwrap().push(statement.sql.clone());
            self.answers
                .get(&statement.sql)
                .cloned()
                .unwrap_or_else(|| Ok(vec![vec![json!(0)]]))
        }
    }

    #[tokio::test]
    async fn test_count_rule_passes_on_equal() {
        let wh = Arc::new(
            ScriptedWarehouse::new()
                .answer("SELECT COUNT(DISTINCT userid) FROM staging_events;", 120)
                .answer("SELECT COUNT(*) FROM users;", 120),
        );
        let report = QualityEngine::new(wh)
            .evaluate(&[CountRule::new("staging_events", "userid", "users")], &[])
            .await;
        assert!(report.is_success());
        assert_eq!(
            report.results[0].observed,
            Observed {
                left: Some(120),
                right: Some(120)
            }
        );
    }

    #[tokio::test]
    async fn test_count_rule_fails_and_records_values() {
        let wh = Arc::new(
            ScriptedWarehouse::new()
                .answer("SELECT COUNT(DISTINCT userid) FROM staging_events;", 120)
                .answer("SELECT COUNT(*) FROM users;", 119),
        );
        let report = QualityEngine::new(wh)
            .evaluate(&[CountRule::new("staging_events", "userid", "users")], &[])
            .await;
        assert!(!report.is_success());
        let result = &report.results[0];
        assert_eq!(result.outcome, RuleOutcome::Failed);
        assert_eq!(result.observed.left, Some(120));
        assert_eq!(result.observed.right, Some(119));
        assert!(result.to_string().contains("observed 120 vs 119"));
    }

    #[tokio::test]
    async fn test_count_rule_allows_fewer_distinct_than_rows() {
        let wh = Arc::new(
            ScriptedWarehouse::new()
                .answer("SELECT COUNT(DISTINCT ts) FROM staging_events;", 10)
                .answer("SELECT COUNT(*) FROM time;", 50),
        );
        let report = QualityEngine::new(wh)
            .evaluate(&[CountRule::new("staging_events", "ts", "time")], &[])
            .await;
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn test_empty_result_is_no_result_failure() {
        let wh = Arc::new(ScriptedWarehouse::new().empty("SELECT COUNT(*) FROM users;"));
        let report = QualityEngine::new(wh)
            .evaluate(&[CountRule::new("staging_events", "userid", "users")], &[])
            .await;
        assert_eq!(
            report.results[0].outcome,
            RuleOutcome::NoResult {
                table: "users".into()
            }
        );
        assert!(!report.has_port_errors());
        assert!(report.into_result().is_err());
    }

    #[tokio::test]
    async fn test_not_null_rule() {
        let wh = Arc::new(
            ScriptedWarehouse::new()
                .answer("SELECT COUNT(*) FROM users WHERE userid IS NULL;", 0)
                .answer("SELECT COUNT(*) FROM songs WHERE song_id IS NULL;", 3),
        );
        let report = QualityEngine::new(wh)
            .evaluate(
                &[],
                &[
                    NotNullRule::new("users", "userid"),
                    NotNullRule::new("songs", "song_id"),
                ],
            )
            .await;
        assert!(report.results[0].passed());
        assert_eq!(report.results[1].outcome, RuleOutcome::Failed);
        assert_eq!(report.results[1].observed.left, Some(3));
    }

    #[tokio::test]
    async fn test_port_error_is_recorded_not_raised() {
        let wh = Arc::new(
            ScriptedWarehouse::new().fail("SELECT COUNT(*) FROM users WHERE userid IS NULL;"),
        );
        let report = QualityEngine::new(wh)
            .evaluate(&[], &[NotNullRule::new("users", "userid")])
            .await;
        assert!(report.has_port_errors());
        assert!(matches!(
            report.results[0].outcome,
            RuleOutcome::Errored { .. }
        ));
    }

    #[tokio::test]
    async fn test_all_rules_run_and_failures_aggregate() {
        let rules = QualityRules::default();
        let wh = Arc::new(
            ScriptedWarehouse::new()
                .answer("SELECT COUNT(DISTINCT userid) FROM staging_events;", 120)
                .answer("SELECT COUNT(*) FROM users;", 119)
                .answer("SELECT COUNT(*) FROM time WHERE start_time IS NULL;", 2),
        );
        let report = QualityEngine::new(wh.clone())
            .evaluate(&rules.count_rules, &rules.not_null_rules)
            .await;

        // 4 count rules x 2 queries + 5 not-null queries.
        assert_eq!(wh.queries().len(), 13);
        assert_eq!(report.results.len(), 9);
        assert_eq!(report.failure_count(), 2);

        let err = report.into_result().unwrap_err();
        assert_eq!(err.report().failure_count(), 2);
        assert_eq!(
            err.to_string(),
            "Data quality check failed: 2 of 9 rules failed"
        );
    }

    #[test]
    fn test_report_serializes_tagged() {
        let report = EvaluationReport {
            results: vec![RuleResult {
                rule: RuleKind::NotNull {
                    table: "users".into(),
                    column: "userid".into(),
                },
                outcome: RuleOutcome::Passed,
                observed: Observed {
                    left: Some(0),
                    right: None,
                },
            }],
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["results"][0]["rule"]["rule"], "not_null");
        assert_eq!(json["results"][0]["outcome"]["outcome"], "passed");
    }
}
