//! Ports to the outside world: the SQL warehouse and the source credential store.
//!
//! The engine only ever talks to a warehouse through [`SqlExecutor`]. Real
//! connectors live outside this crate; implementations must be safe for
//! concurrent use because sibling tasks call them in parallel.

use crate::error::PortError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Mutex;

/// What a statement does to its table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    Copy,
    Insert,
    Truncate,
    Select,
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatementKind::Copy => write!(f, "copy"),
            StatementKind::Insert => write!(f, "insert"),
            StatementKind::Truncate => write!(f, "truncate"),
            StatementKind::Select => write!(f, "select"),
        }
    }
}

/// A single SQL statement bound to the table it targets.
///
/// Table and column names are taken verbatim from configuration and are not
/// escaped.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statement {
    pub kind: StatementKind,
    pub table: String,
    pub sql: String,
    /// Substrings masked when the statement is displayed or logged.
    #[serde(default, skip_serializing)]
    pub secrets: Vec<String>,
}

impl Statement {
    pub fn new(kind: StatementKind, table: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            kind,
            table: table.into(),
            sql: sql.into(),
            secrets: Vec::new(),
        }
    }

    /// Mark a substring of the SQL text as secret.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        let secret = secret.into();
        if !secret.is_empty() {
            self.secrets.push(secret);
        }
        self
    }

    /// The SQL text with every secret masked.
    pub fn redacted(&self) -> String {
        self.secrets
            .iter()
            .fold(self.sql.clone(), |sql, secret| sql.replace(secret, "****"))
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

impl fmt::Debug for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Statement")
            .field("kind", &self.kind)
            .field("table", &self.table)
            .field("sql", &self.redacted())
            .finish()
    }
}

/// Rows returned by a read query.
pub type Rows = Vec<Vec<Value>>;

/// Read the first column of the first row as an integer count.
///
/// Returns `None` when the result set is empty or the cell is not numeric.
pub fn first_count(rows: &Rows) -> Option<i64> {
    let cell = rows.first()?.first()?;
    match cell {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Port to the SQL warehouse.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Run a side-effecting statement.
    async fn execute(&self, statement: &Statement) -> Result<(), PortError>;

    /// Run a read query and return its rows.
    async fn query(&self, statement: &Statement) -> Result<Rows, PortError>;
}

/// Warehouse that only logs what it would run.
///
/// Every query answers with a single `0` cell, so count-comparison and
/// not-null rules pass against it.
#[derive(Default)]
pub struct DryRunWarehouse {
    log: Mutex<Vec<Statement>>,
}

impl DryRunWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Statements seen so far, in arrival order.
    pub fn statements(&self) -> Vec<Statement> {
        self.log
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    fn record(&self, statement: &Statement) {
        tracing::info!(
            table = %statement.table,
            statement_kind = %statement.kind,
            "[dry-run] {}",
            statement
        );
        if let Ok(mut log) = self.log.lock() {
            log.push(statement.clone());
        }
    }
}

#[async_trait]
impl SqlExecutor for DryRunWarehouse {
    async fn execute(&self, statement: &Statement) -> Result<(), PortError> {
        self.record(statement);
        Ok(())
    }

    async fn query(&self, statement: &Statement) -> Result<Rows, PortError> {
        self.record(statement);
        Ok(vec![vec![Value::from(0)]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_statement_redacts_secrets() {
        let stmt = Statement::new(
            StatementKind::Copy,
            "staging_events",
            "COPY staging_events ACCESS_KEY_ID 'AKIA123' SECRET_ACCESS_KEY 'shh'",
        )
        .with_secret("AKIA123")
        .with_secret("shh");

        let shown = stmt.to_string();
        assert!(!shown.contains("AKIA123"));
        assert!(!shown.contains("shh"));
        assert!(shown.contains("ACCESS_KEY_ID '****'"));
        assert!(format!("{:?}", stmt).contains("****"));
        // The raw text still carries the secret for the warehouse.
        assert!(stmt.sql.contains("AKIA123"));
    }

    #[test]
    fn test_empty_secret_is_ignored() {
        let stmt = Statement::new(StatementKind::Select, "users", "SELECT 1").with_secret("");
        assert!(stmt.secrets.is_empty());
        assert_eq!(stmt.to_string(), "SELECT 1");
    }

    #[test]
    fn test_first_count() {
        assert_eq!(first_count(&vec![vec![json!(120)]]), Some(120));
        assert_eq!(first_count(&vec![vec![json!("42")]]), Some(42));
        assert_eq!(first_count(&vec![]), None);
        assert_eq!(first_count(&vec![vec![]]), None);
        assert_eq!(first_count(&vec![vec![json!(null)]]), None);
    }

    #[test]
    fn test_statement_kind_display() {
        assert_eq!(StatementKind::Copy.to_string(), "copy");
        assert_eq!(StatementKind::Truncate.to_string(), "truncate");
    }

    #[tokio::test]
    async fn test_dry_run_warehouse_records_and_answers_zero() {
        let wh = DryRunWarehouse::new();
        wh.execute(&Statement::new(StatementKind::Truncate, "users", "TRUNCATE users;"))
            .await
            .unwrap();
        let rows = wh
            .query(&Statement::new(
                StatementKind::Select,
                "users",
                "SELECT COUNT(*) FROM users;",
            ))
            .await
            .unwrap();
        assert_eq!(first_count(&rows), Some(0));
        let seen = wh.statements();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].kind, StatementKind::Truncate);
        assert_eq!(seen[1].kind, StatementKind::Select);
    }
}
