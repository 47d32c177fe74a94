//! Load strategies: pure functions from task parameters to SQL requests.
//!
//! - Stage: bulk `COPY` from the object store into a staging table (append).
//! - Fact: `INSERT INTO ... SELECT` with no delete step (append, not idempotent).
//! - Dimension: `TRUNCATE` then insert when `replace` is set, insert only otherwise.

use crate::config::SourceConfig;
use crate::credentials::Credentials;
use crate::error::TaskError;
use crate::pipeline::templates::{RunContext, render};
use crate::pipeline::types::{DimensionParams, FactParams, StageParams};
use crate::ports::{Statement, StatementKind};
use tracing::debug;

/// Statements to run, in order, against one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlRequest {
    pub table: String,
    pub statements: Vec<Statement>,
}

/// Fully resolved source of a staging pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub uri: String,
    pub region: String,
    pub json_path: String,
    pub credential_ref: String,
}

/// Render the source key and fill unset parameters from configuration.
pub fn resolve_source(
    params: &StageParams,
    defaults: &SourceConfig,
    ctx: &RunContext,
) -> Result<SourceLocation, TaskError> {
    let key = render(&params.source_key, ctx)?;
    let uri = if key.starts_with("s3://") {
        key
    } else {
        let bucket = params.bucket.as_deref().unwrap_or(&defaults.bucket);
        format!(
            "s3://{}/{}",
            bucket.trim_end_matches('/'),
            key.trim_start_matches('/')
        )
    };
    debug!(table = %params.table, uri = %uri, "Resolved staging source");
    Ok(SourceLocation {
        uri,
        region: params
            .region
            .clone()
            .unwrap_or_else(|| defaults.region.clone()),
        json_path: params
            .json_path
            .clone()
            .unwrap_or_else(|| defaults.json_path.clone()),
        credential_ref: params
            .credential_ref
            .clone()
            .unwrap_or_else(|| defaults.credential_ref.clone()),
    })
}

/// Bulk load a staging table. The table is appended to, never truncated.
pub fn stage_request(
    params: &StageParams,
    source: &SourceLocation,
    credentials: &Credentials,
) -> SqlRequest {
    let sql = format!(
        "COPY {table}\n\
         FROM '{uri}'\n\
         ACCESS_KEY_ID '{access_key}'\n\
         SECRET_ACCESS_KEY '{secret_key}'\n\
         REGION '{region}'\n\
         FORMAT JSON AS '{json_path}'\n\
         EMPTYASNULL\n\
         BLANKSASNULL;",
        table = params.table,
        uri = source.uri,
        access_key = credentials.access_key,
        secret_key = credentials.secret_key,
        region = source.region,
        json_path = source.json_path,
    );
    let statement = Statement::new(StatementKind::Copy, &params.table, sql)
        .with_secret(&credentials.access_key)
        .with_secret(&credentials.secret_key);
    SqlRequest {
        table: params.table.clone(),
        statements: vec![statement],
    }
}

fn insert_statement(table: &str, query: &str) -> Statement {
    Statement::new(
        StatementKind::Insert,
        table,
        format!("INSERT INTO {}\n{}", table, query.trim()),
    )
}

/// Append the transform output to a fact table.
pub fn fact_request(params: &FactParams) -> SqlRequest {
    SqlRequest {
        table: params.table.clone(),
        statements: vec![insert_statement(&params.table, &params.query)],
    }
}

/// Load a dimension table, truncating it first when `replace` is set.
pub fn dimension_request(params: &DimensionParams) -> SqlRequest {
    let mut statements = Vec::with_capacity(2);
    if params.replace {
        statements.push(Statement::new(
            StatementKind::Truncate,
            &params.table,
            format!("TRUNCATE {};", params.table),
        ));
    }
    statements.push(insert_statement(&params.table, &params.query));
    debug!(
        table = %params.table,
        replace = params.replace,
        statements = statements.len(),
        "Built dimension load"
    );
    SqlRequest {
        table: params.table.clone(),
        statements,
    }
}
