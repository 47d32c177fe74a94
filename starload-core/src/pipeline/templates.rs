//! Run-time token substitution for task parameters.
//!
//! Supports `{{ ds }}`, `{{ execution_date.year }}` style tokens resolved
//! against the logical execution date of the run.

use crate::error::TaskError;
use chrono::{DateTime, Datelike, Timelike, Utc};
use uuid::Uuid;

/// Tokens accepted inside `{{ ... }}`.
pub const KNOWN_TOKENS: &[&str] = &[
    "execution_date",
    "execution_date.year",
    "execution_date.month",
    "execution_date.day",
    "execution_date.hour",
    "ds",
    "ds_nodash",
    "ts_nodash",
    "run_id",
];

/// Values available to templates during one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub logical_date: DateTime<Utc>,
}

impl RunContext {
    pub fn new(logical_date: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            logical_date,
        }
    }

    fn resolve(&self, token: &str) -> Option<String> {
        let d = &self.logical_date;
        let value = match token {
            "execution_date" => d.to_rfc3339(),
            "execution_date.year" => d.year().to_string(),
            "execution_date.month" => d.month().to_string(),
            "execution_date.day" => d.day().to_string(),
            "execution_date.hour" => d.hour().to_string(),
            "ds" => d.format("%Y-%m-%d").to_string(),
            "ds_nodash" => d.format("%Y%m%d").to_string(),
            "ts_nodash" => d.format("%Y%m%dT%H%M%S").to_string(),
            "run_id" => self.run_id.to_string(),
            _ => return None,
        };
        Some(value)
    }
}

/// Replace every `{{ token }}` in `template`.
pub fn render(template: &str, ctx: &RunContext) -> Result<String, TaskError> {
    let mut result = String::new();
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        result.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let end = after_open.find("}}").ok_or_else(|| TaskError::Template {
            message: format!("Unclosed template expression in: {}", template),
        })?;
        let token = after_open[..end].trim();
        let value = ctx.resolve(token).ok_or_else(|| TaskError::Template {
            message: format!("Unknown template token: {}", token),
        })?;
        result.push_str(&value);
        rest = &after_open[end + 2..];
    }
    result.push_str(rest);

    Ok(result)
}

/// Extract the tokens used in a template, without resolving them.
///
/// Returns `None` if a `{{` is never closed.
pub fn extract_tokens(template: &str) -> Option<Vec<String>> {
    let mut tokens = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let after_open = &rest[start + 2..];
        let end = after_open.find("}}")?;
        tokens.push(after_open[..end].trim().to_string());
        rest = &after_open[end + 2..];
    }
    Some(tokens)
}
