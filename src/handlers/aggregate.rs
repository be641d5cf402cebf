//! Aggregate questions answered by generated SQL.
//!
//! The text generator drafts a single `SELECT` over `app_inventory`. The
//! statement is screened for writes and side-effecting functions, then run
//! through [`DataAccessRouter::query_read_only`] so the backend refuses
//! anything the screen missed.

use anyhow::{bail, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, warn};

use shelfwise_core::error::StoreError;
use shelfwise_core::handler::Handler;
use shelfwise_core::models::{Request, Table};
use shelfwise_core::schema::{INVENTORY_COLUMNS, INVENTORY_VIEW};

use crate::llm::TextGenerator;
use crate::router::DataAccessRouter;

/// Phrases that mark a question as an aggregate. Matched on word boundaries.
const TRIGGERS: &[&str] = &[
    "most",
    "least",
    "highest",
    "lowest",
    "average",
    "averages",
    "sum",
    "total",
    "number of",
    "count",
    "distinct",
    "per store",
    "by store",
];

pub const READ_ONLY_REFUSAL: &str = "I'm sorry, I can only run read-only SELECT queries.";

static WRITE_KEYWORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(insert|update|delete|drop|alter|create|truncate|grant|revoke|attach|detach|pragma|copy|vacuum|merge|call)\b",
    )
    .unwrap()
});

/// Functions with side effects that a plain `SELECT` can still call.
static SIDE_EFFECT_FUNCTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(pg_terminate_backend|pg_cancel_backend|pg_sleep|pg_sleep_for|pg_sleep_until|set_config|pg_reload_conf|pg_rotate_logfile|pg_advisory_lock|pg_advisory_xact_lock|lo_import|lo_export|lo_unlink|pg_read_file|pg_read_binary_file|pg_ls_dir|dblink|dblink_exec|nextval|setval|load_extension|writefile|readfile)\s*\(",
    )
    .unwrap()
});

/// Single-quoted literals (with `''` escapes) and double-quoted identifiers.
static QUOTED: Lazy<Regex> = Lazy::new(|| Regex::new(r#"'(?:[^']|'')*'|"(?:[^"]|"")*""#).unwrap());

static CODE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:sql)?\s*(.*?)\s*```").unwrap());

pub struct AggregateQueryHandler {
    router: Arc<DataAccessRouter>,
    generator: Arc<dyn TextGenerator>,
    max_rows: usize,
}

impl AggregateQueryHandler {
    pub fn new(router: Arc<DataAccessRouter>, generator: Arc<dyn TextGenerator>, max_rows: usize) -> Self {
        Self {
            router,
            generator,
            max_rows,
        }
    }

    fn instructions() -> String {
        format!(
            "You are a SQL expert for a warehouse inventory database.\n\
             The database has the following view:\n{} ({})\n\
             Output ONLY a single SQL SELECT statement (no backticks, no explanations). \
             Do not modify or write any data.",
            INVENTORY_VIEW,
            INVENTORY_COLUMNS.join(", ")
        )
    }
}

/// Pad and normalise so triggers match whole words.
fn normalized(text: &str) -> String {
    let cleaned: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    format!(" {} ", cleaned.split_whitespace().collect::<Vec<_>>().join(" "))
}

pub fn is_aggregate_question(text: &str) -> bool {
    let text = normalized(text);
    TRIGGERS.iter().any(|t| text.contains(&format!(" {} ", t)))
}

/// Pull the statement out of a model reply: strip code fences and trailing `;`.
pub fn extract_sql(reply: &str) -> String {
    let body = CODE_FENCE
        .captures(reply)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(reply);
    body.trim().trim_end_matches(';').trim().to_string()
}

/// Blank out quoted literals and identifiers so keywords inside them are
/// not mistaken for SQL.
pub fn strip_quoted(sql: &str) -> String {
    QUOTED.replace_all(sql, "''").into_owned()
}

/// Accept only a single `SELECT` without writes or side-effecting calls.
pub fn ensure_read_only(sql: &str) -> std::result::Result<(), String> {
    let lower = sql.trim_start().to_lowercase();
    if !lower.starts_with("select") {
        return Err("not a SELECT statement".to_string());
    }
    let bare = strip_quoted(sql);
    if bare.contains(';') {
        return Err("multiple statements".to_string());
    }
    if let Some(m) = WRITE_KEYWORD.find(&bare) {
        return Err(format!("write keyword '{}'", m.as_str()));
    }
    if let Some(m) = SIDE_EFFECT_FUNCTION.captures(&bare).and_then(|c| c.get(1)) {
        return Err(format!("function '{}'", m.as_str()));
    }
    Ok(())
}

/// Render a result the way chat replies show it.
///
/// - `1x1` → `col: **value**`
/// - one row → `a: 1 | b: 2`
/// - more → a code block of pipe-separated rows, truncated to `max_rows`
pub fn format_table(table: &Table, max_rows: usize) -> String {
    if table.is_empty() {
        return "No results found.".to_string();
    }

    if table.len() == 1 && table.columns.len() == 1 {
        return format!("{}: **{}**", table.columns[0], table.rows[0][0]);
    }

    if table.len() == 1 {
        return table
            .columns
            .iter()
            .zip(&table.rows[0])
            .map(|(c, v)| format!("{}: {}", c, v))
            .collect::<Vec<_>>()
            .join(" | ");
    }

    let mut lines = vec![table.columns.join(" | ")];
    for row in table.rows.iter().take(max_rows) {
        lines.push(
            row.iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(" | "),
        );
    }
    if table.len() > max_rows {
        lines.push(format!("... ({} more rows)", table.len() - max_rows));
    }
    format!("**Results:**\n```\n{}\n```", lines.join("\n"))
}

#[async_trait]
impl Handler for AggregateQueryHandler {
    fn name(&self) -> &str {
        "aggregate_query"
    }

    fn description(&self) -> &str {
        "Counts, totals and rankings via a generated read-only SELECT"
    }

    async fn score(&self, request: &Request) -> Result<f64> {
        Ok(if is_aggregate_question(&request.text) { 0.8 } else { 0.0 })
    }

    async fn handle(&self, request: &Request) -> Result<String> {
        if !self.generator.is_enabled() {
            bail!("SQL generation needs a text generator");
        }

        let instructions = Self::instructions();
        let draft = self
            .generator
            .generate(&request.text, &request.history, Some(&instructions))
            .await?;
        let sql = extract_sql(&draft);

        if let Err(reason) = ensure_read_only(&sql) {
            warn!(sql = %sql, reason = %reason, "generated statement rejected");
            return Ok(READ_ONLY_REFUSAL.to_string());
        }

        debug!(sql = %sql, "running generated query");
        match self.router.query_read_only(&sql, &[]).await {
            Ok(table) => Ok(format_table(&table, self.max_rows)),
            Err(e @ StoreError::Query(_)) => {
                warn!(sql = %sql, error = %e, "generated query failed");
                if e.to_string().to_lowercase().contains("no such")
                    || e.to_string().contains("does not exist")
                {
                    Ok("I couldn't execute the query: one of the tables or columns was not found."
                        .to_string())
                } else {
                    Ok("I couldn't execute the query due to an error.".to_string())
                }
            }
            Err(e) => Err(e.into()),
        }
    }
}
