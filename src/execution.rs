//! Statement execution with zero-row and error diagnostics
//!
//! SELECTs get a row cap before they run. When a single-table SELECT returns
//! nothing, a short ladder of follow-up queries looks for the likely cause:
//! a mis-cased table name, case-sensitive text equality, or filters that
//! simply match no rows. Driver errors come back with the offending SQL and,
//! where the table is known, an unfiltered sample.

use crate::db::{
    connect_with_retry, execute_with_timeout, ConnectionParams, DatabaseDriver, DatabaseSession, QueryRows,
    Row, SqlDialect,
};
use crate::schema::SchemaSnapshot;
use crate::sql::scanner::{ScannedStatement, SqlScanner, StatementKind, TokenScanner};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

lazy_static! {
    static ref SELECT_HEAD: Regex = Regex::new(r"(?i)^\s*SELECT(\s+DISTINCT)?\b").unwrap();
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub executed: bool,
    pub rows: Option<Vec<Row>>,
    pub columns: Option<Vec<String>>,
    pub row_count: usize,
    pub error: Option<String>,
    pub elapsed_ms: u64,
    /// Rows come from a diagnostic query rather than the statement itself.
    pub recovered_results: bool,
    /// Rows come from an unfiltered sample taken after an error.
    pub simplified_query: bool,
    pub diagnostics: Vec<String>,
}

impl ExecutionResult {
    fn with_rows(mut self, rows: QueryRows) -> Self {
        self.row_count = rows.rows.len();
        self.columns = Some(rows.columns);
        self.rows = Some(rows.rows);
        self
    }

    fn failed(error: String) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }
}

/// `sql` with a row cap for `dialect`, unless it already has one.
pub fn apply_row_cap(sql: &str, dialect: SqlDialect, limit: u64) -> String {
    let trimmed = sql.trim().trim_end_matches(';').trim_end();
    if dialect.uses_top() {
        SELECT_HEAD
            .replace(trimmed, |caps: &regex::Captures| {
                format!("SELECT{} TOP {}", caps.get(1).map(|m| m.as_str().to_uppercase()).unwrap_or_default(), limit)
            })
            .into_owned()
    } else {
        format!("{} LIMIT {}", trimmed, limit)
    }
}

/// Unfiltered sample of `table`.
pub fn sample_query(table: &str, dialect: SqlDialect, rows: u64) -> String {
    if dialect.uses_top() {
        format!("SELECT TOP {} * FROM {}", rows, table)
    } else {
        format!("SELECT * FROM {} LIMIT {}", table, rows)
    }
}

pub struct Executor {
    driver: Arc<dyn DatabaseDriver>,
    timeout: Duration,
    connect_retries: u32,
    sample_rows: u64,
}

impl Executor {
    pub fn new(driver: Arc<dyn DatabaseDriver>, timeout: Duration, connect_retries: u32, sample_rows: u64) -> Self {
        Self {
            driver,
            timeout,
            connect_retries,
            sample_rows,
        }
    }

    pub async fn execute(
        &self,
        sql: &str,
        params: &ConnectionParams,
        limit: Option<u64>,
        schema: &SchemaSnapshot,
    ) -> ExecutionResult {
        let started = Instant::now();
        let session = match connect_with_retry(self.driver.as_ref(), params, self.timeout, self.connect_retries).await {
            Ok(session) => session,
            Err(e) => {
                let mut result = ExecutionResult::failed(e.to_string());
                result.elapsed_ms = elapsed_ms(started);
                return result;
            }
        };

        let mut result = self.run(session.as_ref(), sql, limit, schema).await;
        session.disconnect().await;
        result.elapsed_ms = elapsed_ms(started);
        info!(
            "Executed in {}ms: {} rows{}",
            result.elapsed_ms,
            result.row_count,
            if result.recovered_results { " (recovered)" } else { "" }
        );
        result
    }

    async fn run(
        &self,
        session: &dyn DatabaseSession,
        sql: &str,
        limit: Option<u64>,
        schema: &SchemaSnapshot,
    ) -> ExecutionResult {
        let dialect = session.dialect();
        let scanner = TokenScanner::new(dialect);
        let statement = scanner.scan(sql).ok();
        let is_select = statement
            .as_ref()
            .map(|s| matches!(s.kind, StatementKind::Select | StatementKind::With))
            .unwrap_or(false);

        let sql = match (limit, &statement) {
            (Some(limit), Some(s)) if s.kind == StatementKind::Select && !s.has_row_cap() => {
                apply_row_cap(sql, dialect, limit)
            }
            _ => sql.trim().trim_end_matches(';').to_string(),
        };
        let row_limit = if is_select { limit } else { None };
        debug!("Executing: {}", sql);

        match execute_with_timeout(session, &sql, row_limit, self.timeout).await {
            Ok(rows) if rows.is_empty() && is_select => {
                let mut result = ExecutionResult {
                    executed: true,
                    ..ExecutionResult::default()
                }
                .with_rows(rows);
                if let Some(statement) = statement.as_ref() {
                    self.diagnose_empty(session, &scanner, statement, schema, row_limit, &mut result)
                        .await;
                }
                result
            }
            Ok(rows) => ExecutionResult {
                executed: true,
                ..ExecutionResult::default()
            }
            .with_rows(rows),
            Err(e) => {
                warn!("Statement failed: {}", e);
                let mut result = ExecutionResult::failed(format!("{} (SQL: {})", e, sql));
                // Only reads get a stand-in sample
                let table = statement
                    .as_ref()
                    .filter(|_| is_select)
                    .and_then(|s| s.tables.first())
                    .and_then(|t| resolve_table(schema, &t.name));
                if let Some(table) = table {
                    let sample = sample_query(&table, dialect, self.sample_rows);
                    match execute_with_timeout(session, &sample, Some(self.sample_rows), self.timeout).await {
                        Ok(rows) => {
                            result.diagnostics.push(format!(
                                "The statement failed; showing an unfiltered sample from {} instead",
                                table
                            ));
                            result.recovered_results = true;
                            result.simplified_query = true;
                            result = result.with_rows(rows);
                        }
                        Err(e) => debug!("Sample query failed too: {}", e),
                    }
                }
                result
            }
        }
    }

    async fn diagnose_empty(
        &self,
        session: &dyn DatabaseSession,
        scanner: &TokenScanner,
        statement: &ScannedStatement,
        schema: &SchemaSnapshot,
        limit: Option<u64>,
        result: &mut ExecutionResult,
    ) {
        let dialect = session.dialect();
        let Some(table) = statement.single_table() else {
            return;
        };
        let Some(real_name) = resolve_table(schema, &table.name) else {
            result
                .diagnostics
                .push(format!("Table {} does not exist in the schema", table.name));
            return;
        };

        let mut current = statement.clone();
        if real_name != table.name {
            let renamed = statement.with_table_renamed(&table.name, &real_name);
            result
                .diagnostics
                .push(format!("Table name corrected from {} to {}", table.name, real_name));
            if self.recover(session, &renamed, limit, result).await {
                return;
            }
            if let Ok(rescanned) = scanner.scan(&renamed) {
                current = rescanned;
            }
        }

        if let Some(relaxed) = current.with_case_insensitive_equalities() {
            if self.recover(session, &relaxed, limit, result).await {
                result
                    .diagnostics
                    .push("Text values matched only when compared case-insensitively".to_string());
                return;
            }
        }

        if current.where_clause.is_some() {
            let sample = sample_query(&real_name, dialect, self.sample_rows);
            if self.recover(session, &sample, Some(self.sample_rows), result).await {
                result.diagnostics.push(format!(
                    "No rows matched the filters; showing {} unfiltered rows from {}",
                    result.row_count, real_name
                ));
                return;
            }
        }

        result.diagnostics.push(format!("Table {} is empty", real_name));
    }

    /// Run a diagnostic query; non-empty rows replace the result's rows.
    async fn recover(
        &self,
        session: &dyn DatabaseSession,
        sql: &str,
        limit: Option<u64>,
        result: &mut ExecutionResult,
    ) -> bool {
        debug!("Diagnostic query: {}", sql);
        match execute_with_timeout(session, sql, limit, self.timeout).await {
            Ok(rows) if !rows.is_empty() => {
                result.row_count = rows.rows.len();
                result.columns = Some(rows.columns);
                result.rows = Some(rows.rows);
                result.recovered_results = true;
                true
            }
            Ok(_) => false,
            Err(e) => {
                debug!("Diagnostic query failed: {}", e);
                false
            }
        }
    }
}

/// Real name of `name` in the schema, matched case-insensitively.
fn resolve_table(schema: &SchemaSnapshot, name: &str) -> Option<String> {
    schema
        .table(name)
        .or_else(|| schema.tables.values().find(|t| t.name.eq_ignore_ascii_case(name)))
        .map(|t| t.name.clone())
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
