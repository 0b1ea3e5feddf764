//! Database driver contract
//!
//! The pipeline never talks to a database directly. A [`DatabaseDriver`] opens a
//! [`DatabaseSession`] per request; sessions enumerate schema metadata and run
//! statements. `postgres` is the production driver, `memory` serves in-process
//! tables for local runs and tests.

pub mod memory;
pub mod postgres;

use crate::error::{QueryError, Result};
use crate::llm::backoff_delay;
use crate::schema::{ColumnDef, Relationship};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

pub use memory::InMemoryDriver;
pub use postgres::PostgresDriver;

/// One result row keyed by column name.
pub type Row = HashMap<String, serde_json::Value>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionParams {
    pub server: String,
    pub database: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub trusted_connection: Option<bool>,
    /// Driver hint, e.g. "postgres", "sqlserver", "memory".
    #[serde(default)]
    pub driver: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    /// Database schema (namespace) to introspect.
    #[serde(default)]
    pub schema: Option<String>,
}

impl ConnectionParams {
    pub fn new(server: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            database: database.into(),
            ..Self::default()
        }
    }

    /// Dialect implied by the driver hint.
    pub fn dialect(&self) -> SqlDialect {
        self.driver
            .as_deref()
            .map(SqlDialect::from_driver_hint)
            .unwrap_or(SqlDialect::Generic)
    }
}

/// SQL flavour used for row caps and placeholders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    Postgres,
    SqlServer,
    Generic,
}

impl SqlDialect {
    pub fn from_driver_hint(hint: &str) -> Self {
        let hint = hint.to_lowercase();
        if hint.contains("postgres") || hint.contains("pg") {
            SqlDialect::Postgres
        } else if hint.contains("sql server") || hint.contains("sqlserver") || hint.contains("mssql") {
            SqlDialect::SqlServer
        } else {
            SqlDialect::Generic
        }
    }

    /// Whether row caps are expressed as `SELECT TOP n` instead of `LIMIT n`.
    pub fn uses_top(&self) -> bool {
        matches!(self, SqlDialect::SqlServer)
    }

    /// Positional parameter placeholder (1-based).
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            SqlDialect::Postgres => format!("${}", index),
            _ => "?".to_string(),
        }
    }

    pub fn boolean_literal(&self, value: bool) -> &'static str {
        match (self, value) {
            (SqlDialect::SqlServer, true) => "1",
            (SqlDialect::SqlServer, false) => "0",
            (_, true) => "TRUE",
            (_, false) => "FALSE",
        }
    }

    pub fn sqlparser_dialect(&self) -> Box<dyn sqlparser::dialect::Dialect> {
        match self {
            SqlDialect::Postgres => Box::new(sqlparser::dialect::PostgreSqlDialect {}),
            SqlDialect::SqlServer => Box::new(sqlparser::dialect::MsSqlDialect {}),
            SqlDialect::Generic => Box::new(sqlparser::dialect::GenericDialect {}),
        }
    }
}

/// Rows and column order returned by a statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl QueryRows {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
pub trait DatabaseDriver: Send + Sync {
    fn name(&self) -> &'static str;

    async fn connect(&self, params: &ConnectionParams) -> Result<Box<dyn DatabaseSession>>;
}

#[async_trait]
pub trait DatabaseSession: Send + Sync {
    fn dialect(&self) -> SqlDialect;

    async fn list_tables(&self) -> Result<Vec<String>>;

    async fn get_columns(&self, table: &str) -> Result<Vec<ColumnDef>>;

    /// Declared foreign keys. Drivers without catalog support return nothing.
    async fn get_relationships(&self) -> Result<Vec<Relationship>> {
        Ok(Vec::new())
    }

    async fn execute_query(&self, sql: &str, limit: Option<u64>) -> Result<QueryRows>;

    async fn disconnect(&self);
}

/// Connect with a timeout per attempt and exponential backoff between
/// transient failures.
pub async fn connect_with_retry(
    driver: &dyn DatabaseDriver,
    params: &ConnectionParams,
    timeout: Duration,
    retries: u32,
) -> Result<Box<dyn DatabaseSession>> {
    let mut attempt = 0u32;
    loop {
        let outcome = match tokio::time::timeout(timeout, driver.connect(params)).await {
            Ok(result) => result,
            Err(_) => Err(QueryError::Connection(format!(
                "Timed out after {}s connecting to {}/{}",
                timeout.as_secs(),
                params.server,
                params.database
            ))),
        };

        match outcome {
            Ok(session) => return Ok(session),
            Err(e) if e.is_transient() && attempt < retries => {
                let delay = backoff_delay(Duration::from_millis(250), attempt);
                warn!(
                    "Connection to {}/{} failed: {} (retrying in {}ms)",
                    params.server,
                    params.database,
                    e,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(QueryError::Connection(msg)) => return Err(QueryError::Connection(msg)),
            Err(e) => return Err(QueryError::Connection(e.to_string())),
        }
    }
}

/// Run a statement under a timeout.
pub async fn execute_with_timeout(
    session: &dyn DatabaseSession,
    sql: &str,
    limit: Option<u64>,
    timeout: Duration,
) -> Result<QueryRows> {
    match tokio::time::timeout(timeout, session.execute_query(sql, limit)).await {
        Ok(result) => result,
        Err(_) => Err(QueryError::Execution(format!(
            "Query timed out after {}s",
            timeout.as_secs()
        ))),
    }
}
