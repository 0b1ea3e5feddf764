//! In-process driver over JSON rows
//!
//! Serves single-table SELECTs well enough for local runs and tests:
//! projection, TOP/LIMIT, AND-joined comparisons and ORDER BY. Table and column
//! names match case-insensitively; string equality is case-sensitive.

use crate::db::{ConnectionParams, DatabaseDriver, DatabaseSession, QueryRows, Row, SqlDialect};
use crate::error::{QueryError, Result};
use crate::schema::{ColumnDef, Relationship};
use crate::sql::scanner::{CompareOp, Condition, Literal, SqlScanner, StatementKind, TokenScanner};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryTable {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    #[serde(default)]
    pub rows: Vec<Value>,
}

impl MemoryTable {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDef>, rows: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            columns,
            rows,
        }
    }

    fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }
}

/// On-disk layout accepted by [`InMemoryDriver::from_json_file`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryDataset {
    pub tables: Vec<MemoryTable>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryDriver {
    dataset: Arc<MemoryDataset>,
}

impl InMemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_dataset(dataset: MemoryDataset) -> Self {
        Self {
            dataset: Arc::new(dataset),
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let dataset: MemoryDataset = serde_json::from_str(json)?;
        Ok(Self::from_dataset(dataset))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let driver = Self::from_json_str(&json)?;
        info!("Loaded {} in-memory tables from {}", driver.dataset.tables.len(), path.display());
        Ok(driver)
    }

    pub fn with_table(mut self, table: MemoryTable) -> Self {
        Arc::make_mut(&mut self.dataset).tables.push(table);
        self
    }

    pub fn with_relationship(mut self, relationship: Relationship) -> Self {
        Arc::make_mut(&mut self.dataset).relationships.push(relationship);
        self
    }
}

#[async_trait]
impl DatabaseDriver for InMemoryDriver {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self, params: &ConnectionParams) -> Result<Box<dyn DatabaseSession>> {
        debug!("Opening in-memory session for {}/{}", params.server, params.database);
        Ok(Box::new(InMemorySession {
            dataset: Arc::clone(&self.dataset),
            scanner: TokenScanner::new(SqlDialect::Generic),
        }))
    }
}

pub struct InMemorySession {
    dataset: Arc<MemoryDataset>,
    scanner: TokenScanner,
}

impl InMemorySession {
    fn table(&self, name: &str) -> Result<&MemoryTable> {
        self.dataset
            .tables
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| QueryError::Execution(format!("relation \"{}\" does not exist", name)))
    }

    fn select(&self, sql: &str, limit: Option<u64>) -> Result<QueryRows> {
        let statement = self.scanner.scan(sql)?;
        if statement.kind != StatementKind::Select {
            return Err(unsupported("only SELECT statements are supported"));
        }
        if statement.has_group_by || statement.distinct {
            return Err(unsupported("GROUP BY and DISTINCT are not supported"));
        }
        let table_ref = statement
            .single_table()
            .ok_or_else(|| unsupported("exactly one table without joins or subqueries is supported"))?;
        let table = self.table(&table_ref.name)?;

        let columns = projected_columns(table, &statement.projection)?;

        let conditions = match (&statement.where_clause, &statement.conditions) {
            (None, _) => Vec::new(),
            (Some(_), Some(conditions)) => conditions.clone(),
            (Some(clause), None) => return Err(unsupported(&format!("cannot evaluate WHERE {}", clause))),
        };
        for condition in &conditions {
            if table.column(&condition.column).is_none() {
                return Err(QueryError::Execution(format!(
                    "column \"{}\" does not exist",
                    condition.column
                )));
            }
        }

        let mut matched: Vec<&Value> = Vec::new();
        for row in &table.rows {
            let mut keep = true;
            for condition in &conditions {
                if !evaluate(row, condition)? {
                    keep = false;
                    break;
                }
            }
            if keep {
                matched.push(row);
            }
        }

        if !statement.order_by.is_empty() {
            let mut keys = Vec::new();
            for term in &statement.order_by {
                let column = bare_column(&term.expr)
                    .and_then(|c| table.column(c))
                    .ok_or_else(|| unsupported(&format!("cannot order by {}", term.expr)))?;
                keys.push((column.name.clone(), term.descending));
            }
            matched.sort_by(|a, b| {
                for (column, descending) in &keys {
                    let ordering = compare_values(field(a, column), field(b, column));
                    let ordering = if *descending { ordering.reverse() } else { ordering };
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                Ordering::Equal
            });
        }

        let cap = [statement.top, statement.limit, limit]
            .into_iter()
            .flatten()
            .min()
            .map(|c| c as usize)
            .unwrap_or(usize::MAX);

        let rows: Vec<Row> = matched
            .into_iter()
            .take(cap)
            .map(|row| {
                columns
                    .iter()
                    .map(|c| (c.clone(), field(row, c).cloned().unwrap_or(Value::Null)))
                    .collect()
            })
            .collect();

        Ok(QueryRows { columns, rows })
    }
}

#[async_trait]
impl DatabaseSession for InMemorySession {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::Generic
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        Ok(self.dataset.tables.iter().map(|t| t.name.clone()).collect())
    }

    async fn get_columns(&self, table: &str) -> Result<Vec<ColumnDef>> {
        Ok(self.table(table)?.columns.clone())
    }

    async fn get_relationships(&self) -> Result<Vec<Relationship>> {
        Ok(self.dataset.relationships.clone())
    }

    async fn execute_query(&self, sql: &str, limit: Option<u64>) -> Result<QueryRows> {
        debug!("Executing in memory: {}", sql);
        self.select(sql, limit)
    }

    async fn disconnect(&self) {}
}

fn unsupported(what: &str) -> QueryError {
    QueryError::Execution(format!("In-memory driver: {}", what))
}

/// `col` or `table.col` with no other tokens.
fn bare_column(expr: &str) -> Option<&str> {
    let last = expr.rsplit('.').next()?.trim();
    let valid = !last.is_empty() && last.chars().all(|c| c.is_alphanumeric() || c == '_');
    valid.then_some(last)
}

fn projected_columns(table: &MemoryTable, projection: &[String]) -> Result<Vec<String>> {
    let all = || table.columns.iter().map(|c| c.name.clone()).collect::<Vec<_>>();
    let mut columns = Vec::new();
    for item in projection {
        if item == "*" || item.ends_with(".*") {
            columns.extend(all());
            continue;
        }
        let column = bare_column(item)
            .and_then(|c| table.column(c))
            .ok_or_else(|| QueryError::Execution(format!("column \"{}\" does not exist", item)))?;
        columns.push(column.name.clone());
    }
    if columns.is_empty() {
        columns = all();
    }
    Ok(columns)
}

fn field<'a>(row: &'a Value, column: &str) -> Option<&'a Value> {
    let object = row.as_object()?;
    object
        .get(column)
        .or_else(|| object.iter().find(|(k, _)| k.eq_ignore_ascii_case(column)).map(|(_, v)| v))
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match (as_number(a), as_number(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => as_text(a).cmp(&as_text(b)),
        },
    }
}

fn like_regex(pattern: &str) -> Result<Regex> {
    let mut expr = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '%' => expr.push_str(".*"),
            '_' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).map_err(|e| QueryError::Execution(format!("bad LIKE pattern: {}", e)))
}

fn evaluate(row: &Value, condition: &Condition) -> Result<bool> {
    let value = field(row, &condition.column).filter(|v| !v.is_null());

    match condition.op {
        CompareOp::IsNull => return Ok(value.is_none()),
        CompareOp::IsNotNull => return Ok(value.is_some()),
        _ => {}
    }
    let Some(value) = value else {
        return Ok(false);
    };

    let ordering = match &condition.value {
        Literal::Null => return Ok(false),
        Literal::Placeholder(p) => {
            return Err(QueryError::Execution(format!("unbound parameter {}", p)));
        }
        Literal::Number(n) => match as_number(value) {
            Some(x) => x.partial_cmp(n),
            None => return Ok(false),
        },
        Literal::Bool(b) => match as_number(value) {
            Some(x) => x.partial_cmp(&if *b { 1.0 } else { 0.0 }),
            None => return Ok(false),
        },
        Literal::Text(text) => {
            let mut left = as_text(value).unwrap_or_default();
            if condition.lower_column {
                left = left.to_lowercase();
            }
            let right = if condition.lower_value { text.to_lowercase() } else { text.clone() };
            match condition.op {
                CompareOp::Like => return Ok(like_regex(&right)?.is_match(&left)),
                CompareOp::NotLike => return Ok(!like_regex(&right)?.is_match(&left)),
                _ => match (left.parse::<f64>(), right.parse::<f64>()) {
                    (Ok(x), Ok(y)) if !matches!(value, Value::String(_)) => x.partial_cmp(&y),
                    _ => Some(left.cmp(&right)),
                },
            }
        }
    };

    let Some(ordering) = ordering else {
        return Ok(false);
    };
    Ok(match condition.op {
        CompareOp::Eq => ordering == Ordering::Equal,
        CompareOp::NotEq => ordering != Ordering::Equal,
        CompareOp::Lt => ordering == Ordering::Less,
        CompareOp::Gt => ordering == Ordering::Greater,
        CompareOp::LtEq => ordering != Ordering::Greater,
        CompareOp::GtEq => ordering != Ordering::Less,
        CompareOp::Like | CompareOp::NotLike | CompareOp::IsNull | CompareOp::IsNotNull => false,
    })
}
