//! PostgreSQL driver backed by `sqlx`

use crate::db::{ConnectionParams, DatabaseDriver, DatabaseSession, QueryRows, Row, SqlDialect};
use crate::error::{QueryError, Result};
use crate::schema::{ColumnDef, Relationship};
use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Column, PgPool, Row as _, TypeInfo};
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_PORT: u16 = 5432;
const DEFAULT_SCHEMA: &str = "public";

#[derive(Debug, Default, Clone)]
pub struct PostgresDriver;

impl PostgresDriver {
    pub fn new() -> Self {
        Self
    }

    pub fn connection_url(params: &ConnectionParams) -> String {
        let port = params.port.unwrap_or(DEFAULT_PORT);
        let credentials = match (&params.username, &params.password) {
            (Some(user), Some(password)) => format!("{}:{}@", user, password),
            (Some(user), None) => format!("{}@", user),
            _ => String::new(),
        };
        format!(
            "postgres://{}{}:{}/{}",
            credentials, params.server, port, params.database
        )
    }
}

#[async_trait]
impl DatabaseDriver for PostgresDriver {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn connect(&self, params: &ConnectionParams) -> Result<Box<dyn DatabaseSession>> {
        let url = Self::connection_url(params);
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&url)
            .await
            .map_err(|e| {
                QueryError::Connection(format!(
                    "Failed to connect to {}/{}: {}",
                    params.server, params.database, e
                ))
            })?;

        info!("Connected to PostgreSQL {}/{}", params.server, params.database);
        Ok(Box::new(PostgresSession {
            pool,
            schema: params
                .schema
                .clone()
                .unwrap_or_else(|| DEFAULT_SCHEMA.to_string()),
        }))
    }
}

pub struct PostgresSession {
    pool: PgPool,
    schema: String,
}

#[async_trait]
impl DatabaseSession for PostgresSession {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::Postgres
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT table_name::text AS table_name
            FROM information_schema.tables
            WHERE table_schema = $1 AND table_type = 'BASE TABLE'
            ORDER BY table_name
            "#,
        )
        .bind(&self.schema)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| row.get::<String, _>("table_name"))
            .collect())
    }

    async fn get_columns(&self, table: &str) -> Result<Vec<ColumnDef>> {
        let rows = sqlx::query(
            r#"
            SELECT c.column_name::text AS column_name,
                   c.data_type::text AS data_type,
                   c.is_nullable = 'YES' AS nullable,
                   EXISTS (
                       SELECT 1
                       FROM information_schema.table_constraints tc
                       JOIN information_schema.key_column_usage kcu
                         ON tc.constraint_name = kcu.constraint_name
                        AND tc.table_schema = kcu.table_schema
                       WHERE tc.constraint_type = 'PRIMARY KEY'
                         AND tc.table_schema = c.table_schema
                         AND tc.table_name = c.table_name
                         AND kcu.column_name = c.column_name
                   ) AS is_primary_key
            FROM information_schema.columns c
            WHERE c.table_schema = $1 AND c.table_name = $2
            ORDER BY c.ordinal_position
            "#,
        )
        .bind(&self.schema)
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ColumnDef {
                name: row.get("column_name"),
                data_type: row.get("data_type"),
                nullable: row.get("nullable"),
                is_primary_key: row.get("is_primary_key"),
                aliases: Vec::new(),
            })
            .collect())
    }

    async fn get_relationships(&self) -> Result<Vec<Relationship>> {
        let rows = sqlx::query(
            r#"
            SELECT ccu.table_name::text  AS parent_table,
                   ccu.column_name::text AS parent_column,
                   kcu.table_name::text  AS child_table,
                   kcu.column_name::text AS child_column
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
              ON tc.constraint_name = kcu.constraint_name
             AND tc.table_schema = kcu.table_schema
            JOIN information_schema.constraint_column_usage ccu
              ON ccu.constraint_name = tc.constraint_name
             AND ccu.table_schema = tc.table_schema
            WHERE tc.constraint_type = 'FOREIGN KEY' AND tc.table_schema = $1
            ORDER BY kcu.table_name, kcu.column_name
            "#,
        )
        .bind(&self.schema)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| Relationship {
                parent_table: row.get("parent_table"),
                parent_column: row.get("parent_column"),
                child_table: row.get("child_table"),
                child_column: row.get("child_column"),
            })
            .collect())
    }

    async fn execute_query(&self, sql: &str, limit: Option<u64>) -> Result<QueryRows> {
        debug!("Executing on PostgreSQL: {}", sql);
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| QueryError::Execution(e.to_string()))?;

        let columns: Vec<String> = rows
            .first()
            .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();

        let cap = limit.map(|l| l as usize).unwrap_or(usize::MAX);
        let rows = rows.iter().take(cap).map(row_to_json).collect();
        Ok(QueryRows { columns, rows })
    }

    async fn disconnect(&self) {
        self.pool.close().await;
    }
}

fn row_to_json(row: &PgRow) -> Row {
    row.columns()
        .iter()
        .map(|column| {
            let idx = column.ordinal();
            let value = decode_value(row, idx, column.type_info().name());
            (column.name().to_string(), value)
        })
        .collect()
}

fn decode_value(row: &PgRow, idx: usize, type_name: &str) -> serde_json::Value {
    use serde_json::Value;

    let decoded = match type_name {
        "BOOL" => row.try_get::<Option<bool>, _>(idx).map(|v| v.map(Value::from)),
        "INT2" => row.try_get::<Option<i16>, _>(idx).map(|v| v.map(Value::from)),
        "INT4" => row.try_get::<Option<i32>, _>(idx).map(|v| v.map(Value::from)),
        "INT8" => row.try_get::<Option<i64>, _>(idx).map(|v| v.map(Value::from)),
        "FLOAT4" => row.try_get::<Option<f32>, _>(idx).map(|v| v.map(Value::from)),
        "FLOAT8" => row.try_get::<Option<f64>, _>(idx).map(|v| v.map(Value::from)),
        "UUID" => row
            .try_get::<Option<uuid::Uuid>, _>(idx)
            .map(|v| v.map(|u| Value::from(u.to_string()))),
        "DATE" => row
            .try_get::<Option<chrono::NaiveDate>, _>(idx)
            .map(|v| v.map(|d| Value::from(d.to_string()))),
        "TIMESTAMP" => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(idx)
            .map(|v| v.map(|d| Value::from(d.to_string()))),
        "TIMESTAMPTZ" => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx)
            .map(|v| v.map(|d| Value::from(d.to_rfc3339()))),
        _ => row.try_get::<Option<String>, _>(idx).map(|v| v.map(Value::from)),
    };

    match decoded {
        Ok(Some(value)) => value,
        Ok(None) => Value::Null,
        Err(e) => {
            warn!("Could not decode column {} of type {}: {}", idx, type_name, e);
            Value::Null
        }
    }
}
