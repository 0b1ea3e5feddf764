use crate::db::{connect_with_retry, ConnectionParams, DatabaseDriver, DatabaseSession};
use crate::error::{QueryError, Result};
use crate::schema::aliases::{derive_aliases, infer_relationships};
use crate::schema::types::{SchemaSnapshot, TableDef};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Source of fresh schema snapshots for the cache.
#[async_trait]
pub trait SchemaFetcher: Send + Sync {
    async fn fetch(&self, params: &ConnectionParams) -> Result<SchemaSnapshot>;
}

/// Introspects a live database through a [`DatabaseDriver`].
pub struct DriverSchemaFetcher {
    driver: Arc<dyn DatabaseDriver>,
    timeout: Duration,
    connect_retries: u32,
}

impl DriverSchemaFetcher {
    pub fn new(driver: Arc<dyn DatabaseDriver>, timeout: Duration, connect_retries: u32) -> Self {
        Self {
            driver,
            timeout,
            connect_retries,
        }
    }

    async fn introspect(session: &dyn DatabaseSession) -> Result<SchemaSnapshot> {
        let names = session.list_tables().await?;
        let mut tables = Vec::with_capacity(names.len());
        for name in names {
            let columns = session.get_columns(&name).await?;
            debug!("Table {} has {} columns", name, columns.len());
            tables.push(TableDef::new(name, columns));
        }

        let mut relationships = session.get_relationships().await?;
        derive_aliases(&mut tables);
        let inferred = infer_relationships(&tables, &relationships);
        if !inferred.is_empty() {
            debug!("Inferred {} relationships from naming", inferred.len());
        }
        relationships.extend(inferred);

        Ok(SchemaSnapshot::new(tables, relationships))
    }
}

#[async_trait]
impl SchemaFetcher for DriverSchemaFetcher {
    async fn fetch(&self, params: &ConnectionParams) -> Result<SchemaSnapshot> {
        let session = connect_with_retry(self.driver.as_ref(), params, self.timeout, self.connect_retries).await?;
        let snapshot = match tokio::time::timeout(self.timeout, Self::introspect(session.as_ref())).await {
            Ok(result) => result,
            Err(_) => Err(QueryError::Connection(format!(
                "Timed out after {}ms reading the catalog of {}/{}",
                self.timeout.as_millis(),
                params.server,
                params.database
            ))),
        };
        session.disconnect().await;

        let snapshot = snapshot?;
        info!(
            "Introspected {}/{} via {}: {} tables, {} relationships",
            params.server,
            params.database,
            self.driver.name(),
            snapshot.tables.len(),
            snapshot.relationships.len()
        );
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::{InMemoryDriver, MemoryTable};
    use crate::db::{QueryRows, SqlDialect};
    use crate::schema::{ColumnDef, Relationship};
    use serde_json::json;
    use std::time::Instant;

    #[tokio::test]
    async fn test_fetch_derives_aliases_and_relationships() {
        let driver = InMemoryDriver::new()
            .with_table(MemoryTable::new(
                "Clients",
                vec![
                    ColumnDef::new("client_id", "int").primary_key(),
                    ColumnDef::new("first_name", "varchar"),
                ],
                vec![],
            ))
            .with_table(MemoryTable::new(
                "Orders",
                vec![
                    ColumnDef::new("order_id", "int").primary_key(),
                    ColumnDef::new("client_id", "int"),
                ],
                vec![json!({"order_id": 1, "client_id": 1})],
            ));
        let fetcher = DriverSchemaFetcher::new(Arc::new(driver), Duration::from_secs(5), 0);

        let snapshot = fetcher.fetch(&ConnectionParams::new("memory", "crm")).await.unwrap();
        let clients = snapshot.table("Clients").unwrap();
        assert!(clients.answers_to("client"));
        assert!(clients
            .column("first_name")
            .unwrap()
            .aliases
            .contains(&"first name".to_string()));
        assert_eq!(snapshot.relationships.len(), 1);
        assert_eq!(snapshot.relationships[0].child_table, "Orders");
    }

    #[tokio::test]
    async fn test_declared_relationship_is_not_duplicated() {
        let driver = InMemoryDriver::new()
            .with_table(MemoryTable::new(
                "Clients",
                vec![ColumnDef::new("client_id", "int").primary_key()],
                vec![],
            ))
            .with_table(MemoryTable::new(
                "Orders",
                vec![
                    ColumnDef::new("order_id", "int").primary_key(),
                    ColumnDef::new("buyer", "int"),
                    ColumnDef::new("client_id", "int"),
                ],
                vec![],
            ))
            .with_relationship(Relationship {
                parent_table: "Clients".to_string(),
                parent_column: "client_id".to_string(),
                child_table: "Orders".to_string(),
                child_column: "buyer".to_string(),
            });
        let fetcher = DriverSchemaFetcher::new(Arc::new(driver), Duration::from_secs(5), 0);

        let snapshot = fetcher.fetch(&ConnectionParams::new("memory", "crm")).await.unwrap();
        assert_eq!(snapshot.relationships.len(), 1);
        assert_eq!(snapshot.relationships[0].child_column, "buyer");
    }

    struct StalledDriver;

    struct StalledSession;

    #[async_trait]
    impl DatabaseDriver for StalledDriver {
        fn name(&self) -> &'static str {
            "stalled"
        }

        async fn connect(&self, _params: &ConnectionParams) -> Result<Box<dyn DatabaseSession>> {
            Ok(Box::new(StalledSession))
        }
    }

    #[async_trait]
    impl DatabaseSession for StalledSession {
        fn dialect(&self) -> SqlDialect {
            SqlDialect::Generic
        }

        async fn list_tables(&self) -> Result<Vec<String>> {
            tokio::time::sleep(Duration::from_secs(3)).await;
            Ok(vec!["Clients".to_string()])
        }

        async fn get_columns(&self, _table: &str) -> Result<Vec<ColumnDef>> {
            Ok(Vec::new())
        }

        async fn execute_query(&self, _sql: &str, _limit: Option<u64>) -> Result<QueryRows> {
            Ok(QueryRows::default())
        }

        async fn disconnect(&self) {}
    }

    #[tokio::test]
    async fn test_slow_catalog_times_out() {
        let fetcher = DriverSchemaFetcher::new(Arc::new(StalledDriver), Duration::from_millis(100), 0);
        let started = Instant::now();
        let err = fetcher.fetch(&ConnectionParams::new("slow", "crm")).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(err, QueryError::Connection(msg) if msg.contains("Timed out")));
    }
}
