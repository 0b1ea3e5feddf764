use async_trait::async_trait;
use querysmith::config::EngineConfig;
use querysmith::db::memory::MemoryTable;
use querysmith::db::{ConnectionParams, InMemoryDriver};
use querysmith::llm::{DisabledGenerator, TextGenerator};
use querysmith::orchestrator::{ConversionRequest, QueryEngine};
use querysmith::reflection::AttemptSource;
use querysmith::schema::{ColumnDef, DriverSchemaFetcher, SchemaCache, SchemaFetcher, SchemaSnapshot};
use querysmith::{QueryError, Result};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn clients_driver(rows: usize) -> Arc<InMemoryDriver> {
    let rows = (1..=rows)
        .map(|i| {
            json!({
                "client_id": i,
                "first_name": format!("First{}", i),
                "last_name": format!("Last{}", i),
                "email": format!("client{}@example.com", i),
                "phone": format!("555-010{}", i),
            })
        })
        .collect();
    Arc::new(InMemoryDriver::new().with_table(MemoryTable::new(
        "Clients",
        vec![
            ColumnDef::new("client_id", "int").primary_key(),
            ColumnDef::new("first_name", "varchar"),
            ColumnDef::new("last_name", "varchar"),
            ColumnDef::new("email", "varchar"),
            ColumnDef::new("phone", "varchar"),
        ],
        rows,
    )))
}

fn connection() -> ConnectionParams {
    ConnectionParams::new("local", "crm")
}

/// Answers each model call site by recognising its prompt.
#[derive(Default)]
struct Routed {
    critique: String,
    sql: String,
    calls: Mutex<Vec<&'static str>>,
}

impl Routed {
    fn new(critique: &str, sql: &str) -> Self {
        Self {
            critique: critique.to_string(),
            sql: sql.to_string(),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn count(&self, kind: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|k| **k == kind).count()
    }
}

#[async_trait]
impl TextGenerator for Routed {
    async fn generate(&self, prompt: &str, system_prompt: Option<&str>) -> Result<String> {
        let system = system_prompt.unwrap_or_default();
        let kind = if system.contains("structured intent") {
            "intent"
        } else if prompt.contains("Judge whether") {
            "critique"
        } else if system.contains("explain SQL") {
            "explain"
        } else {
            "sql"
        };
        self.calls.lock().unwrap().push(kind);
        match kind {
            "intent" => Ok("{}".to_string()),
            "critique" => Ok(self.critique.clone()),
            "explain" => Err(QueryError::Llm("unavailable".to_string())),
            _ => Ok(self.sql.clone()),
        }
    }
}

#[tokio::test]
async fn test_round_trip_select_all() {
    let engine = QueryEngine::new(EngineConfig::default(), clients_driver(7), Arc::new(DisabledGenerator));
    let response = engine
        .convert_text_to_sql(ConversionRequest::new("Show all clients", connection()).executing())
        .await;

    assert!(response.success, "{:?}", response.error);
    assert_eq!(response.sql.as_deref(), Some("SELECT * FROM Clients"));
    assert_eq!(response.row_count, Some(7));
    assert_eq!(response.columns.as_ref().map(Vec::len), Some(5));
    assert!(!response.recovered_results);
    assert!(!response.reflection_applied);
    assert_eq!(response.iterations, 1);
    assert_eq!(
        response.explanation.as_deref(),
        Some("This query retrieves all columns from the Clients table.")
    );
    assert!(!response.request_id.is_empty());
}

#[tokio::test]
async fn test_unknown_state_word_is_reported_unmapped() {
    let engine = QueryEngine::new(EngineConfig::default(), clients_driver(3), Arc::new(DisabledGenerator));
    let response = engine
        .convert_text_to_sql(ConversionRequest::new("Show all clients that are active", connection()))
        .await;

    assert!(response.success);
    assert_eq!(response.sql.as_deref(), Some("SELECT * FROM Clients"));
    assert_eq!(response.unmapped_columns, vec!["active"]);
    assert!(response.warnings.iter().any(|w| w.contains("active")));
    assert!(response
        .explanation
        .unwrap_or_default()
        .contains("'active' does not match any column"));
    assert!(response.result.is_none());
}

#[tokio::test]
async fn test_zero_rows_fall_back_to_sample() {
    let engine = QueryEngine::new(EngineConfig::default(), clients_driver(7), Arc::new(DisabledGenerator));
    let response = engine
        .convert_text_to_sql(
            ConversionRequest::new("Show clients where client_id = 999999", connection()).executing(),
        )
        .await;

    assert!(response.success);
    assert_eq!(
        response.sql.as_deref(),
        Some("SELECT * FROM Clients WHERE client_id = 999999")
    );
    assert!(response.recovered_results);
    assert!(!response.simplified_query);
    let rows = response.result.unwrap();
    assert!(!rows.is_empty() && rows.len() <= 5);
    assert!(response
        .warnings
        .iter()
        .any(|w| w.starts_with("No rows matched the filters")));
}

#[tokio::test]
async fn test_reflection_stops_at_iteration_cap() {
    let critique = r#"{"rating": 3, "issues": ["too broad"], "suggestions": ["narrow it"], "needs_regeneration": true, "improved_sql": null}"#;
    let llm = Arc::new(Routed::new(critique, "SELECT client_id, email FROM Clients"));
    let engine = QueryEngine::new(EngineConfig::default(), clients_driver(3), llm.clone());

    let response = engine
        .convert_text_to_sql(ConversionRequest::new("Show all clients", connection()))
        .await;

    assert!(response.success);
    assert_eq!(response.iterations, 3);
    assert_eq!(llm.count("critique"), 3);
    assert_eq!(llm.count("sql"), 2);
    assert!(response.reflection_applied);
    assert_eq!(response.sql.as_deref(), Some("SELECT client_id, email FROM Clients"));
    assert!(response
        .warnings
        .iter()
        .any(|w| w.contains("max iterations reached")));
}

#[tokio::test]
async fn test_model_fallback_output_is_validated() {
    let critique = r#"{"rating": 9, "issues": [], "suggestions": [], "needs_regeneration": false}"#;
    let llm = Arc::new(Routed::new(critique, "SELECT AVG(score) FROM Customers"));
    let engine = QueryEngine::new(EngineConfig::default(), clients_driver(3), llm.clone());

    let response = engine
        .convert_text_to_sql(ConversionRequest::new("What is the average for clients", connection()))
        .await;

    assert!(!response.success);
    assert_eq!(llm.count("sql"), 1);
    assert_eq!(llm.count("critique"), 0);
    assert_eq!(response.sql.as_deref(), Some("SELECT AVG(score) FROM Customers"));
    let error = response.error.unwrap();
    assert!(error.starts_with("Validation error"), "{}", error);
    assert!(error.contains("Customers"), "{}", error);

    let rejected = response.attempts.last().unwrap();
    assert_eq!(rejected.source, AttemptSource::ModelFallback);
    assert_eq!(rejected.sql, "SELECT AVG(score) FROM Customers");
    assert!(rejected.validation_issues.iter().any(|i| i.contains("Customers")));
}

#[tokio::test]
async fn test_model_fallback_replaces_unbuildable_template() {
    let critique = r#"{"rating": 9, "issues": [], "suggestions": [], "needs_regeneration": false}"#;
    let llm = Arc::new(Routed::new(
        critique,
        "```sql\nSELECT AVG(client_id) AS avg_client_id FROM Clients;\n```",
    ));
    let engine = QueryEngine::new(EngineConfig::default(), clients_driver(3), llm.clone());

    let response = engine
        .convert_text_to_sql(ConversionRequest::new("What is the average for clients", connection()))
        .await;

    assert!(response.success, "{:?}", response.error);
    assert_eq!(
        response.sql.as_deref(),
        Some("SELECT AVG(client_id) AS avg_client_id FROM Clients")
    );
    assert_eq!(llm.count("critique"), 1);
    assert!(!response.reflection_applied);
    let accepted = response.attempts.last().unwrap();
    assert_eq!(accepted.source, AttemptSource::ModelFallback);
    assert!(accepted.validation_issues.is_empty());
}

#[tokio::test]
async fn test_unfiltered_delete_is_refused() {
    let engine = QueryEngine::new(EngineConfig::default(), clients_driver(3), Arc::new(DisabledGenerator));
    let response = engine
        .convert_text_to_sql(ConversionRequest::new("Delete all clients", connection()).executing())
        .await;

    assert!(!response.success);
    assert!(response.sql.is_none());
    assert!(response
        .error
        .unwrap_or_default()
        .contains("Refusing unconditional DELETE"));
}

/// Delegates to the driver fetcher and counts catalog reads.
struct CountingFetcher {
    inner: DriverSchemaFetcher,
    fetches: AtomicUsize,
}

#[async_trait]
impl SchemaFetcher for CountingFetcher {
    async fn fetch(&self, params: &ConnectionParams) -> Result<SchemaSnapshot> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch(params).await
    }
}

#[tokio::test]
async fn test_schema_is_fetched_once_per_connection() {
    let config = EngineConfig::default();
    let driver = clients_driver(3);
    let fetcher = Arc::new(CountingFetcher {
        inner: DriverSchemaFetcher::new(driver.clone(), config.db_timeout(), config.db_connect_retries),
        fetches: AtomicUsize::new(0),
    });
    let cache = Arc::new(SchemaCache::new(fetcher.clone(), config.schema_ttl()));
    let engine = QueryEngine::with_schema_cache(config, driver, Arc::new(DisabledGenerator), cache);

    for query in ["Show all clients", "List clients"] {
        let response = engine
            .convert_text_to_sql(ConversionRequest::new(query, connection()))
            .await;
        assert!(response.success);
    }
    assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);
    assert_eq!(engine.schema_cache().cached_keys().len(), 1);

    engine.schema_cache().invalidate(&connection());
    assert!(engine.schema_cache().cached_keys().is_empty());

    let response = engine
        .convert_text_to_sql(ConversionRequest::new("Show all clients", connection()))
        .await;
    assert!(response.success);
    assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 2);
}
