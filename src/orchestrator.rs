//! Request orchestration
//!
//! `QueryEngine::convert_text_to_sql` runs one request end to end: schema,
//! intent, column resolution, template build with a single model fallback,
//! validation, reflection, the mutation guard, optional execution and the
//! explanation. Every request runs inside a `tracing` span carrying its id.

use crate::config::EngineConfig;
use crate::db::{ConnectionParams, DatabaseDriver, Row};
use crate::error::{QueryError, Result};
use crate::execution::{ExecutionResult, Executor};
use crate::explain::ExplanationGenerator;
use crate::intent::{ConversationTurn, IntentAnalyzer, IntentInfo};
use crate::llm::TextGenerator;
use crate::reflection::{AttemptSource, GenerationAttempt, ReflectionController};
use crate::resolver::{ColumnResolver, Resolution};
use crate::schema::{DriverSchemaFetcher, SchemaCache, SchemaFetcher, SchemaSnapshot};
use crate::sql::builder::SqlBuilder;
use crate::sql::generator::{GenerationContext, SqlGenerator};
use crate::sql::scanner::{SqlScanner, TokenScanner};
use crate::sql::validator::SqlValidator;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionRequest {
    pub query: String,
    pub connection: ConnectionParams,
    #[serde(default)]
    pub execute: bool,
    #[serde(default)]
    pub conversation_history: Vec<ConversationTurn>,
    #[serde(default)]
    pub additional_context: Option<String>,
}

impl ConversionRequest {
    pub fn new(query: impl Into<String>, connection: ConnectionParams) -> Self {
        Self {
            query: query.into(),
            connection,
            ..Self::default()
        }
    }

    pub fn executing(mut self) -> Self {
        self.execute = true;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionResponse {
    pub sql: Option<String>,
    pub explanation: Option<String>,
    pub success: bool,
    pub error: Option<String>,
    pub result: Option<Vec<Row>>,
    pub columns: Option<Vec<String>>,
    pub reflection_applied: bool,
    pub recovered_results: bool,
    pub simplified_query: bool,
    pub warnings: Vec<String>,
    pub unmapped_columns: Vec<String>,
    pub row_count: Option<usize>,
    pub iterations: u32,
    /// Candidate statements in the order they were produced.
    pub attempts: Vec<GenerationAttempt>,
    pub request_id: String,
}

/// Everything one request accumulates. Dropped once the response is built.
struct RequestState {
    request_id: Uuid,
    schema: Arc<SchemaSnapshot>,
    intent: IntentInfo,
    resolution: Resolution,
    warnings: Vec<String>,
    attempts: Vec<GenerationAttempt>,
}

impl RequestState {
    fn failure(&self, sql: Option<String>, error: &QueryError) -> ConversionResponse {
        warn!("Request failed: {}", error);
        ConversionResponse {
            sql,
            error: Some(error.to_string()),
            warnings: self.warnings.clone(),
            unmapped_columns: self.resolution.unmapped.clone(),
            attempts: self.attempts.clone(),
            request_id: self.request_id.to_string(),
            ..ConversionResponse::default()
        }
    }
}

pub struct QueryEngine {
    config: EngineConfig,
    schema_cache: Arc<SchemaCache>,
    analyzer: IntentAnalyzer,
    resolver: ColumnResolver,
    generator: Arc<SqlGenerator>,
    reflection: ReflectionController,
    executor: Executor,
    llm: Arc<dyn TextGenerator>,
}

impl QueryEngine {
    pub fn new(config: EngineConfig, driver: Arc<dyn DatabaseDriver>, llm: Arc<dyn TextGenerator>) -> Self {
        let fetcher: Arc<dyn SchemaFetcher> = Arc::new(DriverSchemaFetcher::new(
            Arc::clone(&driver),
            config.db_timeout(),
            config.db_connect_retries,
        ));
        let schema_cache = Arc::new(SchemaCache::new(fetcher, config.schema_ttl()));
        Self::with_schema_cache(config, driver, llm, schema_cache)
    }

    /// Engine sharing an existing cache, e.g. one built with a manual clock.
    pub fn with_schema_cache(
        config: EngineConfig,
        driver: Arc<dyn DatabaseDriver>,
        llm: Arc<dyn TextGenerator>,
        schema_cache: Arc<SchemaCache>,
    ) -> Self {
        let generator = Arc::new(SqlGenerator::new(Arc::clone(&llm)));
        let reflection = ReflectionController::new(
            Arc::clone(&llm),
            Arc::clone(&generator),
            config.max_iterations,
            config.min_reflection_rating,
        );
        let executor = Executor::new(
            driver,
            config.db_timeout(),
            config.db_connect_retries,
            config.diagnostic_sample_rows,
        );
        Self {
            analyzer: IntentAnalyzer::new(Arc::clone(&llm), config.history_turns),
            resolver: ColumnResolver::new(),
            generator,
            reflection,
            executor,
            schema_cache,
            llm,
            config,
        }
    }

    pub fn schema_cache(&self) -> &Arc<SchemaCache> {
        &self.schema_cache
    }

    pub async fn convert_text_to_sql(&self, request: ConversionRequest) -> ConversionResponse {
        let request_id = Uuid::new_v4();
        let span = info_span!("convert", request_id = %request_id);
        self.run(request, request_id).instrument(span).await
    }

    async fn run(&self, request: ConversionRequest, request_id: Uuid) -> ConversionResponse {
        let started = Instant::now();
        info!("Converting: {}", request.query);

        let schema = match self.schema_cache.get(&request.connection).await {
            Ok(schema) => schema,
            Err(e) => {
                warn!("Schema unavailable: {}", e);
                return ConversionResponse {
                    error: Some(e.to_string()),
                    request_id: request_id.to_string(),
                    ..ConversionResponse::default()
                };
            }
        };

        let intent = self
            .analyzer
            .analyze(
                &request.query,
                &schema,
                &request.conversation_history,
                request.additional_context.as_deref(),
            )
            .await;
        let resolution = self.resolver.resolve(&intent, &schema);

        let mut state = RequestState {
            request_id,
            schema,
            intent,
            resolution,
            warnings: Vec::new(),
            attempts: Vec::new(),
        };
        if state.resolution.low_confidence_tables {
            state
                .warnings
                .push("No table could be inferred from the question; columns were matched across the whole schema".to_string());
        }

        let dialect = request.connection.dialect();
        let scanner: Arc<dyn SqlScanner> = Arc::new(TokenScanner::new(dialect));
        let validator = SqlValidator::new(Arc::clone(&scanner));
        let ctx = GenerationContext {
            query: &request.query,
            intent: &state.intent,
            mapping: &state.resolution.mapping,
            schema: &state.schema,
            tables: &state.resolution.tables,
            dialect,
        };

        if let Err((sql, e)) = self
            .initial_attempt(&ctx, &validator, &mut state.attempts, &mut state.warnings)
            .await
        {
            return state.failure(sql, &e);
        }

        let attempts = std::mem::take(&mut state.attempts);
        let outcome = match self.reflection.reflect(attempts, &ctx, &validator).await {
            Ok(outcome) => outcome,
            Err(e) => return state.failure(None, &e),
        };
        state.warnings.extend(outcome.warnings.iter().cloned());
        state.attempts = outcome.attempts;
        let sql = outcome.sql;

        if let Some(operation) = validator.mutation_without_where(&sql) {
            if !self.config.allow_unfiltered_mutations {
                return state.failure(Some(sql), &QueryError::UnsafeMutation(operation.to_string()));
            }
            state.warnings.push(format!("{} affects every row of the table", operation));
        }
        if sql_has_cross_join(&sql) {
            state
                .warnings
                .push("The statement uses a CROSS JOIN because no relationship links the tables".to_string());
        }

        let execution: Option<ExecutionResult> = if request.execute {
            let limit = Some(self.config.row_limit);
            Some(
                self.executor
                    .execute(&sql, &request.connection, limit, &state.schema)
                    .await,
            )
        } else {
            None
        };

        let explainer = ExplanationGenerator::new(Arc::clone(&self.llm), Arc::clone(&scanner));
        let explanation = explainer
            .explain(
                &sql,
                &request.query,
                &state.resolution.mapping,
                &state.resolution.unmapped,
                &state.schema,
            )
            .await;

        let mut response = ConversionResponse {
            sql: Some(sql),
            explanation: Some(explanation),
            success: true,
            reflection_applied: outcome.reflection_applied,
            unmapped_columns: state.resolution.unmapped.clone(),
            iterations: outcome.iterations,
            request_id: request_id.to_string(),
            ..ConversionResponse::default()
        };
        if let Some(execution) = execution {
            state.warnings.extend(execution.diagnostics.iter().cloned());
            response.success = execution.error.is_none();
            response.error = execution.error;
            response.row_count = Some(execution.row_count);
            response.result = execution.rows;
            response.columns = execution.columns;
            response.recovered_results = execution.recovered_results;
            response.simplified_query = execution.simplified_query;
        }
        response.warnings = state.warnings;
        response.attempts = state.attempts;

        info!(
            "Request finished in {}ms (success: {}, iterations: {})",
            started.elapsed().as_millis(),
            response.success,
            response.iterations
        );
        response
    }

    /// Template statement, or the model's when the template fails, cross
    /// joins, or does not validate. The model gets one attempt. Every
    /// candidate lands in `attempts`; on success the last one is accepted.
    async fn initial_attempt(
        &self,
        ctx: &GenerationContext<'_>,
        validator: &SqlValidator,
        attempts: &mut Vec<GenerationAttempt>,
        warnings: &mut Vec<String>,
    ) -> std::result::Result<(), (Option<String>, QueryError)> {
        let builder = SqlBuilder::new(ctx.dialect).allow_unfiltered_mutations(self.config.allow_unfiltered_mutations);
        let template = builder.build(ctx.intent, ctx.mapping, ctx.schema, ctx.tables);

        let (fallback_reason, template_ok) = match template {
            Ok(built) => {
                if !built.dropped_filters.is_empty() {
                    warnings.push(format!(
                        "Filters ignored because their columns were not found: {}",
                        built.dropped_filters.join(", ")
                    ));
                }
                let report = validator.validate(&built.sql, ctx.schema);
                let reason = if !report.ok {
                    format!("Validation failed: {}", report.summary())
                } else if built.cross_join {
                    "The tables could only be combined with a CROSS JOIN; find a join condition".to_string()
                } else {
                    attempts.push(GenerationAttempt::new(built.sql, AttemptSource::Template, 0));
                    return Ok(());
                };
                attempts.push(GenerationAttempt::rejected(
                    built.sql,
                    AttemptSource::Template,
                    0,
                    report.issues,
                ));
                (reason, report.ok)
            }
            Err(e @ QueryError::UnsafeMutation(_)) => return Err((None, e)),
            Err(e) => (e.to_string(), false),
        };

        info!("Template SQL not usable ({}); falling back to the model", fallback_reason);
        match self.generator.generate(ctx, Some(fallback_reason.as_str())).await {
            Ok(sql) => {
                let report = validator.validate(&sql, ctx.schema);
                if report.ok {
                    attempts.push(GenerationAttempt::new(sql, AttemptSource::ModelFallback, 0));
                    Ok(())
                } else {
                    let summary = report.summary();
                    attempts.push(GenerationAttempt::rejected(
                        sql.clone(),
                        AttemptSource::ModelFallback,
                        0,
                        report.issues,
                    ));
                    Err((Some(sql), QueryError::Validation(summary)))
                }
            }
            // A cross join that validates still answers the question
            Err(e) if template_ok => {
                warn!("Model fallback failed ({}); keeping template SQL", e);
                Ok(())
            }
            Err(e) => match attempts.last() {
                Some(template) => Err((
                    Some(template.sql.clone()),
                    QueryError::Validation(template.validation_issues.join("; ")),
                )),
                None => Err((
                    None,
                    QueryError::GenerationExhausted(format!("{}; model fallback failed: {}", fallback_reason, e)),
                )),
            },
        }
    }

    /// Load (or reuse) the schema for `connection`.
    pub async fn schema(&self, connection: &ConnectionParams) -> Result<Arc<SchemaSnapshot>> {
        self.schema_cache.get(connection).await
    }
}

fn sql_has_cross_join(sql: &str) -> bool {
    sql.split_whitespace()
        .collect::<Vec<_>>()
        .windows(2)
        .any(|w| w[0].eq_ignore_ascii_case("CROSS") && w[1].eq_ignore_ascii_case("JOIN"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_serializes_camel_case() {
        let response = ConversionResponse {
            reflection_applied: true,
            unmapped_columns: vec!["active".to_string()],
            ..Default::default()
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["reflectionApplied"], true);
        assert_eq!(json["unmappedColumns"][0], "active");
        assert!(json.get("recoveredResults").is_some());
        assert!(json.get("requestId").is_some());
    }

    #[test]
    fn test_request_deserializes_with_defaults() {
        let request: ConversionRequest = serde_json::from_str(
            r#"{"query": "show clients", "connection": {"server": "db", "database": "crm"}}"#,
        )
        .unwrap();
        assert!(!request.execute);
        assert!(request.conversation_history.is_empty());
    }

    #[test]
    fn test_cross_join_detection() {
        assert!(sql_has_cross_join("SELECT * FROM a cross  join b"));
        assert!(!sql_has_cross_join("SELECT * FROM a INNER JOIN b ON a.id = b.id"));
    }
}
