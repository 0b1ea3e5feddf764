//! Reflection loop
//!
//! Bounded critique/regenerate cycle over a generated statement. Each round
//! asks the model to rate the SQL. A valid improved statement is adopted
//! immediately; a low rating or an explicit request triggers regeneration
//! until the iteration cap, where the current SQL is executed anyway. A failed
//! critique never blocks execution.

use crate::error::{QueryError, Result};
use crate::llm::{parse_json_response, TextGenerator};
use crate::sql::generator::{GenerationContext, SqlGenerator};
use crate::sql::validator::SqlValidator;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

const SYSTEM_PROMPT: &str = "You review SQL written for a user's question. \
Respond with a single JSON object and nothing else.";

pub const MAX_ITERATIONS_WARNING: &str = "max iterations reached";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptSource {
    Template,
    ModelFallback,
    ReflectionImprovement,
    Regeneration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationAttempt {
    pub sql: String,
    pub validation_issues: Vec<String>,
    pub reflection_issues: Vec<String>,
    pub iteration: u32,
    pub source: AttemptSource,
}

impl GenerationAttempt {
    pub fn new(sql: impl Into<String>, source: AttemptSource, iteration: u32) -> Self {
        Self {
            sql: sql.into(),
            validation_issues: Vec::new(),
            reflection_issues: Vec::new(),
            iteration,
            source,
        }
    }

    /// Candidate the validator turned down.
    pub fn rejected(sql: impl Into<String>, source: AttemptSource, iteration: u32, issues: Vec<String>) -> Self {
        Self {
            validation_issues: issues,
            ..Self::new(sql, source, iteration)
        }
    }

    pub fn is_rejected(&self) -> bool {
        !self.validation_issues.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReflectionVerdict {
    /// 0..=10
    pub rating: u8,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
    pub needs_regeneration: bool,
    pub improved_sql: Option<String>,
}

/// Critique as the model writes it; numbers may arrive as strings or floats.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawVerdict {
    rating: Value,
    issues: Vec<Value>,
    suggestions: Vec<Value>,
    #[serde(alias = "needsRegeneration")]
    needs_regeneration: Value,
    #[serde(alias = "improvedSql", alias = "improved_query")]
    improved_sql: Option<String>,
}

impl From<RawVerdict> for ReflectionVerdict {
    fn from(raw: RawVerdict) -> Self {
        let rating = match &raw.rating {
            Value::Number(n) => n.as_f64().unwrap_or(0.0),
            Value::String(s) => s.trim().parse().unwrap_or(0.0),
            _ => 0.0,
        };
        let texts = |values: Vec<Value>| -> Vec<String> {
            values
                .into_iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s),
                    Value::Null => None,
                    other => Some(other.to_string()),
                })
                .filter(|s| !s.trim().is_empty())
                .collect()
        };
        let needs_regeneration = match &raw.needs_regeneration {
            Value::Bool(b) => *b,
            Value::String(s) => s.eq_ignore_ascii_case("true") || s.eq_ignore_ascii_case("yes"),
            _ => false,
        };

        Self {
            rating: rating.round().clamp(0.0, 10.0) as u8,
            issues: texts(raw.issues),
            suggestions: texts(raw.suggestions),
            needs_regeneration,
            improved_sql: raw.improved_sql.filter(|s| !s.trim().is_empty()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectionOutcome {
    pub sql: String,
    /// Every candidate in generation order, rejected ones included.
    pub attempts: Vec<GenerationAttempt>,
    /// Index of `sql` in `attempts`.
    pub accepted: usize,
    pub reflection_applied: bool,
    /// Critique rounds performed.
    pub iterations: u32,
    pub max_iterations_reached: bool,
    pub warnings: Vec<String>,
}

pub struct ReflectionController {
    llm: Arc<dyn TextGenerator>,
    generator: Arc<SqlGenerator>,
    max_iterations: u32,
    min_rating: u8,
}

impl ReflectionController {
    pub fn new(llm: Arc<dyn TextGenerator>, generator: Arc<SqlGenerator>, max_iterations: u32, min_rating: u8) -> Self {
        Self {
            llm,
            generator,
            max_iterations: max_iterations.max(1),
            min_rating,
        }
    }

    /// Reflect on the last entry of `attempts`. Earlier entries are kept as
    /// history and returned in order.
    pub async fn reflect(
        &self,
        mut attempts: Vec<GenerationAttempt>,
        ctx: &GenerationContext<'_>,
        validator: &SqlValidator,
    ) -> Result<ReflectionOutcome> {
        let Some(mut current) = attempts.len().checked_sub(1) else {
            return Err(QueryError::GenerationExhausted(
                "no SQL was produced for the request".to_string(),
            ));
        };
        if attempts[current].sql.trim().is_empty() {
            return Err(QueryError::GenerationExhausted(
                "no SQL was produced for the request".to_string(),
            ));
        }

        let mut outcome_warnings = Vec::new();
        let mut reflection_applied = false;
        let mut max_reached = false;
        let mut iterations = 0;

        for iteration in 1..=self.max_iterations {
            info!("Reflection pass {} of {}", iteration, self.max_iterations);
            iterations = iteration;

            let verdict = match self.critique(&attempts[current].sql, ctx).await {
                Ok(verdict) => verdict,
                Err(e) => {
                    warn!("Critique failed, executing current SQL: {}", e);
                    break;
                }
            };
            debug!("Critique: {:?}", verdict);
            attempts[current].reflection_issues = verdict.issues.clone();

            if let Some(improved) = verdict.improved_sql.as_deref() {
                if normalize(improved) != normalize(&attempts[current].sql) {
                    let report = validator.validate(improved, ctx.schema);
                    if report.ok {
                        info!("Adopting improved SQL from critique");
                        attempts.push(GenerationAttempt::new(
                            improved.trim(),
                            AttemptSource::ReflectionImprovement,
                            iteration,
                        ));
                        current = attempts.len() - 1;
                        reflection_applied = true;
                        break;
                    }
                    debug!("Improved SQL rejected: {}", report.summary());
                    attempts.push(GenerationAttempt::rejected(
                        improved.trim(),
                        AttemptSource::ReflectionImprovement,
                        iteration,
                        report.issues,
                    ));
                }
            }

            if !verdict.needs_regeneration && verdict.rating >= self.min_rating {
                break;
            }

            if iteration >= self.max_iterations {
                warn!(
                    "Reflection {}: executing SQL rated {}/10",
                    MAX_ITERATIONS_WARNING, verdict.rating
                );
                outcome_warnings.push(format!(
                    "Reflection {} ({}); the SQL may not fully answer the question",
                    MAX_ITERATIONS_WARNING, self.max_iterations
                ));
                max_reached = true;
                break;
            }

            match self
                .generator
                .regenerate(ctx, &attempts[current].sql, &verdict.issues, &verdict.suggestions)
                .await
            {
                Ok(sql) => {
                    let report = validator.validate(&sql, ctx.schema);
                    if report.ok {
                        attempts.push(GenerationAttempt::new(sql, AttemptSource::Regeneration, iteration));
                        current = attempts.len() - 1;
                        reflection_applied = true;
                    } else {
                        warn!("Regenerated SQL is invalid, keeping current: {}", report.summary());
                        attempts.push(GenerationAttempt::rejected(
                            sql,
                            AttemptSource::Regeneration,
                            iteration,
                            report.issues,
                        ));
                    }
                }
                Err(e) => warn!("Regeneration failed, keeping current SQL: {}", e),
            }
        }

        Ok(ReflectionOutcome {
            sql: attempts[current].sql.clone(),
            attempts,
            accepted: current,
            reflection_applied,
            iterations,
            max_iterations_reached: max_reached,
            warnings: outcome_warnings,
        })
    }

    async fn critique(&self, sql: &str, ctx: &GenerationContext<'_>) -> Result<ReflectionVerdict> {
        let prompt = format!(
            r#"QUESTION: {query}

SCHEMA:
{schema}

INTENT:
{intent}

SQL:
{sql}

Judge whether the SQL answers the question using only the schema above.
Return JSON:
{{
  "rating": 0-10,
  "issues": ["problems found"],
  "suggestions": ["concrete changes"],
  "needs_regeneration": true | false,
  "improved_sql": "a corrected statement, or null"
}}"#,
            query = ctx.query,
            schema = ctx.schema.summary(None),
            intent = serde_json::to_string(ctx.intent).unwrap_or_default(),
            sql = sql,
        );
        let response = self.llm.generate(&prompt, Some(SYSTEM_PROMPT)).await?;
        let raw: RawVerdict = parse_json_response(&response)?;
        Ok(raw.into())
    }
}

fn normalize(sql: &str) -> String {
    sql.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(';')
        .trim()
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqlDialect;
    use crate::intent::IntentInfo;
    use crate::resolver::ColumnMapping;
    use crate::schema::{ColumnDef, SchemaSnapshot, TableDef};
    use crate::sql::scanner::TokenScanner;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Answers critique prompts and generation prompts from separate queues.
    struct Scripted {
        critiques: Mutex<VecDeque<Result<String>>>,
        rewrites: Mutex<VecDeque<String>>,
        critique_calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(critiques: Vec<Result<String>>, rewrites: Vec<&str>) -> Arc<Self> {
            Arc::new(Self {
                critiques: Mutex::new(critiques.into()),
                rewrites: Mutex::new(rewrites.into_iter().map(str::to_string).collect()),
                critique_calls: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl TextGenerator for Scripted {
        async fn generate(&self, prompt: &str, _system_prompt: Option<&str>) -> Result<String> {
            if prompt.contains("Judge whether") {
                *self.critique_calls.lock().unwrap() += 1;
                let next = self.critiques.lock().unwrap().pop_front();
                next.unwrap_or_else(|| Ok(low_rating()))
            } else {
                let next = self.rewrites.lock().unwrap().pop_front();
                Ok(next.unwrap_or_else(|| "SELECT first_name FROM Clients".to_string()))
            }
        }
    }

    fn low_rating() -> String {
        r#"{"rating": 3, "issues": ["wrong columns"], "suggestions": [], "needs_regeneration": true, "improved_sql": null}"#
            .to_string()
    }

    fn schema() -> SchemaSnapshot {
        SchemaSnapshot::new(
            vec![TableDef::new(
                "Clients",
                vec![ColumnDef::new("client_id", "int"), ColumnDef::new("first_name", "varchar")],
            )],
            vec![],
        )
    }

    async fn run(llm: Arc<Scripted>, max_iterations: u32) -> ReflectionOutcome {
        let schema = schema();
        let intent = IntentInfo::default();
        let mapping = ColumnMapping::default();
        let tables = vec!["Clients".to_string()];
        let ctx = GenerationContext {
            query: "show client names",
            intent: &intent,
            mapping: &mapping,
            schema: &schema,
            tables: &tables,
            dialect: SqlDialect::Generic,
        };
        let validator = SqlValidator::new(Arc::new(TokenScanner::default()));
        let generator = Arc::new(SqlGenerator::new(llm.clone()));
        let controller = ReflectionController::new(llm, generator, max_iterations, 7);
        controller
            .reflect(
                vec![GenerationAttempt::new("SELECT * FROM Clients", AttemptSource::Template, 0)],
                &ctx,
                &validator,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_good_rating_executes_as_is() {
        let llm = Scripted::new(
            vec![Ok(r#"{"rating": 9, "issues": [], "needs_regeneration": false}"#.to_string())],
            vec![],
        );
        let outcome = run(llm.clone(), 3).await;
        assert_eq!(outcome.sql, "SELECT * FROM Clients");
        assert!(!outcome.reflection_applied);
        assert_eq!(outcome.iterations, 1);
        assert!(outcome.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_valid_improvement_is_adopted() {
        let llm = Scripted::new(
            vec![Ok(
                r#"{"rating": "6", "issues": ["select names only"], "improved_sql": "SELECT first_name FROM Clients"}"#
                    .to_string(),
            )],
            vec![],
        );
        let outcome = run(llm, 3).await;
        assert_eq!(outcome.sql, "SELECT first_name FROM Clients");
        assert!(outcome.reflection_applied);
        assert_eq!(outcome.attempts.len(), 2);
        assert_eq!(outcome.attempts[1].source, AttemptSource::ReflectionImprovement);
        assert_eq!(outcome.attempts[0].reflection_issues, vec!["select names only"]);
    }

    #[tokio::test]
    async fn test_invalid_improvement_is_ignored() {
        let llm = Scripted::new(
            vec![Ok(
                r#"{"rating": 8, "needs_regeneration": false, "improved_sql": "SELECT nickname FROM Customers"}"#
                    .to_string(),
            )],
            vec![],
        );
        let outcome = run(llm, 3).await;
        assert_eq!(outcome.sql, "SELECT * FROM Clients");
        assert!(!outcome.reflection_applied);
        assert_eq!(outcome.accepted, 0);
        assert_eq!(outcome.attempts.len(), 2);
        assert_eq!(outcome.attempts[1].source, AttemptSource::ReflectionImprovement);
        assert!(outcome.attempts[1].validation_issues.iter().any(|i| i.contains("Customers")));
    }

    #[tokio::test]
    async fn test_cap_forces_execution_with_warning() {
        let llm = Scripted::new(vec![], vec!["SELECT client_id FROM Clients", "SELECT first_name FROM Clients"]);
        let outcome = run(llm.clone(), 3).await;

        assert_eq!(*llm.critique_calls.lock().unwrap(), 3);
        assert_eq!(outcome.iterations, 3);
        assert!(outcome.max_iterations_reached);
        assert_eq!(outcome.sql, "SELECT first_name FROM Clients");
        assert!(outcome.warnings[0].contains(MAX_ITERATIONS_WARNING));
        assert_eq!(outcome.attempts.len(), 3);
        assert_eq!(outcome.accepted, 2);
        assert!(outcome.attempts.iter().all(|a| !a.is_rejected()));
    }

    #[tokio::test]
    async fn test_critique_failure_fails_open() {
        let llm = Scripted::new(vec![Err(QueryError::Llm("timeout".to_string()))], vec![]);
        let outcome = run(llm, 3).await;
        assert_eq!(outcome.sql, "SELECT * FROM Clients");
        assert!(!outcome.reflection_applied);
        assert!(!outcome.max_iterations_reached);
        assert_eq!(outcome.attempts.len(), 1);
        assert!(outcome.attempts[0].reflection_issues.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_regeneration_keeps_current_sql() {
        let llm = Scripted::new(
            vec![Ok(low_rating()), Ok(r#"{"rating": 9}"#.to_string())],
            vec!["SELECT FROM"],
        );
        let outcome = run(llm, 3).await;
        assert_eq!(outcome.sql, "SELECT * FROM Clients");
        assert_eq!(outcome.iterations, 2);
        assert!(!outcome.reflection_applied);

        assert_eq!(outcome.attempts.len(), 2);
        assert_eq!(outcome.accepted, 0);
        let rejected = &outcome.attempts[1];
        assert_eq!(rejected.sql, "SELECT FROM");
        assert_eq!(rejected.source, AttemptSource::Regeneration);
        assert_eq!(rejected.iteration, 1);
        assert!(!rejected.validation_issues.is_empty());
    }

    #[tokio::test]
    async fn test_earlier_attempts_are_kept_in_order() {
        let llm = Scripted::new(vec![Ok(r#"{"rating": 9}"#.to_string())], vec![]);
        let schema = schema();
        let intent = IntentInfo::default();
        let mapping = ColumnMapping::default();
        let ctx = GenerationContext {
            query: "show client names",
            intent: &intent,
            mapping: &mapping,
            schema: &schema,
            tables: &[],
            dialect: SqlDialect::Generic,
        };
        let validator = SqlValidator::new(Arc::new(TokenScanner::default()));
        let controller = ReflectionController::new(llm.clone(), Arc::new(SqlGenerator::new(llm)), 3, 7);
        let history = vec![
            GenerationAttempt::rejected(
                "SELECT nickname FROM Customers",
                AttemptSource::Template,
                0,
                vec!["Unknown table: Customers".to_string()],
            ),
            GenerationAttempt::new("SELECT first_name FROM Clients", AttemptSource::ModelFallback, 0),
        ];
        let outcome = controller.reflect(history, &ctx, &validator).await.unwrap();
        assert_eq!(outcome.sql, "SELECT first_name FROM Clients");
        assert_eq!(outcome.accepted, 1);
        assert!(outcome.attempts[0].is_rejected());
    }

    #[tokio::test]
    async fn test_empty_sql_is_an_error() {
        let llm = Scripted::new(vec![], vec![]);
        let schema = schema();
        let intent = IntentInfo::default();
        let mapping = ColumnMapping::default();
        let ctx = GenerationContext {
            query: "",
            intent: &intent,
            mapping: &mapping,
            schema: &schema,
            tables: &[],
            dialect: SqlDialect::Generic,
        };
        let validator = SqlValidator::new(Arc::new(TokenScanner::default()));
        let controller = ReflectionController::new(llm.clone(), Arc::new(SqlGenerator::new(llm)), 3, 7);
        let result = controller
            .reflect(vec![GenerationAttempt::new("  ", AttemptSource::Template, 0)], &ctx, &validator)
            .await;
        assert!(matches!(result, Err(QueryError::GenerationExhausted(_))));

        let result = controller.reflect(Vec::new(), &ctx, &validator).await;
        assert!(matches!(result, Err(QueryError::GenerationExhausted(_))));
    }
}
