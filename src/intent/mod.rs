//! Intent analysis: a deterministic keyword pass merged with a model pass.

pub mod keywords;
pub mod types;

pub use keywords::keyword_intent;
pub use types::{
    AggregateFunction, ConversationTurn, FilterCondition, FilterOp, FilterValue, IntentInfo, Operation,
    OrderSpec, SortDirection,
};

use crate::error::Result;
use crate::llm::{parse_json_response, TextGenerator};
use crate::schema::SchemaSnapshot;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

const SYSTEM_PROMPT: &str = "You translate questions about a relational database into a structured intent. \
Respond with a single JSON object and nothing else.";

/// Model output before validation. Every field is optional and loosely typed.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ModelIntent {
    operation: Option<String>,
    tables: Option<Vec<String>>,
    columns: Option<Vec<String>>,
    filters: Option<Vec<Value>>,
    #[serde(alias = "requiresAggregation")]
    requires_aggregation: Option<bool>,
    #[serde(alias = "aggregationType")]
    aggregation_type: Option<String>,
    #[serde(alias = "groupBy")]
    group_by: Option<Vec<String>>,
    #[serde(alias = "orderBy")]
    order_by: Option<Vec<Value>>,
    limit: Option<Value>,
}

impl ModelIntent {
    fn filters(&self) -> Vec<String> {
        self.filters
            .iter()
            .flatten()
            .filter_map(|f| match f {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Object(map) => {
                    let column = map.get("column")?.as_str()?;
                    let op = map
                        .get("operator")
                        .or_else(|| map.get("op"))
                        .and_then(Value::as_str)
                        .unwrap_or("=");
                    match map.get("value") {
                        None | Some(Value::Null) => Some(format!("{} {}", column, op)),
                        Some(Value::String(s)) => Some(format!("{} {} '{}'", column, op, s.replace('\'', "''"))),
                        Some(other) => Some(format!("{} {} {}", column, op, other)),
                    }
                }
                _ => None,
            })
            .filter(|f| !f.is_empty())
            .collect()
    }

    fn order_by(&self) -> Vec<OrderSpec> {
        self.order_by
            .iter()
            .flatten()
            .filter_map(|o| match o {
                Value::String(s) => {
                    let mut parts = s.split_whitespace();
                    let column = parts.next()?;
                    let direction = parts.next().map(SortDirection::parse).unwrap_or_default();
                    Some(OrderSpec::new(column, direction))
                }
                Value::Object(map) => {
                    let column = map.get("column")?.as_str()?;
                    let direction = map
                        .get("direction")
                        .and_then(Value::as_str)
                        .map(SortDirection::parse)
                        .unwrap_or_default();
                    Some(OrderSpec::new(column, direction))
                }
                _ => None,
            })
            .collect()
    }

    fn limit(&self) -> Option<u64> {
        match self.limit.as_ref()? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

fn non_empty(list: Option<&Vec<String>>) -> Option<Vec<String>> {
    let cleaned: Vec<String> = list?
        .iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    (!cleaned.is_empty()).then_some(cleaned)
}

/// Field-by-field merge: model values win when present and non-empty.
fn merge(keyword: IntentInfo, model: &ModelIntent) -> IntentInfo {
    let filters = model.filters();
    let order_by = model.order_by();
    let aggregation_type = model
        .aggregation_type
        .as_deref()
        .and_then(AggregateFunction::parse)
        .or(keyword.aggregation_type);

    let mut merged = IntentInfo {
        operation: model
            .operation
            .as_deref()
            .and_then(Operation::parse)
            .unwrap_or(keyword.operation),
        tables: non_empty(model.tables.as_ref()).unwrap_or(keyword.tables),
        columns: non_empty(model.columns.as_ref()).unwrap_or(keyword.columns),
        filters: if filters.is_empty() { keyword.filters } else { filters },
        requires_aggregation: model.requires_aggregation.unwrap_or(false) || aggregation_type.is_some(),
        aggregation_type,
        group_by: non_empty(model.group_by.as_ref()).unwrap_or(keyword.group_by),
        order_by: if order_by.is_empty() { keyword.order_by } else { order_by },
        limit: model.limit().or(keyword.limit),
        entity_hints: keyword.entity_hints,
    };
    merged.normalize();
    merged
}

pub struct IntentAnalyzer {
    llm: Arc<dyn TextGenerator>,
    history_turns: usize,
}

impl IntentAnalyzer {
    pub fn new(llm: Arc<dyn TextGenerator>, history_turns: usize) -> Self {
        Self { llm, history_turns }
    }

    /// Never fails: a model error or unreadable answer leaves the keyword
    /// pass as the result.
    pub async fn analyze(
        &self,
        query: &str,
        schema: &SchemaSnapshot,
        history: &[ConversationTurn],
        additional_context: Option<&str>,
    ) -> IntentInfo {
        let keyword = keyword_intent(query, schema);
        debug!("Keyword intent: {:?}", keyword);

        let intent = match self.model_intent(query, schema, history, additional_context).await {
            Ok(model) => {
                let merged = merge(keyword, &model);
                debug!("Merged intent: {:?}", merged);
                merged
            }
            Err(e) => {
                warn!("Model intent extraction failed, using keyword analysis only: {}", e);
                keyword
            }
        };
        info!(
            "Intent: {:?} on {:?} (filters: {}, grouping: {}, ordering: {}, limit: {})",
            intent.operation,
            intent.tables,
            intent.has_filters(),
            intent.has_grouping(),
            intent.has_ordering(),
            intent.has_limit()
        );
        intent
    }

    async fn model_intent(
        &self,
        query: &str,
        schema: &SchemaSnapshot,
        history: &[ConversationTurn],
        additional_context: Option<&str>,
    ) -> Result<ModelIntent> {
        let prompt = self.build_prompt(query, schema, history, additional_context);
        let response = self.llm.generate(&prompt, Some(SYSTEM_PROMPT)).await?;
        parse_json_response(&response)
    }

    fn build_prompt(
        &self,
        query: &str,
        schema: &SchemaSnapshot,
        history: &[ConversationTurn],
        additional_context: Option<&str>,
    ) -> String {
        let recent = &history[history.len().saturating_sub(self.history_turns)..];
        let conversation = if recent.is_empty() {
            "(none)".to_string()
        } else {
            recent
                .iter()
                .map(|t| format!("{}: {}", t.role, t.content))
                .collect::<Vec<_>>()
                .join("\n")
        };

        format!(
            r#"DATABASE SCHEMA:
{schema}

RECENT CONVERSATION:
{conversation}

ADDITIONAL CONTEXT:
{context}

QUESTION: {query}

Return JSON with exactly these fields:
{{
  "operation": "select" | "insert" | "update" | "delete",
  "tables": ["table names from the schema"],
  "columns": ["column names from the schema"],
  "filters": ["conditions such as city = 'Paris' or total > 100"],
  "requires_aggregation": true | false,
  "aggregation_type": "COUNT" | "SUM" | "AVG" | "MIN" | "MAX" | null,
  "group_by": ["column names"],
  "order_by": [{{"column": "name", "direction": "ASC" | "DESC"}}],
  "limit": number | null
}}
Use only names that appear in the schema. Leave a list empty when the question does not mention it."#,
            schema = schema.summary(None),
            conversation = conversation,
            context = additional_context.filter(|c| !c.trim().is_empty()).unwrap_or("(none)"),
            query = query,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueryError;
    use crate::schema::{ColumnDef, TableDef};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct CannedGenerator {
        response: std::result::Result<String, String>,
        prompts: Mutex<Vec<String>>,
    }

    impl CannedGenerator {
        fn ok(response: &str) -> Self {
            Self {
                response: Ok(response.to_string()),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TextGenerator for CannedGenerator {
        async fn generate(&self, prompt: &str, _system_prompt: Option<&str>) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.response.clone().map_err(QueryError::Llm)
        }
    }

    fn schema() -> SchemaSnapshot {
        SchemaSnapshot::new(
            vec![TableDef::new(
                "Clients",
                vec![
                    ColumnDef::new("client_id", "int").primary_key(),
                    ColumnDef::new("city", "varchar"),
                ],
            )],
            vec![],
        )
    }

    #[tokio::test]
    async fn test_model_fields_win() {
        let llm = Arc::new(CannedGenerator::ok(
            r#"```json
{"operation": "select", "tables": ["Clients"], "columns": ["city"], "filters": [{"column": "city", "operator": "=", "value": "Paris"}],
 "requiresAggregation": true, "aggregationType": null, "groupBy": [], "orderBy": ["city desc"], "limit": "5"}
```"#,
        ));
        let analyzer = IntentAnalyzer::new(llm, 5);
        let intent = analyzer.analyze("show clients", &schema(), &[], None).await;

        assert_eq!(intent.tables, vec!["Clients"]);
        assert_eq!(intent.columns, vec!["city"]);
        assert_eq!(intent.filters, vec!["city = 'Paris'"]);
        assert_eq!(intent.aggregation_type, Some(AggregateFunction::Count));
        assert!(intent.requires_aggregation);
        assert_eq!(intent.order_by, vec![OrderSpec::new("city", SortDirection::Desc)]);
        assert_eq!(intent.limit, Some(5));
        assert!(intent.has_filters() && intent.has_ordering() && intent.has_limit());
        assert!(!intent.has_grouping());
    }

    #[tokio::test]
    async fn test_keyword_fills_gaps() {
        let llm = Arc::new(CannedGenerator::ok(r#"{"operation": "select", "tables": [], "columns": []}"#));
        let analyzer = IntentAnalyzer::new(llm, 5);
        let intent = analyzer.analyze("show the first 3 clients", &schema(), &[], None).await;
        assert!(intent.tables.is_empty());
        assert_eq!(intent.limit, Some(3));
        assert_eq!(intent.entity_hints, vec!["clients"]);
        assert!(intent.has_limit());
        assert!(!intent.has_grouping());
    }

    #[tokio::test]
    async fn test_garbled_model_output_falls_back() {
        let llm = Arc::new(CannedGenerator::ok("I am not sure what you mean."));
        let analyzer = IntentAnalyzer::new(llm, 5);
        let intent = analyzer.analyze("delete clients where city is Lyon", &schema(), &[], None).await;
        assert_eq!(intent.operation, Operation::Delete);
        assert!(intent.tables.is_empty());
        assert_eq!(intent.filters, vec!["city = 'Lyon'"]);
    }

    #[tokio::test]
    async fn test_prompt_keeps_recent_history_only() {
        let llm = Arc::new(CannedGenerator {
            response: Err("offline".to_string()),
            prompts: Mutex::new(Vec::new()),
        });
        let analyzer = IntentAnalyzer::new(llm.clone(), 2);
        let history: Vec<ConversationTurn> = (0..4)
            .map(|i| ConversationTurn::new("user", format!("turn {}", i)))
            .collect();
        analyzer.analyze("show clients", &schema(), &history, Some("EU only")).await;

        let prompts = llm.prompts.lock().unwrap();
        assert!(!prompts[0].contains("turn 1"));
        assert!(prompts[0].contains("turn 2"));
        assert!(prompts[0].contains("turn 3"));
        assert!(prompts[0].contains("EU only"));
    }
}
