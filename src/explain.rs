//! Plain-language explanations of generated SQL

use crate::llm::TextGenerator;
use crate::resolver::{ColumnMapping, ColumnResolver};
use crate::schema::SchemaSnapshot;
use crate::sql::scanner::{ScannedStatement, SqlScanner, StatementKind};
use itertools::Itertools;
use std::sync::Arc;
use tracing::{debug, warn};

const SYSTEM_PROMPT: &str = "You explain SQL to people who do not read SQL. \
Answer in two or three plain sentences without code.";

pub struct ExplanationGenerator {
    llm: Arc<dyn TextGenerator>,
    scanner: Arc<dyn SqlScanner>,
    resolver: ColumnResolver,
}

impl ExplanationGenerator {
    pub fn new(llm: Arc<dyn TextGenerator>, scanner: Arc<dyn SqlScanner>) -> Self {
        Self {
            llm,
            scanner,
            resolver: ColumnResolver::new(),
        }
    }

    pub async fn explain(
        &self,
        sql: &str,
        user_query: &str,
        mapping: &ColumnMapping,
        unmapped: &[String],
        schema: &SchemaSnapshot,
    ) -> String {
        let statement = self.scanner.scan(sql).ok();
        let body = match statement.as_ref().and_then(template_explanation) {
            Some(text) => text,
            None => self.model_explanation(sql, user_query, statement.as_ref()).await,
        };

        let notes = self.footnotes(mapping, unmapped, schema);
        if notes.is_empty() {
            body
        } else {
            format!("{}\n\n{}", body, notes.join("\n"))
        }
    }

    async fn model_explanation(&self, sql: &str, user_query: &str, statement: Option<&ScannedStatement>) -> String {
        let prompt = format!(
            "QUESTION: {}\n\nSQL:\n{}\n\nExplain what this SQL returns and how it answers the question.",
            user_query, sql
        );
        match self.llm.generate(&prompt, Some(SYSTEM_PROMPT)).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => generic_explanation(statement),
            Err(e) => {
                warn!("Explanation generation failed: {}", e);
                generic_explanation(statement)
            }
        }
    }

    fn footnotes(&self, mapping: &ColumnMapping, unmapped: &[String], schema: &SchemaSnapshot) -> Vec<String> {
        let mut notes: Vec<String> = mapping
            .fuzzy_matches()
            .map(|c| {
                format!(
                    "Note: '{}' was interpreted as {} ({:.0}% confidence).",
                    c.requested_name,
                    c.qualified(),
                    c.confidence * 100.0
                )
            })
            .collect();

        for name in unmapped {
            let suggestions = self.resolver.suggest(name, schema, 3);
            if suggestions.is_empty() {
                notes.push(format!("Note: '{}' does not match any column and was ignored.", name));
            } else {
                notes.push(format!(
                    "Note: '{}' does not match any column and was ignored. Did you mean {}?",
                    name,
                    suggestions.join(", ")
                ));
            }
        }
        notes
    }
}

/// Sentence for a single-table statement without grouping or joins.
fn template_explanation(statement: &ScannedStatement) -> Option<String> {
    let table = statement.single_table()?;
    if statement.has_group_by {
        return None;
    }
    let filter = statement
        .where_clause
        .as_ref()
        .map(|w| format!(" where {}", w))
        .unwrap_or_default();

    let text = match statement.kind {
        StatementKind::Select => {
            if statement.projection.iter().any(|p| p.contains('(')) {
                return None;
            }
            let columns = match statement.projection.as_slice() {
                [] => return None,
                [only] if only == "*" => "all columns".to_string(),
                items => format!("the columns {}", items.iter().join(", ")),
            };
            let mut text = format!("This query retrieves {} from the {} table{}", columns, table.name, filter);
            if !statement.order_by.is_empty() {
                let order = statement
                    .order_by
                    .iter()
                    .map(|o| {
                        format!(
                            "{} in {} order",
                            o.expr,
                            if o.descending { "descending" } else { "ascending" }
                        )
                    })
                    .join(", then ");
                text.push_str(&format!(", sorted by {}", order));
            }
            if let Some(limit) = statement.limit.or(statement.top) {
                text.push_str(&format!(", returning at most {} rows", limit));
            }
            text
        }
        StatementKind::Insert => format!("This statement adds a new row to the {} table", table.name),
        StatementKind::Update => format!("This statement changes rows in the {} table{}", table.name, filter),
        StatementKind::Delete => format!("This statement removes rows from the {} table{}", table.name, filter),
        StatementKind::With | StatementKind::Other => return None,
    };
    debug!("Template explanation used");
    Some(format!("{}.", text))
}

fn generic_explanation(statement: Option<&ScannedStatement>) -> String {
    let Some(statement) = statement else {
        return "This statement queries the database to answer your question.".to_string();
    };
    let tables = statement.tables.iter().map(|t| t.name.as_str()).unique().join(", ");
    let action = match statement.kind {
        StatementKind::Insert => "adds data to",
        StatementKind::Update => "changes data in",
        StatementKind::Delete => "removes data from",
        _ => "reads data from",
    };
    let mut text = if tables.is_empty() {
        format!("This statement {} the database", action)
    } else {
        format!("This statement {} {}", action, tables)
    };
    if statement.has_join {
        text.push_str(", combining related rows");
    }
    if statement.has_group_by {
        text.push_str(", summarised per group");
    }
    if statement.where_clause.is_some() {
        text.push_str(", limited to rows matching the filter");
    }
    text.push('.');
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{QueryError, Result};
    use crate::llm::DisabledGenerator;
    use crate::resolver::{MatchType, ValidatedColumn};
    use crate::schema::{ColumnDef, TableDef};
    use crate::sql::scanner::TokenScanner;
    use async_trait::async_trait;

    fn schema() -> SchemaSnapshot {
        SchemaSnapshot::new(
            vec![TableDef::new(
                "Clients",
                vec![ColumnDef::new("client_id", "int"), ColumnDef::new("email", "varchar")],
            )],
            vec![],
        )
    }

    fn explainer(llm: Arc<dyn TextGenerator>) -> ExplanationGenerator {
        ExplanationGenerator::new(llm, Arc::new(TokenScanner::default()))
    }

    #[tokio::test]
    async fn test_template_for_simple_select() {
        let text = explainer(Arc::new(DisabledGenerator))
            .explain(
                "SELECT email FROM Clients WHERE client_id > 10 ORDER BY email DESC LIMIT 5",
                "emails",
                &ColumnMapping::default(),
                &[],
                &schema(),
            )
            .await;
        assert_eq!(
            text,
            "This query retrieves the columns email from the Clients table where client_id > 10, \
sorted by email in descending order, returning at most 5 rows."
        );
    }

    #[tokio::test]
    async fn test_select_star() {
        let text = explainer(Arc::new(DisabledGenerator))
            .explain("SELECT * FROM Clients", "all clients", &ColumnMapping::default(), &[], &schema())
            .await;
        assert_eq!(text, "This query retrieves all columns from the Clients table.");
    }

    struct Fixed(&'static str);

    #[async_trait]
    impl TextGenerator for Fixed {
        async fn generate(&self, _prompt: &str, _system_prompt: Option<&str>) -> Result<String> {
            if self.0.is_empty() {
                Err(QueryError::Llm("down".to_string()))
            } else {
                Ok(self.0.to_string())
            }
        }
    }

    #[tokio::test]
    async fn test_complex_statement_uses_model_then_fallback() {
        let sql = "SELECT c.email, COUNT(*) FROM Clients c JOIN Orders o ON o.client_id = c.client_id GROUP BY c.email";
        let text = explainer(Arc::new(Fixed("Counts orders per client email.")))
            .explain(sql, "orders per email", &ColumnMapping::default(), &[], &schema())
            .await;
        assert_eq!(text, "Counts orders per client email.");

        let text = explainer(Arc::new(Fixed("")))
            .explain(sql, "orders per email", &ColumnMapping::default(), &[], &schema())
            .await;
        assert_eq!(
            text,
            "This statement reads data from Clients, Orders, combining related rows, summarised per group."
        );
    }

    #[tokio::test]
    async fn test_footnotes() {
        let mut mapping = ColumnMapping::default();
        mapping.insert(ValidatedColumn {
            requested_name: "mail".to_string(),
            table: "Clients".to_string(),
            column: "email".to_string(),
            match_type: MatchType::Fuzzy,
            confidence: 0.9,
            data_type: "varchar".to_string(),
        });
        let text = explainer(Arc::new(DisabledGenerator))
            .explain(
                "SELECT email FROM Clients",
                "mails",
                &mapping,
                &["emial".to_string(), "zzz".to_string()],
                &schema(),
            )
            .await;
        assert!(text.contains("Note: 'mail' was interpreted as Clients.email (90% confidence)."));
        assert!(text.contains("'emial' does not match any column and was ignored. Did you mean Clients.email?"));
        assert!(text.contains("'zzz' does not match any column and was ignored."));
    }
}
