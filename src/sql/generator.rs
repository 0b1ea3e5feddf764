//! Model-backed SQL generation
//!
//! Used when the template builder cannot produce a statement, produced a cross
//! join, or produced something the validator rejected, and again when a
//! critique asks for a rewrite.

use crate::db::SqlDialect;
use crate::error::{QueryError, Result};
use crate::intent::IntentInfo;
use crate::llm::{truncate, TextGenerator};
use crate::resolver::ColumnMapping;
use crate::schema::SchemaSnapshot;
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, info};

const SYSTEM_PROMPT: &str = "You write a single SQL statement for the database described. \
Use only the tables and columns listed. Return the SQL in a ```sql code block with no commentary.";

const STATEMENT_STARTS: [&str; 5] = ["SELECT", "INSERT", "UPDATE", "DELETE", "WITH"];

lazy_static! {
    static ref FENCED_SQL: Regex = Regex::new(r"(?is)```[ \t]*(?:sql|tsql|postgresql|postgres)?[ \t]*\r?\n?(.*?)```").unwrap();
}

/// Everything a prompt needs about the current request.
#[derive(Debug, Clone, Copy)]
pub struct GenerationContext<'a> {
    pub query: &'a str,
    pub intent: &'a IntentInfo,
    pub mapping: &'a ColumnMapping,
    pub schema: &'a SchemaSnapshot,
    pub tables: &'a [String],
    pub dialect: SqlDialect,
}

pub struct SqlGenerator {
    llm: Arc<dyn TextGenerator>,
}

impl SqlGenerator {
    pub fn new(llm: Arc<dyn TextGenerator>) -> Self {
        Self { llm }
    }

    /// Fresh statement for the request. `previous_error` explains why the last
    /// attempt was not usable.
    pub async fn generate(&self, ctx: &GenerationContext<'_>, previous_error: Option<&str>) -> Result<String> {
        let mut prompt = self.base_prompt(ctx);
        if let Some(error) = previous_error {
            prompt.push_str(&format!(
                "\nTHE PREVIOUS ATTEMPT FAILED:\n{}\nWrite a statement that avoids this problem.\n",
                error
            ));
        }
        info!("Asking the model for SQL");
        self.complete(&prompt).await
    }

    /// Rewrite `previous_sql` addressing critique feedback.
    pub async fn regenerate(
        &self,
        ctx: &GenerationContext<'_>,
        previous_sql: &str,
        issues: &[String],
        suggestions: &[String],
    ) -> Result<String> {
        let mut prompt = self.base_prompt(ctx);
        prompt.push_str(&format!("\nCURRENT SQL:\n{}\n", previous_sql));
        if !issues.is_empty() {
            prompt.push_str(&format!("\nPROBLEMS FOUND:\n- {}\n", issues.join("\n- ")));
        }
        if !suggestions.is_empty() {
            prompt.push_str(&format!("\nSUGGESTED CHANGES:\n- {}\n", suggestions.join("\n- ")));
        }
        prompt.push_str("\nWrite an improved statement.\n");
        info!("Asking the model to rewrite SQL after critique");
        self.complete(&prompt).await
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let response = self.llm.generate(prompt, Some(SYSTEM_PROMPT)).await?;
        let sql = extract_sql(&response).ok_or_else(|| {
            QueryError::Llm(format!("No SQL in model response: {}", truncate(&response, 200)))
        })?;
        debug!("Model SQL: {}", sql);
        Ok(sql)
    }

    fn base_prompt(&self, ctx: &GenerationContext<'_>) -> String {
        let scope: Option<&[String]> = (!ctx.tables.is_empty()).then_some(ctx.tables);
        let columns = if ctx.mapping.is_empty() {
            "(none resolved)".to_string()
        } else {
            ctx.mapping
                .iter()
                .map(|c| format!("{} -> {} ({})", c.requested_name, c.qualified(), c.data_type))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let intent = serde_json::to_string_pretty(ctx.intent).unwrap_or_default();
        let dialect_note = match ctx.dialect {
            SqlDialect::SqlServer => "SQL Server (use TOP n, not LIMIT)",
            SqlDialect::Postgres => "PostgreSQL (use LIMIT n)",
            SqlDialect::Generic => "ANSI SQL (use LIMIT n)",
        };

        format!(
            r#"DIALECT: {dialect}

SCHEMA:
{schema}

RESOLVED COLUMNS (requested -> table.column):
{columns}

INTENT:
{intent}

QUESTION: {query}
"#,
            dialect = dialect_note,
            schema = ctx.schema.summary(scope),
            columns = columns,
            intent = intent,
            query = ctx.query,
        )
    }
}

fn starts_statement(line: &str) -> bool {
    let first = line
        .trim_start()
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or_default()
        .to_uppercase();
    STATEMENT_STARTS.contains(&first.as_str())
}

/// SQL from a model response: the first fenced block, otherwise the lines from
/// the first statement keyword up to a blank line or a terminating `;`.
pub fn extract_sql(response: &str) -> Option<String> {
    let sql = match FENCED_SQL.captures(response) {
        Some(caps) => caps[1].trim().to_string(),
        None => {
            let mut lines = Vec::new();
            for line in response.lines().skip_while(|l| !starts_statement(l)) {
                if line.trim().is_empty() {
                    break;
                }
                lines.push(line.trim_end());
                if line.trim_end().ends_with(';') {
                    break;
                }
            }
            lines.join("\n")
        }
    };
    let sql = sql.trim().trim_end_matches(';').trim().to_string();
    (!sql.is_empty()).then_some(sql)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, TableDef};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[test]
    fn test_extract_fenced() {
        let response = "Here you go:\n```sql\nSELECT * FROM Clients;\n```\nThis lists clients.";
        assert_eq!(extract_sql(response).as_deref(), Some("SELECT * FROM Clients"));

        let bare_fence = "```\nSELECT 1 FROM t\n```";
        assert_eq!(extract_sql(bare_fence).as_deref(), Some("SELECT 1 FROM t"));
    }

    #[test]
    fn test_extract_raw_strips_prose() {
        let response = "Sure! The query is:\nSELECT first_name\nFROM Clients\nWHERE city = 'Paris';\nIt filters by city.";
        assert_eq!(
            extract_sql(response).as_deref(),
            Some("SELECT first_name\nFROM Clients\nWHERE city = 'Paris'")
        );
    }

    #[test]
    fn test_extract_nothing() {
        assert_eq!(extract_sql("I cannot help with that."), None);
        assert_eq!(extract_sql("```sql\n```"), None);
    }

    struct Recorder {
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TextGenerator for Recorder {
        async fn generate(&self, prompt: &str, _system_prompt: Option<&str>) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            Ok("```sql\nSELECT client_id FROM Clients\n```".to_string())
        }
    }

    #[tokio::test]
    async fn test_prompt_scoped_to_tables_and_carries_feedback() {
        let schema = SchemaSnapshot::new(
            vec![
                TableDef::new("Clients", vec![ColumnDef::new("client_id", "int")]),
                TableDef::new("Invoices", vec![ColumnDef::new("invoice_id", "int")]),
            ],
            vec![],
        );
        let intent = IntentInfo::default();
        let mapping = ColumnMapping::default();
        let tables = vec!["Clients".to_string()];
        let ctx = GenerationContext {
            query: "list client ids",
            intent: &intent,
            mapping: &mapping,
            schema: &schema,
            tables: &tables,
            dialect: SqlDialect::SqlServer,
        };
        let llm = Arc::new(Recorder {
            prompts: Mutex::new(Vec::new()),
        });
        let generator = SqlGenerator::new(llm.clone());

        let sql = generator.generate(&ctx, Some("Unknown table: Client")).await.unwrap();
        assert_eq!(sql, "SELECT client_id FROM Clients");
        generator
            .regenerate(&ctx, &sql, &["missing filter".to_string()], &[])
            .await
            .unwrap();

        let prompts = llm.prompts.lock().unwrap();
        assert!(prompts[0].contains("Table Clients"));
        assert!(!prompts[0].contains("Invoices"));
        assert!(prompts[0].contains("Unknown table: Client"));
        assert!(prompts[0].contains("TOP n"));
        assert!(prompts[1].contains("CURRENT SQL:\nSELECT client_id FROM Clients"));
        assert!(prompts[1].contains("- missing filter"));
    }
}
