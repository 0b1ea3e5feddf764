//! Structural gate for generated SQL
//!
//! Cheap lexical checks first, then schema checks: every table after
//! FROM/JOIN/INTO/UPDATE must exist and `table.column` references to known
//! tables must name real columns. CTEs skip the schema checks.

use crate::schema::SchemaSnapshot;
use crate::sql::scanner::{is_clause_keyword, Lexeme, ScannedStatement, SqlScanner, StatementKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

const STATEMENT_STARTS: [&str; 5] = ["SELECT", "INSERT", "UPDATE", "DELETE", "WITH"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub ok: bool,
    pub issues: Vec<String>,
}

impl ValidationReport {
    fn from_issues(issues: Vec<String>) -> Self {
        Self {
            ok: issues.is_empty(),
            issues,
        }
    }

    pub fn summary(&self) -> String {
        self.issues.join("; ")
    }
}

pub struct SqlValidator {
    scanner: Arc<dyn SqlScanner>,
}

impl SqlValidator {
    pub fn new(scanner: Arc<dyn SqlScanner>) -> Self {
        Self { scanner }
    }

    pub fn validate(&self, sql: &str, schema: &SchemaSnapshot) -> ValidationReport {
        let trimmed = sql.trim();
        if trimmed.is_empty() {
            return ValidationReport::from_issues(vec!["SQL is empty".to_string()]);
        }

        let lexemes = match self.scanner.tokenize(trimmed) {
            Ok(lexemes) => lexemes,
            Err(e) => return ValidationReport::from_issues(vec![e.to_string()]),
        };
        let significant: Vec<&Lexeme> = lexemes.iter().filter(|l| !l.is_whitespace()).collect();

        let mut issues = structural_issues(&significant);
        if !issues.is_empty() {
            debug!("Structural validation failed: {:?}", issues);
            return ValidationReport::from_issues(issues);
        }

        let statement = ScannedStatement::from_lexemes(lexemes);
        if statement.kind != StatementKind::With {
            issues.extend(schema_issues(&statement, schema));
        }
        if !issues.is_empty() {
            debug!("Schema validation failed: {:?}", issues);
        }
        ValidationReport::from_issues(issues)
    }

    /// UPDATE or DELETE with no WHERE clause.
    pub fn mutation_without_where(&self, sql: &str) -> Option<&'static str> {
        let statement = self.scanner.scan(sql).ok()?;
        if statement.where_clause.is_some() {
            return None;
        }
        match statement.kind {
            StatementKind::Update => Some("UPDATE"),
            StatementKind::Delete => Some("DELETE"),
            _ => None,
        }
    }
}

fn structural_issues(tokens: &[&Lexeme]) -> Vec<String> {
    let mut issues = Vec::new();

    let first = tokens.first().and_then(|t| t.keyword()).unwrap_or_default();
    if !STATEMENT_STARTS.contains(&first.as_str()) {
        issues.push(format!(
            "Statement must start with one of {}",
            STATEMENT_STARTS.join(", ")
        ));
        return issues;
    }

    let mut depth = 0i32;
    for token in tokens {
        if token.is_symbol("(") {
            depth += 1;
        } else if token.is_symbol(")") {
            depth -= 1;
            if depth < 0 {
                break;
            }
        }
    }
    if depth != 0 {
        issues.push("Unbalanced parentheses".to_string());
    }

    if first == "SELECT" && !tokens.iter().any(|t| t.is_keyword("FROM")) {
        issues.push("SELECT statement has no FROM clause".to_string());
    }

    for (i, token) in tokens.iter().enumerate() {
        if token.is_keyword("WHERE") {
            match tokens.get(i + 1) {
                None => issues.push("WHERE clause is empty".to_string()),
                Some(next) if next.is_symbol(";") => issues.push("WHERE clause is empty".to_string()),
                Some(next) if is_clause_keyword(next) => issues.push(format!(
                    "WHERE is immediately followed by {}",
                    next.render().to_uppercase()
                )),
                _ => {}
            }
        }
        if token.is_keyword("FROM") {
            let names_source = tokens
                .get(i + 1)
                .map(|next| (next.word().is_some() && !is_clause_keyword(next)) || next.is_symbol("("))
                .unwrap_or(false);
            if !names_source {
                issues.push("FROM is not followed by a table name".to_string());
            }
        }
    }
    issues
}

fn schema_issues(statement: &ScannedStatement, schema: &SchemaSnapshot) -> Vec<String> {
    let mut issues = Vec::new();
    let known = |name: &str| schema.table_names().find(|t| t.eq_ignore_ascii_case(name)).map(str::to_string);

    for table in &statement.tables {
        if known(&table.name).is_none() {
            issues.push(format!("Unknown table: {}", table.written));
        }
    }

    for (qualifier, column) in &statement.qualified_refs {
        let Some(table_name) = known(qualifier) else {
            continue;
        };
        let exists = schema
            .table(&table_name)
            .map(|t| t.column_ignore_case(column).is_some())
            .unwrap_or(false);
        if !exists {
            issues.push(format!("Unknown column: {}.{}", qualifier, column));
        }
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, TableDef};
    use crate::sql::scanner::TokenScanner;

    fn schema() -> SchemaSnapshot {
        SchemaSnapshot::new(
            vec![TableDef::new(
                "Clients",
                vec![
                    ColumnDef::new("client_id", "int").primary_key(),
                    ColumnDef::new("first_name", "varchar"),
                ],
            )],
            vec![],
        )
    }

    fn validator() -> SqlValidator {
        SqlValidator::new(Arc::new(TokenScanner::default()))
    }

    #[test]
    fn test_accepts_valid_select() {
        let report = validator().validate("SELECT Clients.first_name FROM Clients WHERE client_id = 1", &schema());
        assert!(report.ok, "{:?}", report.issues);
    }

    #[test]
    fn test_rejections() {
        let v = validator();
        let s = schema();
        for sql in [
            "",
            "   ",
            "EXPLAIN SELECT * FROM Clients",
            "SELECT * FROM Clients WHERE (client_id = 1",
            "SELECT 1",
            "SELECT * FROM Clients WHERE",
            "SELECT * FROM Clients WHERE ORDER BY client_id",
            "SELECT * FROM WHERE client_id = 1",
            "SELECT col FROM",
            "SELECT first_name FROM ;",
        ] {
            assert!(!v.validate(sql, &s).ok, "accepted: {:?}", sql);
        }

        let report = v.validate("SELECT col FROM", &s);
        assert!(report.issues.iter().any(|i| i == "FROM is not followed by a table name"));
    }

    #[test]
    fn test_parentheses_inside_strings_ignored() {
        let report = validator().validate("SELECT * FROM Clients WHERE first_name = 'a (b'", &schema());
        assert!(report.ok, "{:?}", report.issues);
    }

    #[test]
    fn test_unknown_table_and_column() {
        let v = validator();
        let report = v.validate("SELECT * FROM Customers", &schema());
        assert_eq!(report.issues, vec!["Unknown table: Customers"]);

        let report = v.validate("SELECT Clients.nickname FROM Clients", &schema());
        assert_eq!(report.issues, vec!["Unknown column: Clients.nickname"]);
    }

    #[test]
    fn test_table_case_and_cte() {
        let v = validator();
        assert!(v.validate("SELECT * FROM clients", &schema()).ok);
        assert!(v
            .validate("WITH x AS (SELECT * FROM Clients) SELECT * FROM x", &schema())
            .ok);
    }

    #[test]
    fn test_mutation_without_where() {
        let v = validator();
        assert_eq!(v.mutation_without_where("DELETE FROM Clients"), Some("DELETE"));
        assert_eq!(v.mutation_without_where("UPDATE Clients SET first_name = 'x'"), Some("UPDATE"));
        assert_eq!(v.mutation_without_where("DELETE FROM Clients WHERE client_id = 1"), None);
        assert_eq!(v.mutation_without_where("SELECT * FROM Clients"), None);
    }
}
