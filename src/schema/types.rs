use crate::db::ConnectionParams;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: String,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub is_primary_key: bool,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            is_primary_key: false,
            aliases: Vec::new(),
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self.nullable = false;
        self
    }

    /// Numeric columns are the only ones SUM/AVG/MIN/MAX are applied to.
    pub fn is_numeric(&self) -> bool {
        is_numeric_type(&self.data_type)
    }
}

pub fn is_numeric_type(data_type: &str) -> bool {
    const NUMERIC: [&str; 15] = [
        "int", "integer", "smallint", "bigint", "tinyint", "decimal", "numeric", "float",
        "real", "double", "double precision", "money", "smallmoney", "number", "serial",
    ];
    let lower = data_type.to_lowercase();
    let base = lower.split('(').next().unwrap_or("").trim();
    NUMERIC.contains(&base)
        || (base.starts_with("int") && base != "interval")
        || base.starts_with("float")
        || base == "bigserial"
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl TableDef {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        Self {
            name: name.into(),
            columns,
            aliases: Vec::new(),
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_ignore_case(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn primary_keys(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns.iter().filter(|c| c.is_primary_key)
    }

    /// Table name or one of its aliases equals `word`, ignoring case.
    pub fn answers_to(&self, word: &str) -> bool {
        self.name.eq_ignore_ascii_case(word) || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(word))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relationship {
    pub parent_table: String,
    pub parent_column: String,
    pub child_table: String,
    pub child_column: String,
}

impl Relationship {
    /// Whether this relationship links `a` and `b` in either direction.
    pub fn links(&self, a: &str, b: &str) -> bool {
        (self.parent_table == a && self.child_table == b)
            || (self.parent_table == b && self.child_table == a)
    }

    /// Join predicate, e.g. `Orders.client_id = Clients.client_id`.
    pub fn condition(&self) -> String {
        format!(
            "{}.{} = {}.{}",
            self.child_table, self.child_column, self.parent_table, self.parent_column
        )
    }
}

/// Immutable point-in-time view of a database. Shared as `Arc<SchemaSnapshot>`;
/// a refresh builds a new snapshot rather than editing this one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub tables: BTreeMap<String, TableDef>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
}

impl SchemaSnapshot {
    pub fn new(tables: Vec<TableDef>, relationships: Vec<Relationship>) -> Self {
        Self {
            tables: tables.into_iter().map(|t| (t.name.clone(), t)).collect(),
            relationships,
        }
    }

    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.tables.get(name)
    }

    /// Look a table up by exact name, then case-insensitively, then by alias.
    pub fn find_table(&self, name: &str) -> Option<&TableDef> {
        self.tables
            .get(name)
            .or_else(|| self.tables.values().find(|t| t.name.eq_ignore_ascii_case(name)))
            .or_else(|| self.tables.values().find(|t| t.answers_to(name)))
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(|k| k.as_str())
    }

    pub fn column(&self, table: &str, column: &str) -> Option<&ColumnDef> {
        self.tables.get(table).and_then(|t| t.column(column))
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Prompt-friendly description, optionally restricted to `only` tables.
    pub fn summary(&self, only: Option<&[String]>) -> String {
        let mut lines = Vec::new();
        for table in self.tables.values() {
            if let Some(only) = only {
                if !only.iter().any(|t| t == &table.name) {
                    continue;
                }
            }
            let columns: Vec<String> = table
                .columns
                .iter()
                .map(|c| {
                    let mut flags = vec![c.data_type.clone()];
                    if c.is_primary_key {
                        flags.push("PK".to_string());
                    }
                    if !c.nullable {
                        flags.push("NOT NULL".to_string());
                    }
                    format!("{} ({})", c.name, flags.join(", "))
                })
                .collect();
            lines.push(format!("Table {}: {}", table.name, columns.join(", ")));
        }

        let relationships: Vec<String> = self
            .relationships
            .iter()
            .filter(|r| match only {
                Some(only) => {
                    only.iter().any(|t| t == &r.parent_table) && only.iter().any(|t| t == &r.child_table)
                }
                None => true,
            })
            .map(|r| r.condition())
            .collect();
        if !relationships.is_empty() {
            lines.push(format!("Relationships: {}", relationships.join("; ")));
        }
        lines.join("\n")
    }
}

/// Cache identity of a database: `(server, database)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionKey {
    pub server: String,
    pub database: String,
}

impl From<&ConnectionParams> for ConnectionKey {
    fn from(params: &ConnectionParams) -> Self {
        Self {
            server: params.server.to_lowercase(),
            database: params.database.to_lowercase(),
        }
    }
}

impl std::fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.server, self.database)
    }
}

#[derive(Debug, Clone)]
pub struct SchemaCacheEntry {
    pub snapshot: Arc<SchemaSnapshot>,
    pub fetched_at: DateTime<Utc>,
}

impl SchemaCacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now - self.fetched_at > ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clients_schema() -> SchemaSnapshot {
        let mut clients = TableDef::new(
            "Clients",
            vec![
                ColumnDef::new("client_id", "int").primary_key(),
                ColumnDef::new("first_name", "varchar(50)"),
            ],
        );
        clients.aliases = vec!["client".to_string(), "clients".to_string()];
        SchemaSnapshot::new(vec![clients], vec![])
    }

    #[test]
    fn test_find_table_variants() {
        let schema = clients_schema();
        assert_eq!(schema.find_table("Clients").unwrap().name, "Clients");
        assert_eq!(schema.find_table("clients").unwrap().name, "Clients");
        assert_eq!(schema.find_table("client").unwrap().name, "Clients");
        assert!(schema.find_table("orders").is_none());
    }

    #[test]
    fn test_numeric_types() {
        assert!(is_numeric_type("int"));
        assert!(is_numeric_type("decimal(10,2)"));
        assert!(is_numeric_type("double precision"));
        assert!(is_numeric_type("INT4"));
        assert!(!is_numeric_type("varchar(50)"));
        assert!(!is_numeric_type("date"));
    }

    #[test]
    fn test_summary_mentions_columns() {
        let summary = clients_schema().summary(None);
        assert!(summary.contains("Table Clients"));
        assert!(summary.contains("client_id (int, PK, NOT NULL)"));
    }

    #[test]
    fn test_entry_expiry() {
        let fetched_at = Utc::now();
        let entry = SchemaCacheEntry {
            snapshot: Arc::new(SchemaSnapshot::default()),
            fetched_at,
        };
        let ttl = chrono::Duration::seconds(60);
        assert!(!entry.is_expired(fetched_at + chrono::Duration::seconds(60), ttl));
        assert!(entry.is_expired(fetched_at + chrono::Duration::seconds(61), ttl));
    }
}
