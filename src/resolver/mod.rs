//! Column resolution
//!
//! Maps the names an intent mentions onto real `table.column` pairs. Table
//! candidates come from the intent, then from which tables hold the requested
//! names, then from entity hints, and finally from the whole schema. Matching
//! is exact, then case-insensitive (aliases included), then fuzzy.

pub mod fuzzy;

pub use fuzzy::{clean_name, fuzzy_score, ACCEPT_THRESHOLD};

use crate::intent::IntentInfo;
use crate::schema::{ColumnDef, SchemaSnapshot, TableDef};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use tracing::{debug, warn};

const CASE_INSENSITIVE_CONFIDENCE: f64 = 0.95;
const SUGGESTION_THRESHOLD: f64 = 0.75;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    CaseInsensitive,
    Fuzzy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedColumn {
    pub requested_name: String,
    pub table: String,
    pub column: String,
    pub match_type: MatchType,
    pub confidence: f64,
    pub data_type: String,
}

impl ValidatedColumn {
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.table, self.column)
    }
}

/// Validated columns in request order, looked up by requested name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnMapping {
    entries: Vec<ValidatedColumn>,
}

impl ColumnMapping {
    pub fn insert(&mut self, column: ValidatedColumn) {
        if let Some(existing) = self.entries.iter_mut().find(|c| c.requested_name == column.requested_name) {
            *existing = column;
        } else {
            self.entries.push(column);
        }
    }

    pub fn get(&self, requested_name: &str) -> Option<&ValidatedColumn> {
        self.entries
            .iter()
            .find(|c| c.requested_name == requested_name)
            .or_else(|| {
                self.entries
                    .iter()
                    .find(|c| c.requested_name.eq_ignore_ascii_case(requested_name))
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidatedColumn> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn fuzzy_matches(&self) -> impl Iterator<Item = &ValidatedColumn> {
        self.entries.iter().filter(|c| c.match_type == MatchType::Fuzzy)
    }

    /// Distinct tables in first-use order.
    pub fn tables(&self) -> Vec<String> {
        self.entries.iter().map(|c| c.table.clone()).unique().collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub mapping: ColumnMapping,
    pub unmapped: Vec<String>,
    /// Tables the statement should read from.
    pub tables: Vec<String>,
    /// Every table matching was restricted to.
    pub candidate_tables: Vec<String>,
    pub low_confidence_tables: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ColumnResolver;

impl ColumnResolver {
    pub fn new() -> Self {
        Self
    }

    pub fn resolve(&self, intent: &IntentInfo, schema: &SchemaSnapshot) -> Resolution {
        let names = intent.requested_names();
        let explicit = explicit_tables(intent, schema);

        let mut low_confidence = false;
        let mut candidates = explicit.clone();
        if candidates.is_empty() {
            candidates = tables_holding(&names, schema);
        }
        if candidates.is_empty() {
            candidates = hinted_tables(intent, schema);
        }
        if candidates.is_empty() {
            candidates = schema.table_names().map(str::to_string).collect();
            low_confidence = true;
            if !candidates.is_empty() {
                warn!(
                    "No table could be inferred for {:?}; matching against all {} tables",
                    names,
                    candidates.len()
                );
            }
        }

        let mut mapping = ColumnMapping::default();
        let mut unmapped = Vec::new();
        for name in &names {
            match match_name(name, &candidates, schema) {
                Some(column) => {
                    debug!(
                        "Resolved '{}' to {} ({:?}, {:.2})",
                        name,
                        column.qualified(),
                        column.match_type,
                        column.confidence
                    );
                    mapping.insert(column);
                }
                None => {
                    debug!("Could not resolve '{}'", name);
                    unmapped.push(name.clone());
                }
            }
        }

        let mut tables: Vec<String> = explicit
            .iter()
            .cloned()
            .chain(mapping.tables())
            .unique()
            .collect();
        if tables.is_empty() {
            tables = candidates.iter().take(1).cloned().collect();
        }

        Resolution {
            mapping,
            unmapped,
            tables,
            candidate_tables: candidates,
            low_confidence_tables: low_confidence,
        }
    }

    /// Closest `table.column` identifiers to `name`, best first.
    pub fn suggest(&self, name: &str, schema: &SchemaSnapshot, limit: usize) -> Vec<String> {
        let needle = name.to_lowercase();
        let needle = needle.as_str();
        schema
            .tables
            .values()
            .flat_map(|t| {
                t.columns.iter().map(move |c| {
                    let score = jaro_winkler(needle, &c.name.to_lowercase());
                    (score, format!("{}.{}", t.name, c.name))
                })
            })
            .filter(|(score, _)| *score >= SUGGESTION_THRESHOLD)
            .sorted_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal))
            .take(limit)
            .map(|(_, name)| name)
            .collect()
    }
}

/// `intent.tables` plus qualifiers of `table.column` names, resolved against
/// the schema.
fn explicit_tables(intent: &IntentInfo, schema: &SchemaSnapshot) -> Vec<String> {
    let qualifiers = intent
        .requested_names()
        .into_iter()
        .filter_map(|n| n.split_once('.').map(|(table, _)| table.to_string()));
    intent
        .tables
        .iter()
        .cloned()
        .chain(qualifiers)
        .filter_map(|t| schema.find_table(&t).map(|table| table.name.clone()))
        .unique()
        .collect()
}

fn hinted_tables(intent: &IntentInfo, schema: &SchemaSnapshot) -> Vec<String> {
    intent
        .entity_hints
        .iter()
        .filter_map(|h| schema.find_table(h).map(|t| t.name.clone()))
        .unique()
        .collect()
}

fn unqualified(name: &str) -> &str {
    name.rsplit_once('.').map(|(_, column)| column).unwrap_or(name)
}

fn column_answers_to(column: &ColumnDef, name: &str) -> bool {
    column.name.eq_ignore_ascii_case(name) || column.aliases.iter().any(|a| a.eq_ignore_ascii_case(name))
}

fn contains_either(column: &ColumnDef, name: &str) -> bool {
    let column = column.name.to_lowercase();
    column.contains(name) || name.contains(column.as_str())
}

fn cleaned_contains_either(column: &ColumnDef, name: &str) -> bool {
    let column = clean_name(&column.name);
    let name = clean_name(name);
    !column.is_empty() && !name.is_empty() && (column.contains(&name) || name.contains(&column))
}

/// Tables holding any requested name: exact, then substring, then cleaned
/// substring.
fn tables_holding(names: &[String], schema: &SchemaSnapshot) -> Vec<String> {
    let bare: Vec<String> = names.iter().map(|n| unqualified(n).to_lowercase()).collect();
    if bare.is_empty() {
        return Vec::new();
    }

    let tiers: [fn(&ColumnDef, &str) -> bool; 3] = [column_answers_to, contains_either, cleaned_contains_either];
    for tier in tiers {
        let found: Vec<String> = schema
            .tables
            .values()
            .filter(|t| t.columns.iter().any(|c| bare.iter().any(|n| tier(c, n))))
            .map(|t| t.name.clone())
            .collect();
        if !found.is_empty() {
            return found;
        }
    }
    Vec::new()
}

fn validated(name: &str, table: &TableDef, column: &ColumnDef, match_type: MatchType, confidence: f64) -> ValidatedColumn {
    ValidatedColumn {
        requested_name: name.to_string(),
        table: table.name.clone(),
        column: column.name.clone(),
        match_type,
        confidence,
        data_type: column.data_type.clone(),
    }
}

fn match_name(name: &str, candidates: &[String], schema: &SchemaSnapshot) -> Option<ValidatedColumn> {
    // A qualifier naming a known table pins the match to that table
    let (tables, bare): (Vec<&TableDef>, &str) = match name.rsplit_once('.') {
        Some((qualifier, column)) => match schema.find_table(qualifier) {
            Some(table) => (vec![table], column),
            None => (candidates.iter().filter_map(|t| schema.table(t)).collect(), column),
        },
        None => (candidates.iter().filter_map(|t| schema.table(t)).collect(), name),
    };
    let bare = bare.trim();
    if bare.is_empty() {
        return None;
    }

    for table in &tables {
        if let Some(column) = table.column(bare) {
            return Some(validated(name, table, column, MatchType::Exact, 1.0));
        }
    }

    for table in &tables {
        if let Some(column) = table.columns.iter().find(|c| column_answers_to(c, bare)) {
            return Some(validated(
                name,
                table,
                column,
                MatchType::CaseInsensitive,
                CASE_INSENSITIVE_CONFIDENCE,
            ));
        }
    }

    let mut best: Option<(f64, &TableDef, &ColumnDef)> = None;
    for table in &tables {
        for column in &table.columns {
            let score = std::iter::once(column.name.as_str())
                .chain(column.aliases.iter().map(String::as_str))
                .map(|candidate| fuzzy_score(bare, candidate))
                .fold(0.0, f64::max);
            if score >= ACCEPT_THRESHOLD && best.map(|(b, _, _)| score > b).unwrap_or(true) {
                best = Some((score, *table, column));
            }
        }
    }
    best.map(|(score, table, column)| validated(name, table, column, MatchType::Fuzzy, score))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::keyword_intent;
    use crate::schema::aliases::derive_aliases;

    fn schema() -> SchemaSnapshot {
        let mut tables = vec![
            TableDef::new(
                "Clients",
                vec![
                    ColumnDef::new("client_id", "int").primary_key(),
                    ColumnDef::new("first_name", "varchar"),
                    ColumnDef::new("last_name", "varchar"),
                    ColumnDef::new("email", "varchar"),
                    ColumnDef::new("phone", "varchar"),
                ],
            ),
            TableDef::new(
                "Orders",
                vec![
                    ColumnDef::new("order_id", "int").primary_key(),
                    ColumnDef::new("client_id", "int"),
                    ColumnDef::new("order_total", "decimal"),
                    ColumnDef::new("created_at", "timestamp"),
                ],
            ),
        ];
        derive_aliases(&mut tables);
        SchemaSnapshot::new(tables, vec![])
    }

    fn intent(columns: &[&str]) -> IntentInfo {
        IntentInfo {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_match_tiers() {
        let resolution = ColumnResolver::new().resolve(&intent(&["email", "EMAIL", "creation date", "total"]), &schema());
        let m = &resolution.mapping;
        assert_eq!(m.get("email").unwrap().match_type, MatchType::Exact);
        assert_eq!(m.get("EMAIL").unwrap().match_type, MatchType::CaseInsensitive);
        assert_eq!(m.get("creation date").unwrap().column, "created_at");
        let total = m.get("total").unwrap();
        assert_eq!(total.column, "order_total");
        assert_eq!(total.match_type, MatchType::Fuzzy);
        assert!((total.confidence - 0.9).abs() < 1e-9);
        assert!(resolution.unmapped.is_empty());
    }

    #[test]
    fn test_active_clients_unmapped() {
        let s = schema();
        let intent = keyword_intent("Show all clients that are active", &s);
        let resolution = ColumnResolver::new().resolve(&intent, &s);
        assert_eq!(resolution.unmapped, vec!["active"]);
        assert!(resolution.mapping.is_empty());
        assert_eq!(resolution.tables, vec!["Clients"]);
        assert!(!resolution.low_confidence_tables);
    }

    #[test]
    fn test_table_inference_from_columns() {
        let resolution = ColumnResolver::new().resolve(&intent(&["order_total"]), &schema());
        assert_eq!(resolution.candidate_tables, vec!["Orders"]);
        assert_eq!(resolution.tables, vec!["Orders"]);
    }

    #[test]
    fn test_explicit_table_restricts_matching() {
        let mut i = intent(&["client_id"]);
        i.tables = vec!["orders".to_string()];
        let resolution = ColumnResolver::new().resolve(&i, &schema());
        assert_eq!(resolution.mapping.get("client_id").unwrap().table, "Orders");
    }

    #[test]
    fn test_qualified_name() {
        let resolution = ColumnResolver::new().resolve(&intent(&["Clients.client_id"]), &schema());
        let column = resolution.mapping.get("Clients.client_id").unwrap();
        assert_eq!(column.table, "Clients");
        assert_eq!(column.column, "client_id");
    }

    #[test]
    fn test_low_confidence_fallback() {
        let resolution = ColumnResolver::new().resolve(&intent(&["zzz"]), &schema());
        assert!(resolution.low_confidence_tables);
        assert_eq!(resolution.unmapped, vec!["zzz"]);
        assert_eq!(resolution.tables.len(), 1);
    }

    #[test]
    fn test_validated_columns_exist_in_schema() {
        let s = schema();
        let resolution = ColumnResolver::new().resolve(
            &intent(&["mail", "name", "phone_number", "order", "created", "id", "nothing"]),
            &s,
        );
        for column in resolution.mapping.iter() {
            let table = s.table(&column.table).expect("table exists");
            assert!(table.column(&column.column).is_some(), "{:?}", column);
        }
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let s = schema();
        let i = intent(&["mail", "name", "total", "creation date"]);
        let resolver = ColumnResolver::new();
        assert_eq!(resolver.resolve(&i, &s), resolver.resolve(&i, &s));
    }

    #[test]
    fn test_suggestions() {
        let suggestions = ColumnResolver::new().suggest("emial", &schema(), 3);
        assert_eq!(suggestions.first().map(String::as_str), Some("Clients.email"));
        assert!(suggestions.len() <= 3);

        assert!(ColumnResolver::new().suggest("qqqqqq", &schema(), 3).is_empty());
    }
}
