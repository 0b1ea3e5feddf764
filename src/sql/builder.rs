//! Template SQL construction from a resolved intent
//!
//! The builder only ever emits identifiers that came out of the resolver, so a
//! statement it produces names real tables and columns. Anything it cannot
//! express is an error and the caller falls back to the model.

use crate::db::SqlDialect;
use crate::error::{QueryError, Result};
use crate::intent::{AggregateFunction, FilterCondition, FilterOp, FilterValue, IntentInfo, Operation};
use crate::resolver::{ColumnMapping, ValidatedColumn};
use crate::schema::SchemaSnapshot;
use crate::sql::joins::plan_joins;
use crate::sql::scanner::quote_literal;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuiltSql {
    pub sql: String,
    /// Tables the statement reads or writes, join bridges included.
    pub tables: Vec<String>,
    pub cross_join: bool,
    /// Filters left out because their column did not resolve.
    pub dropped_filters: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SqlBuilder {
    dialect: SqlDialect,
    allow_unfiltered_mutations: bool,
}

impl SqlBuilder {
    pub fn new(dialect: SqlDialect) -> Self {
        Self {
            dialect,
            allow_unfiltered_mutations: false,
        }
    }

    pub fn allow_unfiltered_mutations(mut self, allow: bool) -> Self {
        self.allow_unfiltered_mutations = allow;
        self
    }

    pub fn build(
        &self,
        intent: &IntentInfo,
        mapping: &ColumnMapping,
        schema: &SchemaSnapshot,
        tables_used: &[String],
    ) -> Result<BuiltSql> {
        let tables: Vec<String> = tables_used
            .iter()
            .filter_map(|t| schema.find_table(t).map(|table| table.name.clone()))
            .unique()
            .collect();
        if tables.is_empty() {
            return Err(QueryError::Resolution(
                "No table in the schema matches the request".to_string(),
            ));
        }

        let built = match intent.operation {
            Operation::Select => self.select(intent, mapping, schema, &tables)?,
            Operation::Insert => self.insert(mapping, &tables)?,
            Operation::Update => self.update(intent, mapping, &tables)?,
            Operation::Delete => self.delete(intent, mapping, &tables)?,
        };
        debug!("Template SQL: {}", built.sql);
        Ok(built)
    }

    fn select(
        &self,
        intent: &IntentInfo,
        mapping: &ColumnMapping,
        schema: &SchemaSnapshot,
        tables: &[String],
    ) -> Result<BuiltSql> {
        let plan = plan_joins(tables, &schema.relationships)
            .ok_or_else(|| QueryError::Resolution("No table to select from".to_string()))?;
        let all_tables = plan.tables();
        let qualify = all_tables.len() > 1;
        let reference = |c: &ValidatedColumn| {
            if qualify {
                c.qualified()
            } else {
                c.column.clone()
            }
        };

        let selected = lookup_all(mapping, &intent.columns);
        let mut group_by: Vec<&ValidatedColumn> = lookup_all(mapping, &intent.group_by);

        let mut items: Vec<String> = Vec::new();
        match intent.aggregation_type.filter(|_| intent.requires_aggregation) {
            Some(function) => {
                items.extend(group_by.iter().map(|c| reference(c)));
                let measured: Vec<&ValidatedColumn> = selected
                    .iter()
                    .copied()
                    .filter(|c| !group_by.iter().any(|g| g.qualified() == c.qualified()))
                    .collect();

                let mut aggregated = 0;
                for column in measured.iter().copied() {
                    let numeric = schema
                        .column(&column.table, &column.column)
                        .map(|c| c.is_numeric())
                        .unwrap_or(false);
                    if function.requires_numeric() && !numeric {
                        // Passed through unaggregated, so it has to be grouped
                        items.push(reference(column));
                        group_by.push(column);
                        continue;
                    }
                    items.push(format!(
                        "{}({}) AS {}_{}",
                        function.sql_name(),
                        reference(column),
                        function.sql_name().to_lowercase(),
                        column.column
                    ));
                    aggregated += 1;
                }

                if aggregated == 0 {
                    if function != AggregateFunction::Count {
                        return Err(QueryError::Resolution(format!(
                            "{} needs a numeric column",
                            function.sql_name()
                        )));
                    }
                    items.push("COUNT(*) AS count".to_string());
                }
            }
            None if selected.is_empty() && group_by.is_empty() => {
                if qualify {
                    items.extend(tables.iter().map(|t| format!("{}.*", t)));
                } else {
                    items.push("*".to_string());
                }
            }
            None => {
                items.extend(selected.iter().chain(group_by.iter()).map(|c| reference(c)).unique());
            }
        }

        let (conditions, dropped_filters) = self.conditions(intent, mapping, qualify);

        let mut sql = String::from("SELECT ");
        if let (Some(limit), true) = (intent.limit, self.dialect.uses_top()) {
            sql.push_str(&format!("TOP {} ", limit));
        }
        sql.push_str(&items.join(", "));
        sql.push_str(" FROM ");
        sql.push_str(&plan.render());
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        if intent.requires_aggregation && !group_by.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&group_by.iter().map(|c| reference(c)).unique().join(", "));
        }

        let order: Vec<String> = intent
            .order_by
            .iter()
            .filter_map(|o| match mapping.get(&o.column) {
                Some(column) => Some(format!("{} {}", reference(column), o.direction.sql())),
                None => {
                    debug!("Dropping ORDER BY on unresolved column '{}'", o.column);
                    None
                }
            })
            .collect();
        if !order.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&order.join(", "));
        }
        if let (Some(limit), false) = (intent.limit, self.dialect.uses_top()) {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        Ok(BuiltSql {
            sql,
            cross_join: plan.has_cross_join(),
            tables: all_tables,
            dropped_filters,
        })
    }

    fn insert(&self, mapping: &ColumnMapping, tables: &[String]) -> Result<BuiltSql> {
        let target = single_target("INSERT", tables)?;
        let columns: Vec<&str> = columns_of(mapping, target).collect();
        if columns.is_empty() {
            return Err(QueryError::Resolution(format!(
                "No resolved columns of {} to insert",
                target
            )));
        }
        let placeholders = (1..=columns.len()).map(|i| self.dialect.placeholder(i)).join(", ");
        Ok(BuiltSql {
            sql: format!(
                "INSERT INTO {} ({}) VALUES ({})",
                target,
                columns.join(", "),
                placeholders
            ),
            tables: vec![target.to_string()],
            ..BuiltSql::default()
        })
    }

    fn update(&self, intent: &IntentInfo, mapping: &ColumnMapping, tables: &[String]) -> Result<BuiltSql> {
        let target = single_target("UPDATE", tables)?;
        let filter_columns: Vec<String> = intent
            .filter_conditions()
            .into_iter()
            .filter_map(|f| mapping.get(&f.column).map(|c| c.column.clone()))
            .collect();
        let assigned: Vec<&str> = columns_of(mapping, target)
            .filter(|c| !filter_columns.iter().any(|f| f.as_str() == *c))
            .collect();
        if assigned.is_empty() {
            return Err(QueryError::Resolution(format!(
                "No resolved columns of {} to update",
                target
            )));
        }

        let (conditions, dropped_filters) = self.conditions(intent, mapping, false);
        self.guard_unfiltered("UPDATE", &conditions)?;

        let assignments = assigned
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = {}", c, self.dialect.placeholder(i + 1)))
            .join(", ");
        let mut sql = format!("UPDATE {} SET {}", target, assignments);
        if !conditions.is_empty() {
            sql.push_str(&format!(" WHERE {}", conditions.join(" AND ")));
        }
        Ok(BuiltSql {
            sql,
            tables: vec![target.to_string()],
            cross_join: false,
            dropped_filters,
        })
    }

    fn delete(&self, intent: &IntentInfo, mapping: &ColumnMapping, tables: &[String]) -> Result<BuiltSql> {
        let target = single_target("DELETE", tables)?;
        let (conditions, dropped_filters) = self.conditions(intent, mapping, false);
        self.guard_unfiltered("DELETE", &conditions)?;

        let mut sql = format!("DELETE FROM {}", target);
        if !conditions.is_empty() {
            sql.push_str(&format!(" WHERE {}", conditions.join(" AND ")));
        }
        Ok(BuiltSql {
            sql,
            tables: vec![target.to_string()],
            cross_join: false,
            dropped_filters,
        })
    }

    fn guard_unfiltered(&self, operation: &str, conditions: &[String]) -> Result<()> {
        if conditions.is_empty() && !self.allow_unfiltered_mutations {
            return Err(QueryError::UnsafeMutation(operation.to_string()));
        }
        Ok(())
    }

    /// Rendered predicates plus the filters that had to be dropped.
    fn conditions(&self, intent: &IntentInfo, mapping: &ColumnMapping, qualify: bool) -> (Vec<String>, Vec<String>) {
        let mut rendered = Vec::new();
        let mut dropped = Vec::new();
        for text in &intent.filters {
            let Some(filter) = FilterCondition::parse(text) else {
                warn!("Could not read filter '{}'", text);
                dropped.push(text.clone());
                continue;
            };
            let Some(column) = mapping.get(&filter.column) else {
                debug!("Dropping filter on unresolved column '{}'", filter.column);
                dropped.push(text.clone());
                continue;
            };
            let reference = if qualify { column.qualified() } else { column.column.clone() };
            rendered.push(self.predicate(&reference, &filter));
        }
        (rendered, dropped)
    }

    fn predicate(&self, reference: &str, filter: &FilterCondition) -> String {
        match filter.op {
            FilterOp::IsNull | FilterOp::IsNotNull => format!("{} {}", reference, filter.op.sql()),
            FilterOp::IsTrue => format!("{} = {}", reference, self.dialect.boolean_literal(true)),
            FilterOp::IsFalse => format!("{} = {}", reference, self.dialect.boolean_literal(false)),
            FilterOp::Like | FilterOp::NotLike => {
                let pattern = match &filter.value {
                    Some(FilterValue::Text(text)) | Some(FilterValue::Number(text)) => text.clone(),
                    Some(FilterValue::Bool(b)) => b.to_string(),
                    None => String::new(),
                };
                let pattern = if pattern.contains('%') { pattern } else { format!("%{}%", pattern) };
                format!("{} {} {}", reference, filter.op.sql(), quote_literal(&pattern))
            }
            _ => format!("{} {} {}", reference, filter.op.sql(), self.value(filter.value.as_ref())),
        }
    }

    fn value(&self, value: Option<&FilterValue>) -> String {
        match value {
            Some(FilterValue::Number(n)) => n.clone(),
            Some(FilterValue::Text(text)) => quote_literal(text),
            Some(FilterValue::Bool(b)) => self.dialect.boolean_literal(*b).to_string(),
            None => "NULL".to_string(),
        }
    }
}

fn lookup_all<'m>(mapping: &'m ColumnMapping, names: &[String]) -> Vec<&'m ValidatedColumn> {
    names
        .iter()
        .filter_map(|n| mapping.get(n))
        .unique_by(|c| c.qualified())
        .collect()
}

fn columns_of<'m>(mapping: &'m ColumnMapping, table: &'m str) -> impl Iterator<Item = &'m str> {
    mapping
        .iter()
        .filter(move |c| c.table == table)
        .map(|c| c.column.as_str())
        .unique()
}

fn single_target<'t>(operation: &str, tables: &'t [String]) -> Result<&'t str> {
    match tables {
        [table] => Ok(table.as_str()),
        _ => Err(QueryError::Resolution(format!(
            "{} needs exactly one target table, found {}",
            operation,
            tables.len()
        ))),
    }
}
