//! Join planning over schema relationships

use crate::schema::Relationship;
use itertools::Itertools;
use std::collections::{HashSet, VecDeque};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinKind {
    Inner { condition: String },
    Cross,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinStep {
    pub table: String,
    pub kind: JoinKind,
}

/// FROM clause for a set of tables: a base table and the joins that reach
/// every other table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinPlan {
    pub base: String,
    pub steps: Vec<JoinStep>,
}

impl JoinPlan {
    /// Every table in the plan, bridges included, in join order.
    pub fn tables(&self) -> Vec<String> {
        std::iter::once(self.base.clone())
            .chain(self.steps.iter().map(|s| s.table.clone()))
            .collect()
    }

    pub fn has_cross_join(&self) -> bool {
        self.steps.iter().any(|s| s.kind == JoinKind::Cross)
    }

    /// Text after `FROM`.
    pub fn render(&self) -> String {
        let mut out = self.base.clone();
        for step in &self.steps {
            match &step.kind {
                JoinKind::Inner { condition } => {
                    out.push_str(&format!(" INNER JOIN {} ON {}", step.table, condition))
                }
                JoinKind::Cross => out.push_str(&format!(" CROSS JOIN {}", step.table)),
            }
        }
        out
    }
}

/// Grow a join tree from `tables[0]`.
///
/// Each round adds the first remaining table directly related to a joined
/// one. When none is, the shortest bridge through other tables is searched
/// breadth-first; a table nothing reaches is cross joined.
pub fn plan_joins(tables: &[String], relationships: &[Relationship]) -> Option<JoinPlan> {
    let (base, rest) = tables.split_first()?;
    let mut plan = JoinPlan {
        base: base.clone(),
        steps: Vec::new(),
    };
    let mut joined: Vec<String> = vec![base.clone()];
    let mut remaining: Vec<String> = rest.iter().filter(|t| *t != base).cloned().unique().collect();

    while !remaining.is_empty() {
        let direct = remaining.iter().enumerate().find_map(|(i, table)| {
            relationships
                .iter()
                .find(|r| joined.iter().any(|j| r.links(j, table)))
                .map(|r| (i, r))
        });
        if let Some((i, relationship)) = direct {
            let table = remaining.remove(i);
            debug!("Joining {} on {}", table, relationship.condition());
            joined.push(table.clone());
            plan.steps.push(JoinStep {
                table,
                kind: JoinKind::Inner {
                    condition: relationship.condition(),
                },
            });
            continue;
        }

        let bridge = remaining
            .iter()
            .enumerate()
            .find_map(|(i, table)| shortest_bridge(&joined, table, relationships).map(|path| (i, path)));
        if let Some((i, path)) = bridge {
            remaining.remove(i);
            for (table, relationship) in path {
                debug!("Bridging through {} on {}", table, relationship.condition());
                joined.push(table.clone());
                remaining.retain(|t| t != &table);
                plan.steps.push(JoinStep {
                    table,
                    kind: JoinKind::Inner {
                        condition: relationship.condition(),
                    },
                });
            }
            continue;
        }

        let table = remaining.remove(0);
        warn!("No relationship reaches {}; falling back to CROSS JOIN", table);
        joined.push(table.clone());
        plan.steps.push(JoinStep {
            table,
            kind: JoinKind::Cross,
        });
    }

    Some(plan)
}

/// Shortest chain of relationships from any joined table to `target`, as the
/// tables to add in order with the relationship that adds each.
fn shortest_bridge<'r>(
    joined: &[String],
    target: &str,
    relationships: &'r [Relationship],
) -> Option<Vec<(String, &'r Relationship)>> {
    let mut queue: VecDeque<(String, Vec<(String, &'r Relationship)>)> =
        joined.iter().map(|t| (t.clone(), Vec::new())).collect();
    let mut seen: HashSet<String> = joined.iter().cloned().collect();

    while let Some((current, path)) = queue.pop_front() {
        for relationship in relationships {
            let next = if relationship.parent_table == current {
                &relationship.child_table
            } else if relationship.child_table == current {
                &relationship.parent_table
            } else {
                continue;
            };
            if seen.contains(next) {
                continue;
            }
            let mut extended = path.clone();
            extended.push((next.clone(), relationship));
            if next == target {
                return Some(extended);
            }
            seen.insert(next.clone());
            queue.push_back((next.clone(), extended));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rel(parent: &str, parent_column: &str, child: &str, child_column: &str) -> Relationship {
        Relationship {
            parent_table: parent.to_string(),
            parent_column: parent_column.to_string(),
            child_table: child.to_string(),
            child_column: child_column.to_string(),
        }
    }

    fn names(tables: &[&str]) -> Vec<String> {
        tables.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_single_table() {
        let plan = plan_joins(&names(&["Clients"]), &[]).unwrap();
        assert_eq!(plan.render(), "Clients");
        assert!(!plan.has_cross_join());
    }

    #[test]
    fn test_direct_join_either_direction() {
        let relationships = vec![rel("Clients", "client_id", "Orders", "client_id")];
        let plan = plan_joins(&names(&["Orders", "Clients"]), &relationships).unwrap();
        assert_eq!(
            plan.render(),
            "Orders INNER JOIN Clients ON Orders.client_id = Clients.client_id"
        );
    }

    #[test]
    fn test_bridge_through_intermediate_table() {
        let relationships = vec![
            rel("Clients", "client_id", "Orders", "client_id"),
            rel("Orders", "order_id", "OrderItems", "order_id"),
        ];
        let plan = plan_joins(&names(&["Clients", "OrderItems"]), &relationships).unwrap();
        assert_eq!(plan.tables(), vec!["Clients", "Orders", "OrderItems"]);
        assert!(!plan.has_cross_join());
        assert!(plan.render().contains("INNER JOIN Orders ON Orders.client_id = Clients.client_id"));
        assert!(plan.render().contains("INNER JOIN OrderItems ON OrderItems.order_id = Orders.order_id"));
    }

    #[test]
    fn test_cross_join_when_unrelated() {
        let plan = plan_joins(&names(&["Clients", "Regions"]), &[]).unwrap();
        assert!(plan.has_cross_join());
        assert_eq!(plan.render(), "Clients CROSS JOIN Regions");
    }

    #[test]
    fn test_empty_input() {
        assert!(plan_joins(&[], &[]).is_none());
    }
}
