//! Alias derivation for tables and columns
//!
//! Aliases let the resolver and the intent keyword pass match the words people
//! use ("orders", "creation date") against real identifiers (`Order`,
//! `created_at`).

use crate::schema::types::{Relationship, TableDef};
use itertools::Itertools;
use std::collections::HashSet;

/// Irregular stems for `<verb>_at` / `<verb>_on` columns.
const VERB_NOUNS: [(&str, &str); 8] = [
    ("created", "creation"),
    ("updated", "update"),
    ("modified", "modification"),
    ("deleted", "deletion"),
    ("inserted", "insertion"),
    ("registered", "registration"),
    ("shipped", "shipment"),
    ("paid", "payment"),
];

/// Singular and plural variants of a word, lowercased.
pub fn plural_variants(word: &str) -> Vec<String> {
    let lower = word.to_lowercase();
    let mut variants = vec![lower.clone()];

    if let Some(stem) = lower.strip_suffix("ies") {
        variants.push(format!("{}y", stem));
    } else if lower.ends_with("sses") || lower.ends_with("xes") || lower.ends_with("ches") || lower.ends_with("shes") {
        variants.push(lower[..lower.len() - 2].to_string());
    } else if lower.ends_with("ss") {
        variants.push(format!("{}es", lower));
    } else if let Some(stem) = lower.strip_suffix('s') {
        variants.push(stem.to_string());
    } else if lower.ends_with('y') && !ends_with_vowel_y(&lower) {
        variants.push(format!("{}ies", &lower[..lower.len() - 1]));
    } else if lower.ends_with('x') || lower.ends_with("ch") || lower.ends_with("sh") {
        variants.push(format!("{}es", lower));
    } else {
        variants.push(format!("{}s", lower));
    }

    variants.into_iter().unique().collect()
}

fn ends_with_vowel_y(word: &str) -> bool {
    let chars: Vec<char> = word.chars().collect();
    chars.len() >= 2 && matches!(chars[chars.len() - 2], 'a' | 'e' | 'i' | 'o' | 'u')
}

/// Singular form, used for `<table>_id` relationship inference.
pub fn singular(word: &str) -> String {
    let lower = word.to_lowercase();
    if let Some(stem) = lower.strip_suffix("ies") {
        format!("{}y", stem)
    } else if lower.ends_with("sses") || lower.ends_with("xes") || lower.ends_with("ches") || lower.ends_with("shes") {
        lower[..lower.len() - 2].to_string()
    } else if lower.ends_with('s') && !lower.ends_with("ss") {
        lower[..lower.len() - 1].to_string()
    } else {
        lower
    }
}

/// Split `CustomerOrders`, `customer_orders` or `customer-orders` into words.
pub fn split_words(identifier: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for ch in identifier.chars() {
        if ch == '_' || ch == '-' || ch == ' ' || ch == '.' {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if ch.is_uppercase() && prev_lower && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
        current.extend(ch.to_lowercase());
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

pub fn table_aliases(name: &str) -> Vec<String> {
    let words = split_words(name);
    let mut aliases = plural_variants(name);
    if words.len() > 1 {
        let spaced = words.join(" ");
        aliases.extend(plural_variants(&spaced));
        aliases.extend(plural_variants(&words.join("_")));
    }
    aliases
        .into_iter()
        .filter(|a| a != name)
        .unique()
        .collect()
}

pub fn column_aliases(name: &str) -> Vec<String> {
    let words = split_words(name);
    let mut aliases: Vec<String> = Vec::new();
    if words.is_empty() {
        return aliases;
    }

    aliases.push(words.join(" "));
    aliases.push(words.join("_"));

    let last = words.last().map(String::as_str).unwrap_or_default();
    let stem = &words[..words.len() - 1];
    let stem_text = stem.join(" ");

    match last {
        "at" | "on" if !stem.is_empty() => {
            let noun = VERB_NOUNS
                .iter()
                .find(|(verb, _)| stem.last().map(|s| s == verb).unwrap_or(false))
                .map(|(_, noun)| noun.to_string());
            match noun {
                Some(noun) => {
                    let prefix = stem[..stem.len() - 1].join(" ");
                    let phrase = if prefix.is_empty() { noun } else { format!("{} {}", prefix, noun) };
                    aliases.push(format!("{} date", phrase));
                    aliases.push(format!("{} time", phrase));
                }
                None => aliases.push(format!("{} date", stem_text)),
            }
            aliases.push(stem_text.clone());
        }
        "id" if !stem.is_empty() => {
            aliases.push(stem_text.clone());
            aliases.push(format!("{} number", stem_text));
        }
        "name" | "date" | "amount" if !stem.is_empty() => {
            aliases.push(stem_text.clone());
        }
        "count" if !stem.is_empty() => {
            let plural = plural_variants(&stem_text)
                .into_iter()
                .find(|v| v != &stem_text)
                .unwrap_or_else(|| stem_text.clone());
            aliases.push(format!("number of {}", plural));
            aliases.push(stem_text.clone());
        }
        "no" | "num" | "nbr" if !stem.is_empty() => {
            aliases.push(format!("{} number", stem_text));
        }
        "dob" => aliases.push("date of birth".to_string()),
        _ => {}
    }

    if let Some(first) = words.first() {
        if (first == "is" || first == "has") && words.len() > 1 {
            aliases.push(words[1..].join(" "));
        }
    }

    aliases
        .into_iter()
        .filter(|a| !a.is_empty() && a != name)
        .unique()
        .collect()
}

/// Populate table and column aliases in place. Runs before a snapshot is
/// frozen behind an `Arc`.
pub fn derive_aliases(tables: &mut [TableDef]) {
    for table in tables.iter_mut() {
        let mut aliases = table.aliases.clone();
        aliases.extend(table_aliases(&table.name));
        table.aliases = aliases.into_iter().unique().collect();

        for column in table.columns.iter_mut() {
            let mut aliases = column.aliases.clone();
            aliases.extend(column_aliases(&column.name));
            column.aliases = aliases.into_iter().unique().collect();
        }
    }
}

/// Infer parent/child links from naming conventions when the catalog declares
/// none for a pair of tables: a child column equal to the parent's primary key
/// name (when that name ends in `id`), or named `<parent_singular>_id`.
pub fn infer_relationships(tables: &[TableDef], declared: &[Relationship]) -> Vec<Relationship> {
    let mut inferred = Vec::new();
    let mut seen: HashSet<(String, String)> = declared
        .iter()
        .map(|r| (r.parent_table.clone(), r.child_table.clone()))
        .collect();

    for parent in tables {
        let Some(pk) = parent.primary_keys().next() else {
            continue;
        };
        let pk_lower = pk.name.to_lowercase();
        let conventional = format!("{}_id", singular(&parent.name));

        for child in tables {
            if child.name == parent.name || seen.contains(&(parent.name.clone(), child.name.clone())) {
                continue;
            }
            let matched = child.columns.iter().find(|c| {
                let lower = c.name.to_lowercase();
                (lower == pk_lower && pk_lower.ends_with("id") && pk_lower != "id" && !c.is_primary_key)
                    || lower == conventional
            });
            if let Some(column) = matched {
                seen.insert((parent.name.clone(), child.name.clone()));
                inferred.push(Relationship {
                    parent_table: parent.name.clone(),
                    parent_column: pk.name.clone(),
                    child_table: child.name.clone(),
                    child_column: column.name.clone(),
                });
            }
        }
    }
    inferred
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::types::ColumnDef;

    #[test]
    fn test_plural_variants() {
        assert_eq!(plural_variants("order"), vec!["order", "orders"]);
        assert_eq!(plural_variants("orders"), vec!["orders", "order"]);
        assert_eq!(plural_variants("category"), vec!["category", "categories"]);
        assert_eq!(plural_variants("categories"), vec!["categories", "category"]);
        assert_eq!(plural_variants("box"), vec!["box", "boxes"]);
        assert_eq!(plural_variants("address"), vec!["address", "addresses"]);
        assert_eq!(plural_variants("day"), vec!["day", "days"]);
    }

    #[test]
    fn test_split_words() {
        assert_eq!(split_words("CustomerOrders"), vec!["customer", "orders"]);
        assert_eq!(split_words("created_at"), vec!["created", "at"]);
        assert_eq!(split_words("first name"), vec!["first", "name"]);
    }

    #[test]
    fn test_column_suffix_aliases() {
        let created = column_aliases("created_at");
        assert!(created.contains(&"creation date".to_string()));
        assert!(created.contains(&"created at".to_string()));

        let customer = column_aliases("customer_id");
        assert!(customer.contains(&"customer".to_string()));
        assert!(customer.contains(&"customer id".to_string()));

        let active = column_aliases("is_active");
        assert!(active.contains(&"active".to_string()));

        let orders = column_aliases("order_count");
        assert!(orders.contains(&"number of orders".to_string()));
    }

    #[test]
    fn test_table_aliases_exclude_original() {
        let aliases = table_aliases("Clients");
        assert!(aliases.contains(&"clients".to_string()));
        assert!(aliases.contains(&"client".to_string()));
        assert!(!aliases.contains(&"Clients".to_string()));
    }

    #[test]
    fn test_infer_relationships_by_convention() {
        let clients = TableDef::new(
            "Clients",
            vec![ColumnDef::new("client_id", "int").primary_key(), ColumnDef::new("email", "varchar")],
        );
        let orders = TableDef::new(
            "Orders",
            vec![
                ColumnDef::new("order_id", "int").primary_key(),
                ColumnDef::new("client_id", "int"),
                ColumnDef::new("total", "decimal"),
            ],
        );
        let inferred = infer_relationships(&[clients, orders], &[]);
        assert_eq!(inferred.len(), 1);
        assert_eq!(inferred[0].parent_table, "Clients");
        assert_eq!(inferred[0].child_table, "Orders");
        assert_eq!(inferred[0].child_column, "client_id");
    }

    #[test]
    fn test_declared_relationships_not_duplicated() {
        let clients = TableDef::new("Clients", vec![ColumnDef::new("client_id", "int").primary_key()]);
        let orders = TableDef::new("Orders", vec![ColumnDef::new("client_id", "int")]);
        let declared = vec![Relationship {
            parent_table: "Clients".to_string(),
            parent_column: "client_id".to_string(),
            child_table: "Orders".to_string(),
            child_column: "client_id".to_string(),
        }];
        assert!(infer_relationships(&[clients, orders], &declared).is_empty());
    }
}
