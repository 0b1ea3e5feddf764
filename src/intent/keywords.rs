//! Deterministic keyword pass
//!
//! Reads operation, aggregation, filters, grouping, ordering and limits from
//! the wording of the request. Never fills `tables`: table choice is left to
//! the model pass or the resolver's inference.

use crate::intent::types::{AggregateFunction, IntentInfo, Operation, OrderSpec, SortDirection};
use crate::schema::SchemaSnapshot;
use lazy_static::lazy_static;
use regex::Regex;
use std::ops::Range;

lazy_static! {
    static ref WORD: Regex = Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").unwrap();
    static ref EQUALS_FILTER: Regex = Regex::new(
        r#"(?i)\b(?:where|whose|with)\s+([a-z_]\w*)\s+(?:is|=|equals?|equal\s+to)\s+(not\s+)?('(?:[^']|'')*'|"[^"]*"|[\w.@-]+)"#
    )
    .unwrap();
    static ref COMPARE_FILTER: Regex = Regex::new(
        r"(?i)\b([a-z_]\w*)\s+(?:is\s+)?(greater\s+than|more\s+than|above|over|less\s+than|fewer\s+than|below|under|at\s+least|at\s+most|>=|<=|>|<)\s+(-?\d+(?:\.\d+)?)"
    )
    .unwrap();
    static ref TEXT_FILTER: Regex = Regex::new(
        r#"(?i)\b([a-z_]\w*)\s+(containing|contains|like|starting\s+with|starts\s+with|ending\s+with|ends\s+with)\s+('(?:[^']|'')*'|"[^"]*"|[\w.@-]+)"#
    )
    .unwrap();
    static ref STATE_FILTER: Regex =
        Regex::new(r"(?i)\b(?:that|who|which)\s+(?:are|is)\s+(not\s+)?([a-z_]\w*)").unwrap();
    static ref ORDER: Regex = Regex::new(
        r"(?i)\b(?:sort(?:ed)?|order(?:ed)?)\s+by\s+([a-z_]\w*)(?:\s+(asc(?:ending)?|desc(?:ending)?))?"
    )
    .unwrap();
    static ref TOP_BY: Regex = Regex::new(r"(?i)\btop\s+\d+\b[\w\s]*?\bby\s+([a-z_]\w*)").unwrap();
    static ref GROUP: Regex =
        Regex::new(r"(?i)\b(group(?:ed)?\s+by|per|for\s+each|by)\s+([a-z_]\w*)").unwrap();
    static ref LIMIT: Regex = Regex::new(r"(?i)\b(?:top|first|limit)\s+(\d+)\b").unwrap();
}

const OPERATION_WORDS: [(&str, Operation); 20] = [
    ("show", Operation::Select),
    ("get", Operation::Select),
    ("find", Operation::Select),
    ("list", Operation::Select),
    ("display", Operation::Select),
    ("what", Operation::Select),
    ("which", Operation::Select),
    ("how many", Operation::Select),
    ("give", Operation::Select),
    ("fetch", Operation::Select),
    ("add", Operation::Insert),
    ("insert", Operation::Insert),
    ("create", Operation::Insert),
    ("update", Operation::Update),
    ("change", Operation::Update),
    ("modify", Operation::Update),
    ("set", Operation::Update),
    ("delete", Operation::Delete),
    ("remove", Operation::Delete),
    ("select", Operation::Select),
];

const AGGREGATION_WORDS: [(&str, AggregateFunction); 16] = [
    ("how many", AggregateFunction::Count),
    ("number of", AggregateFunction::Count),
    ("count", AggregateFunction::Count),
    ("total", AggregateFunction::Sum),
    ("sum", AggregateFunction::Sum),
    ("average", AggregateFunction::Avg),
    ("avg", AggregateFunction::Avg),
    ("mean", AggregateFunction::Avg),
    ("maximum", AggregateFunction::Max),
    ("highest", AggregateFunction::Max),
    ("max", AggregateFunction::Max),
    ("most", AggregateFunction::Max),
    ("minimum", AggregateFunction::Min),
    ("lowest", AggregateFunction::Min),
    ("min", AggregateFunction::Min),
    ("least", AggregateFunction::Min),
];

/// Words that the filter patterns may capture but never name a column.
const NOT_A_COLUMN: [&str; 24] = [
    "with", "that", "who", "which", "are", "is", "of", "and", "or", "where", "have", "has",
    "having", "the", "a", "an", "in", "from", "at", "on", "located", "based", "not", "all",
];

/// Lowercased words of the request padded with spaces, so phrases can be
/// matched on word boundaries with a plain `find`.
struct Words {
    padded: String,
}

impl Words {
    fn new(text: &str) -> Self {
        let words: Vec<String> = WORD.find_iter(text).map(|m| m.as_str().to_lowercase()).collect();
        Self {
            padded: format!(" {} ", words.join(" ")),
        }
    }

    fn position(&self, phrase: &str) -> Option<usize> {
        let phrase = phrase.trim().to_lowercase();
        if phrase.is_empty() {
            return None;
        }
        self.padded.find(&format!(" {} ", phrase))
    }

    fn without(&self, phrases: &[&str]) -> Self {
        let mut padded = self.padded.clone();
        for phrase in phrases {
            padded = padded.replace(&format!(" {} ", phrase), " ");
        }
        Self { padded }
    }
}

pub fn keyword_intent(query: &str, schema: &SchemaSnapshot) -> IntentInfo {
    let words = Words::new(query);
    let mut intent = IntentInfo {
        operation: detect_operation(&words),
        ..Default::default()
    };

    intent.entity_hints = entity_hints(&words, schema);
    intent.aggregation_type = detect_aggregation(&words, schema);
    intent.filters = detect_filters(query);

    let order_spans = detect_ordering(query, &words, schema, &intent.entity_hints, &mut intent.order_by);
    intent.group_by = detect_grouping(query, intent.aggregation_type.is_some(), &order_spans);
    intent.limit = LIMIT.captures(query).and_then(|c| c[1].parse().ok());

    let claimed: Vec<String> = intent
        .filter_conditions()
        .into_iter()
        .map(|f| f.column.to_lowercase())
        .chain(intent.group_by.iter().map(|g| g.to_lowercase()))
        .chain(intent.order_by.iter().map(|o| o.column.to_lowercase()))
        .collect();
    intent.columns = mentioned_columns(&words, schema, &claimed);

    intent.normalize();
    intent
}

fn earliest<T: Copy>(words: &Words, table: &[(&str, T)]) -> Option<T> {
    table
        .iter()
        .filter_map(|(phrase, value)| words.position(phrase).map(|pos| (pos, *value)))
        .min_by_key(|(pos, _)| *pos)
        .map(|(_, value)| value)
}

fn detect_operation(words: &Words) -> Operation {
    earliest(words, &OPERATION_WORDS).unwrap_or_default()
}

fn detect_aggregation(words: &Words, schema: &SchemaSnapshot) -> Option<AggregateFunction> {
    let words = words.without(&["most recent", "at least", "at most"]);
    let is_column = |phrase: &str| {
        schema
            .tables
            .values()
            .any(|t| t.columns.iter().any(|c| c.name.eq_ignore_ascii_case(phrase)))
    };
    AGGREGATION_WORDS
        .iter()
        .filter(|(phrase, _)| !is_column(phrase))
        .filter_map(|(phrase, function)| words.position(phrase).map(|pos| (pos, *function)))
        .min_by_key(|(pos, _)| *pos)
        .map(|(_, function)| function)
}

fn is_column_word(word: &str) -> bool {
    !NOT_A_COLUMN.contains(&word.to_lowercase().as_str())
}

fn literal(raw: &str) -> String {
    let raw = raw.trim();
    if raw.starts_with('\'') || raw.parse::<f64>().is_ok() {
        return raw.to_string();
    }
    let unquoted = raw.trim_matches('"');
    format!("'{}'", unquoted.replace('\'', "''"))
}

fn unquote(raw: &str) -> String {
    raw.trim().trim_matches(|c| c == '\'' || c == '"').to_string()
}

fn detect_filters(query: &str) -> Vec<String> {
    let mut filters: Vec<String> = Vec::new();
    let mut push = |filter: String| {
        if !filters.contains(&filter) {
            filters.push(filter);
        }
    };

    for caps in EQUALS_FILTER.captures_iter(query) {
        let column = &caps[1];
        if !is_column_word(column) {
            continue;
        }
        let op = if caps.get(2).is_some() { "!=" } else { "=" };
        push(format!("{} {} {}", column, op, literal(&caps[3])));
    }

    for caps in COMPARE_FILTER.captures_iter(query) {
        let column = &caps[1];
        if !is_column_word(column) {
            continue;
        }
        let phrase = caps[2].to_lowercase();
        let phrase = phrase.split_whitespace().collect::<Vec<_>>().join(" ");
        let op = match phrase.as_str() {
            "greater than" | "more than" | "above" | "over" | ">" => ">",
            "less than" | "fewer than" | "below" | "under" | "<" => "<",
            "at least" | ">=" => ">=",
            _ => "<=",
        };
        push(format!("{} {} {}", column, op, &caps[3]));
    }

    for caps in TEXT_FILTER.captures_iter(query) {
        let column = &caps[1];
        if !is_column_word(column) {
            continue;
        }
        let value = unquote(&caps[3]).replace("''", "'").replace('\'', "''");
        let phrase = caps[2].to_lowercase();
        let pattern = if phrase.starts_with("start") {
            format!("{}%", value)
        } else if phrase.starts_with("end") {
            format!("%{}", value)
        } else {
            format!("%{}%", value)
        };
        push(format!("{} LIKE '{}'", column, pattern));
    }

    for caps in STATE_FILTER.captures_iter(query) {
        let term = &caps[2];
        if !is_column_word(term) || term.eq_ignore_ascii_case("than") {
            continue;
        }
        if caps.get(1).is_some() {
            push(format!("not {}", term.to_lowercase()));
        } else {
            push(term.to_lowercase());
        }
    }

    filters
}

fn date_column(schema: &SchemaSnapshot, hints: &[String]) -> Option<String> {
    let hinted = hints.iter().filter_map(|h| schema.find_table(h));
    let mut tables: Vec<_> = hinted.collect();
    tables.extend(schema.tables.values());
    tables.into_iter().find_map(|t| {
        t.columns
            .iter()
            .find(|c| {
                let ty = c.data_type.to_lowercase();
                ty.contains("date") || ty.contains("time")
            })
            .map(|c| c.name.clone())
    })
}

/// Fills `order_by` and returns the byte spans of ordering phrases so the
/// grouping pass can skip their `by`.
fn detect_ordering(
    query: &str,
    words: &Words,
    schema: &SchemaSnapshot,
    hints: &[String],
    order_by: &mut Vec<OrderSpec>,
) -> Vec<Range<usize>> {
    let mut spans = Vec::new();

    for caps in ORDER.captures_iter(query) {
        if let Some(m) = caps.get(0) {
            spans.push(m.range());
        }
        let direction = caps
            .get(2)
            .map(|d| SortDirection::parse(d.as_str()))
            .unwrap_or_default();
        order_by.push(OrderSpec::new(&caps[1], direction));
    }

    for caps in TOP_BY.captures_iter(query) {
        if let Some(m) = caps.get(0) {
            spans.push(m.range());
        }
        if !order_by.iter().any(|o| o.column.eq_ignore_ascii_case(&caps[1])) {
            order_by.push(OrderSpec::new(&caps[1], SortDirection::Desc));
        }
    }

    if order_by.is_empty() {
        let newest = ["latest", "newest", "most recent", "recent"]
            .iter()
            .any(|p| words.position(p).is_some());
        let oldest = ["oldest", "earliest"].iter().any(|p| words.position(p).is_some());
        if newest || oldest {
            if let Some(column) = date_column(schema, hints) {
                let direction = if newest { SortDirection::Desc } else { SortDirection::Asc };
                order_by.push(OrderSpec::new(column, direction));
            }
        }
    }

    spans
}

fn detect_grouping(query: &str, aggregated: bool, skip: &[Range<usize>]) -> Vec<String> {
    let mut group_by: Vec<String> = Vec::new();
    for caps in GROUP.captures_iter(query) {
        let Some(whole) = caps.get(0) else { continue };
        if skip.iter().any(|s| s.start <= whole.start() && whole.start() < s.end) {
            continue;
        }
        let marker = caps[1].to_lowercase();
        if marker == "by" && !aggregated {
            continue;
        }
        let column = caps[2].to_string();
        if is_column_word(&column) && !group_by.contains(&column) {
            group_by.push(column);
        }
    }
    group_by
}

fn entity_hints(words: &Words, schema: &SchemaSnapshot) -> Vec<String> {
    let mut found: Vec<(usize, String)> = Vec::new();
    for table in schema.tables.values() {
        let candidates = std::iter::once(table.name.to_lowercase()).chain(table.aliases.iter().map(|a| a.to_lowercase()));
        let hit = candidates
            .filter_map(|c| words.position(&c).map(|pos| (pos, c)))
            .min_by_key(|(pos, _)| *pos);
        if let Some(hit) = hit {
            found.push(hit);
        }
    }
    found.sort();
    found.into_iter().map(|(_, word)| word).collect()
}

fn mentioned_columns(words: &Words, schema: &SchemaSnapshot, claimed: &[String]) -> Vec<String> {
    let entity_words: Vec<String> = schema
        .tables
        .values()
        .flat_map(|t| std::iter::once(t.name.to_lowercase()).chain(t.aliases.iter().map(|a| a.to_lowercase())))
        .collect();

    let mut found: Vec<(usize, String)> = Vec::new();
    for table in schema.tables.values() {
        for column in &table.columns {
            let phrases: Vec<String> = std::iter::once(column.name.to_lowercase())
                .chain(column.aliases.iter().map(|a| a.to_lowercase()))
                .filter(|p| !entity_words.contains(p) && is_column_word(p))
                .collect();
            if phrases.iter().any(|p| claimed.contains(p)) {
                continue;
            }
            let hit = phrases.iter().filter_map(|p| words.position(p)).min();
            if let Some(pos) = hit {
                if !found.iter().any(|(_, name)| name == &column.name) {
                    found.push((pos, column.name.clone()));
                }
            }
        }
    }
    found.sort();
    found.into_iter().map(|(_, name)| name).collect()
}
