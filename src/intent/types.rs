use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    #[default]
    Select,
    Insert,
    Update,
    Delete,
}

impl Operation {
    /// Lenient parse of model output ("SELECT", "read", "remove" ...).
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_lowercase().as_str() {
            "select" | "read" | "query" | "show" | "get" => Some(Operation::Select),
            "insert" | "add" | "create" => Some(Operation::Insert),
            "update" | "modify" | "change" => Some(Operation::Update),
            "delete" | "remove" => Some(Operation::Delete),
            _ => None,
        }
    }

    pub fn is_mutation(&self) -> bool {
        !matches!(self, Operation::Select)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Select => "SELECT",
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunction {
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_lowercase().as_str() {
            "count" => Some(AggregateFunction::Count),
            "sum" | "total" => Some(AggregateFunction::Sum),
            "avg" | "average" | "mean" => Some(AggregateFunction::Avg),
            "min" | "minimum" => Some(AggregateFunction::Min),
            "max" | "maximum" => Some(AggregateFunction::Max),
            _ => None,
        }
    }

    /// COUNT applies to any column; the others need numbers.
    pub fn requires_numeric(&self) -> bool {
        !matches!(self, AggregateFunction::Count)
    }

    pub fn sql_name(&self) -> &'static str {
        match self {
            AggregateFunction::Count => "COUNT",
            AggregateFunction::Sum => "SUM",
            AggregateFunction::Avg => "AVG",
            AggregateFunction::Min => "MIN",
            AggregateFunction::Max => "MAX",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn parse(text: &str) -> Self {
        let lower = text.trim().to_lowercase();
        if lower.starts_with("desc") {
            SortDirection::Desc
        } else {
            SortDirection::Asc
        }
    }

    pub fn sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderSpec {
    pub column: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl OrderSpec {
    pub fn new(column: impl Into<String>, direction: SortDirection) -> Self {
        Self {
            column: column.into(),
            direction,
        }
    }
}

/// Structured reading of one natural-language request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntentInfo {
    pub operation: Operation,
    pub tables: Vec<String>,
    pub columns: Vec<String>,
    /// Condition text such as `city = 'Paris'`, `age > 30` or a bare boolean
    /// term like `active`. See [`FilterCondition::parse`].
    pub filters: Vec<String>,
    pub requires_aggregation: bool,
    pub aggregation_type: Option<AggregateFunction>,
    pub group_by: Vec<String>,
    pub order_by: Vec<OrderSpec>,
    pub limit: Option<u64>,
    /// Query words that name a table or one of its aliases.
    pub entity_hints: Vec<String>,
}

impl IntentInfo {
    pub fn has_filters(&self) -> bool {
        !self.filters.is_empty()
    }

    pub fn has_grouping(&self) -> bool {
        !self.group_by.is_empty()
    }

    pub fn has_ordering(&self) -> bool {
        !self.order_by.is_empty()
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    /// Parsed filters; unparseable text is skipped.
    pub fn filter_conditions(&self) -> Vec<FilterCondition> {
        self.filters.iter().filter_map(|f| FilterCondition::parse(f)).collect()
    }

    /// Every name the resolver has to map, in request order without
    /// duplicates: columns, filter columns, grouping, then ordering.
    pub fn requested_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        let candidates = self
            .columns
            .iter()
            .cloned()
            .chain(self.filter_conditions().into_iter().map(|f| f.column))
            .chain(self.group_by.iter().cloned())
            .chain(self.order_by.iter().map(|o| o.column.clone()));
        for name in candidates {
            let name = name.trim().to_string();
            if !name.is_empty() && !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    /// Keep `requires_aggregation` consistent with `aggregation_type`.
    pub fn normalize(&mut self) {
        if self.requires_aggregation && self.aggregation_type.is_none() {
            self.aggregation_type = Some(AggregateFunction::Count);
        }
        self.requires_aggregation = self.aggregation_type.is_some();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    Eq,
    NotEq,
    Gt,
    Lt,
    GtEq,
    LtEq,
    Like,
    NotLike,
    IsNull,
    IsNotNull,
    IsTrue,
    IsFalse,
}

impl FilterOp {
    fn parse(text: &str) -> Option<Self> {
        let op = match text.to_uppercase().split_whitespace().collect::<Vec<_>>().join(" ").as_str() {
            "=" | "==" => FilterOp::Eq,
            "!=" | "<>" => FilterOp::NotEq,
            ">" => FilterOp::Gt,
            "<" => FilterOp::Lt,
            ">=" => FilterOp::GtEq,
            "<=" => FilterOp::LtEq,
            "LIKE" => FilterOp::Like,
            "NOT LIKE" => FilterOp::NotLike,
            "IS NULL" => FilterOp::IsNull,
            "IS NOT NULL" => FilterOp::IsNotNull,
            _ => return None,
        };
        Some(op)
    }

    pub fn sql(&self) -> &'static str {
        match self {
            FilterOp::Eq | FilterOp::IsTrue | FilterOp::IsFalse => "=",
            FilterOp::NotEq => "!=",
            FilterOp::Gt => ">",
            FilterOp::Lt => "<",
            FilterOp::GtEq => ">=",
            FilterOp::LtEq => "<=",
            FilterOp::Like => "LIKE",
            FilterOp::NotLike => "NOT LIKE",
            FilterOp::IsNull => "IS NULL",
            FilterOp::IsNotNull => "IS NOT NULL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FilterValue {
    Number(String),
    Text(String),
    Bool(bool),
}

impl FilterValue {
    fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim().trim_end_matches(';').trim();
        if raw.is_empty() {
            return None;
        }
        for quote in ['\'', '"'] {
            if raw.len() >= 2 && raw.starts_with(quote) && raw.ends_with(quote) {
                let inner = &raw[1..raw.len() - 1];
                return Some(FilterValue::Text(inner.replace("''", "'")));
            }
        }
        match raw.to_lowercase().as_str() {
            "true" | "yes" => return Some(FilterValue::Bool(true)),
            "false" | "no" => return Some(FilterValue::Bool(false)),
            _ => {}
        }
        if raw.parse::<f64>().is_ok() {
            Some(FilterValue::Number(raw.to_string()))
        } else {
            Some(FilterValue::Text(raw.to_string()))
        }
    }
}

lazy_static! {
    static ref CONDITION: Regex = Regex::new(
        r#"(?i)^\s*([A-Za-z_\[\]"][\w.\[\]" ]*?)\s*(>=|<=|!=|<>|==|=|>|<|\bnot\s+like\b|\blike\b|\bis\s+not\s+null\b|\bis\s+null\b)\s*(.*?)\s*$"#
    )
    .unwrap();
    static ref BARE_TERM: Regex = Regex::new(r"(?i)^\s*(not\s+)?([A-Za-z_][\w ]*?)\s*$").unwrap();
}

/// One parsed filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCondition {
    /// Requested column name as written, possibly `table.column`.
    pub column: String,
    pub op: FilterOp,
    pub value: Option<FilterValue>,
}

impl FilterCondition {
    pub fn parse(text: &str) -> Option<Self> {
        if let Some(caps) = CONDITION.captures(text) {
            let column = clean_identifier(&caps[1]);
            let op = FilterOp::parse(&caps[2])?;
            let value = match op {
                FilterOp::IsNull | FilterOp::IsNotNull => None,
                _ => Some(FilterValue::parse(&caps[3])?),
            };
            if column.is_empty() {
                return None;
            }
            return Some(Self { column, op, value });
        }

        let caps = BARE_TERM.captures(text)?;
        let column = clean_identifier(&caps[2]);
        if column.is_empty() {
            return None;
        }
        Some(Self {
            column,
            op: if caps.get(1).is_some() { FilterOp::IsFalse } else { FilterOp::IsTrue },
            value: None,
        })
    }
}

fn clean_identifier(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| !matches!(c, '[' | ']' | '"'))
        .collect::<String>()
        .trim()
        .to_string()
}

/// One prior exchange, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: String,
    pub content: String,
}

impl ConversationTurn {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}
