//! Best-effort lexical view of a SQL statement
//!
//! This is not a parser. It tokenizes with `sqlparser`, finds the top-level
//! clauses and pulls out the pieces the pipeline needs: referenced tables, the
//! projection, simple AND-joined predicates, ORDER BY terms and row caps.
//! Statements it cannot read are still tokenized and can be rendered back
//! unchanged.

use crate::db::SqlDialect;
use crate::error::{QueryError, Result};
use sqlparser::tokenizer::{Token, Tokenizer};
use std::ops::Range;

#[derive(Debug, Clone, PartialEq)]
pub enum Lexeme {
    Word { value: String, quote: Option<char> },
    Number(String),
    Str(String),
    Symbol(String),
    Whitespace(String),
}

impl Lexeme {
    fn from_token(token: Token) -> Option<Self> {
        let lexeme = match token {
            Token::EOF => return None,
            Token::Word(word) => Lexeme::Word {
                value: word.value,
                quote: word.quote_style,
            },
            Token::Number(number, _) => Lexeme::Number(number),
            Token::SingleQuotedString(s)
            | Token::NationalStringLiteral(s)
            | Token::EscapedStringLiteral(s) => Lexeme::Str(s),
            Token::Whitespace(ws) => Lexeme::Whitespace(ws.to_string()),
            other => Lexeme::Symbol(other.to_string()),
        };
        Some(lexeme)
    }

    /// Uppercased text of an unquoted word.
    pub fn keyword(&self) -> Option<String> {
        match self {
            Lexeme::Word { value, quote: None } => Some(value.to_uppercase()),
            _ => None,
        }
    }

    pub fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Lexeme::Word { value, quote: None } if value.eq_ignore_ascii_case(keyword))
    }

    pub fn is_symbol(&self, symbol: &str) -> bool {
        matches!(self, Lexeme::Symbol(s) if s == symbol)
    }

    pub fn is_whitespace(&self) -> bool {
        matches!(self, Lexeme::Whitespace(_))
    }

    pub fn word(&self) -> Option<&str> {
        match self {
            Lexeme::Word { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn render(&self) -> String {
        match self {
            Lexeme::Word { value, quote: None } => value.clone(),
            Lexeme::Word { value, quote: Some('[') } => format!("[{}]", value),
            Lexeme::Word { value, quote: Some(q) } => format!("{}{}{}", q, value, q),
            Lexeme::Number(n) => n.clone(),
            Lexeme::Str(s) => quote_literal(s),
            Lexeme::Symbol(s) | Lexeme::Whitespace(s) => s.clone(),
        }
    }
}

pub fn render(lexemes: &[Lexeme]) -> String {
    lexemes.iter().map(Lexeme::render).collect()
}

/// Single-quoted SQL string literal with embedded quotes doubled.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Words that start a clause and therefore can never be an identifier in the
/// position the validator checks.
pub const CLAUSE_KEYWORDS: [&str; 14] = [
    "SELECT", "FROM", "WHERE", "GROUP", "ORDER", "HAVING", "LIMIT", "OFFSET", "UNION", "JOIN",
    "ON", "SET", "VALUES", "INTO",
];

pub fn is_clause_keyword(lexeme: &Lexeme) -> bool {
    lexeme
        .keyword()
        .map(|k| CLAUSE_KEYWORDS.contains(&k.as_str()))
        .unwrap_or(false)
}

pub trait SqlScanner: Send + Sync {
    fn tokenize(&self, sql: &str) -> Result<Vec<Lexeme>>;

    fn scan(&self, sql: &str) -> Result<ScannedStatement> {
        Ok(ScannedStatement::from_lexemes(self.tokenize(sql)?))
    }
}

/// [`SqlScanner`] over the `sqlparser` tokenizer.
#[derive(Debug, Clone, Copy)]
pub struct TokenScanner {
    dialect: SqlDialect,
}

impl TokenScanner {
    pub fn new(dialect: SqlDialect) -> Self {
        Self { dialect }
    }
}

impl Default for TokenScanner {
    fn default() -> Self {
        Self::new(SqlDialect::Generic)
    }
}

impl SqlScanner for TokenScanner {
    fn tokenize(&self, sql: &str) -> Result<Vec<Lexeme>> {
        // Bracketed identifiers only tokenize as words under the MSSQL rules
        let dialect = match self.dialect {
            SqlDialect::Postgres => SqlDialect::Postgres,
            _ => SqlDialect::SqlServer,
        }
        .sqlparser_dialect();
        let tokens = Tokenizer::new(dialect.as_ref(), sql)
            .tokenize()
            .map_err(|e| QueryError::Validation(format!("SQL could not be tokenized: {}", e)))?;
        Ok(tokens.into_iter().filter_map(Lexeme::from_token).collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    With,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Clause {
    Select,
    From,
    Join,
    On,
    Where,
    GroupBy,
    Having,
    OrderBy,
    Limit,
    Offset,
    Set,
    Values,
    Into,
    Update,
    Delete,
    Insert,
    With,
    Union,
    Returning,
}

#[derive(Debug, Clone, Copy)]
struct Boundary {
    clause: Clause,
    /// Position of the clause keyword among significant lexemes.
    pos: usize,
    /// First significant position after the keyword(s).
    body: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableRef {
    /// Unquoted last component of the name.
    pub name: String,
    /// Name as written, including any schema qualifier and quotes.
    pub written: String,
    pub alias: Option<String>,
    /// Index into the lexeme vector of the name's last component.
    lexeme_index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    Like,
    NotLike,
    IsNull,
    IsNotNull,
}

impl CompareOp {
    fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            "=" | "==" => Some(CompareOp::Eq),
            "!=" | "<>" => Some(CompareOp::NotEq),
            "<" => Some(CompareOp::Lt),
            ">" => Some(CompareOp::Gt),
            "<=" => Some(CompareOp::LtEq),
            ">=" => Some(CompareOp::GtEq),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    Placeholder(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub column: String,
    pub op: CompareOp,
    pub value: Literal,
    /// `LOWER(column)` on the left-hand side.
    pub lower_column: bool,
    /// `LOWER('value')` on the right-hand side.
    pub lower_value: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderTerm {
    pub expr: String,
    pub descending: bool,
}

#[derive(Debug, Clone)]
pub struct ScannedStatement {
    lexemes: Vec<Lexeme>,
    pub kind: StatementKind,
    pub distinct: bool,
    pub top: Option<u64>,
    pub projection: Vec<String>,
    pub tables: Vec<TableRef>,
    pub has_join: bool,
    pub has_group_by: bool,
    pub has_subquery: bool,
    pub where_clause: Option<String>,
    /// Present only when the whole WHERE clause is a conjunction of simple
    /// comparisons.
    pub conditions: Option<Vec<Condition>>,
    pub order_by: Vec<OrderTerm>,
    pub limit: Option<u64>,
    /// `qualifier.column` references anywhere in the statement.
    pub qualified_refs: Vec<(String, String)>,
}

impl ScannedStatement {
    pub fn from_lexemes(lexemes: Vec<Lexeme>) -> Self {
        let view = View::new(&lexemes);
        let boundaries = view.boundaries();

        let kind = match view.sig.first().and_then(|&i| lexemes[i].keyword()).as_deref() {
            Some("SELECT") => StatementKind::Select,
            Some("INSERT") => StatementKind::Insert,
            Some("UPDATE") => StatementKind::Update,
            Some("DELETE") => StatementKind::Delete,
            Some("WITH") => StatementKind::With,
            _ => StatementKind::Other,
        };

        let mut statement = ScannedStatement {
            kind,
            distinct: false,
            top: None,
            projection: Vec::new(),
            tables: Vec::new(),
            has_join: boundaries.iter().any(|b| b.clause == Clause::Join),
            has_group_by: boundaries.iter().any(|b| b.clause == Clause::GroupBy),
            has_subquery: view.has_subquery(),
            where_clause: None,
            conditions: None,
            order_by: Vec::new(),
            limit: None,
            qualified_refs: view.qualified_refs(),
            lexemes: Vec::new(),
        };

        for (k, boundary) in boundaries.iter().enumerate() {
            let end = boundaries.get(k + 1).map(|b| b.pos).unwrap_or(view.end);
            let range = boundary.body..end.max(boundary.body);
            match boundary.clause {
                Clause::Select if statement.projection.is_empty() && statement.top.is_none() => {
                    view.read_projection(range, &mut statement);
                }
                Clause::From => {
                    for part in view.split_top_level(range, |l| l.is_symbol(",")) {
                        if let Some(table) = view.table_ref(part) {
                            statement.tables.push(table);
                        }
                    }
                }
                Clause::Join | Clause::Into | Clause::Update => {
                    if let Some(table) = view.table_ref(range) {
                        statement.tables.push(table);
                    }
                }
                Clause::Where if statement.where_clause.is_none() => {
                    let text = view.render(range.clone());
                    if !text.is_empty() {
                        statement.where_clause = Some(text);
                        statement.conditions = view.conditions(range);
                    }
                }
                Clause::OrderBy if statement.order_by.is_empty() => {
                    statement.order_by = view.order_terms(range);
                }
                Clause::Limit if statement.limit.is_none() => {
                    statement.limit = view
                        .sig
                        .get(range.start)
                        .and_then(|&i| match &lexemes[i] {
                            Lexeme::Number(n) => n.parse().ok(),
                            _ => None,
                        });
                }
                _ => {}
            }
        }

        statement.lexemes = lexemes;
        statement
    }

    pub fn render(&self) -> String {
        render(&self.lexemes)
    }

    pub fn lexemes(&self) -> &[Lexeme] {
        &self.lexemes
    }

    /// The one table of a join-free, subquery-free statement.
    pub fn single_table(&self) -> Option<&TableRef> {
        if self.tables.len() == 1 && !self.has_join && !self.has_subquery {
            self.tables.first()
        } else {
            None
        }
    }

    pub fn has_row_cap(&self) -> bool {
        self.top.is_some() || self.limit.is_some()
    }

    /// Statement text with every reference to table `from` spelled `to`.
    pub fn with_table_renamed(&self, from: &str, to: &str) -> String {
        let table_positions: Vec<usize> = self
            .tables
            .iter()
            .filter(|t| t.name == from)
            .map(|t| t.lexeme_index)
            .collect();

        let mut lexemes = self.lexemes.clone();
        for index in 0..lexemes.len() {
            let is_qualifier = lexemes[index].word() == Some(from)
                && next_significant(&lexemes, index).map(|n| lexemes[n].is_symbol(".")).unwrap_or(false);
            if table_positions.contains(&index) || is_qualifier {
                if let Lexeme::Word { value, .. } = &mut lexemes[index] {
                    *value = to.to_string();
                }
            }
        }
        render(&lexemes)
    }

    /// Rewrite `column = 'text'` predicates in the WHERE clause as
    /// `LOWER(column) = LOWER('text')`. `None` when there is nothing to rewrite.
    pub fn with_case_insensitive_equalities(&self) -> Option<String> {
        let view = View::new(&self.lexemes);
        let boundaries = view.boundaries();
        let (k, boundary) = boundaries.iter().enumerate().find(|(_, b)| b.clause == Clause::Where)?;
        let end = boundaries.get(k + 1).map(|b| b.pos).unwrap_or(view.end);

        let mut replacements: Vec<(usize, usize, String)> = Vec::new();
        let mut p = boundary.body;
        while p < end {
            let Some((column_end, column_text)) = view.dotted_name(p, end) else {
                p += 1;
                continue;
            };
            let already_wrapped = p >= 2
                && self.lexemes[view.sig[p - 1]].is_symbol("(")
                && self.lexemes[view.sig[p - 2]].is_keyword("LOWER");
            let eq = column_end;
            let value = column_end + 1;
            if !already_wrapped
                && value < end
                && self.lexemes[view.sig[eq]].is_symbol("=")
            {
                if let Lexeme::Str(text) = &self.lexemes[view.sig[value]] {
                    replacements.push((
                        view.sig[p],
                        view.sig[value],
                        format!("LOWER({}) = LOWER({})", column_text, quote_literal(text)),
                    ));
                    p = value + 1;
                    continue;
                }
            }
            p = column_end;
        }

        if replacements.is_empty() {
            return None;
        }

        let mut out = String::new();
        let mut index = 0;
        for (start, last, text) in replacements {
            out.push_str(&render(&self.lexemes[index..start]));
            out.push_str(&text);
            index = last + 1;
        }
        out.push_str(&render(&self.lexemes[index..]));
        Some(out)
    }
}

fn next_significant(lexemes: &[Lexeme], index: usize) -> Option<usize> {
    (index + 1..lexemes.len()).find(|&i| !lexemes[i].is_whitespace())
}

/// Significant (non-whitespace) positions over a lexeme slice.
struct View<'a> {
    lexemes: &'a [Lexeme],
    sig: Vec<usize>,
    /// Significant length without trailing semicolons.
    end: usize,
}

impl<'a> View<'a> {
    fn new(lexemes: &'a [Lexeme]) -> Self {
        let sig: Vec<usize> = (0..lexemes.len()).filter(|&i| !lexemes[i].is_whitespace()).collect();
        let mut end = sig.len();
        while end > 0 && lexemes[sig[end - 1]].is_symbol(";") {
            end -= 1;
        }
        Self { lexemes, sig, end }
    }

    fn at(&self, p: usize) -> Option<&'a Lexeme> {
        self.sig.get(p).map(|&i| &self.lexemes[i])
    }

    fn render(&self, range: Range<usize>) -> String {
        if range.start >= range.end || range.end > self.sig.len() {
            return String::new();
        }
        render(&self.lexemes[self.sig[range.start]..=self.sig[range.end - 1]])
            .trim()
            .to_string()
    }

    fn boundaries(&self) -> Vec<Boundary> {
        let mut boundaries = Vec::new();
        let mut depth = 0i32;
        let mut p = 0;
        while p < self.end {
            let lexeme = &self.lexemes[self.sig[p]];
            if lexeme.is_symbol("(") {
                depth += 1;
            } else if lexeme.is_symbol(")") {
                depth -= 1;
            } else if depth == 0 {
                if let Some((clause, width)) = self.clause_at(p) {
                    boundaries.push(Boundary {
                        clause,
                        pos: p,
                        body: p + width,
                    });
                    p += width;
                    continue;
                }
            }
            p += 1;
        }
        boundaries
    }

    fn clause_at(&self, p: usize) -> Option<(Clause, usize)> {
        let keyword = self.at(p)?.keyword()?;
        let followed_by = |q: usize, k: &str| self.at(q).map(|l| l.is_keyword(k)).unwrap_or(false);
        let found = match keyword.as_str() {
            "SELECT" => (Clause::Select, 1),
            "FROM" => (Clause::From, 1),
            "WHERE" => (Clause::Where, 1),
            "HAVING" => (Clause::Having, 1),
            "LIMIT" => (Clause::Limit, 1),
            "OFFSET" => (Clause::Offset, 1),
            "UNION" | "EXCEPT" | "INTERSECT" => (Clause::Union, 1),
            "SET" => (Clause::Set, 1),
            "VALUES" => (Clause::Values, 1),
            "INTO" => (Clause::Into, 1),
            "ON" => (Clause::On, 1),
            "RETURNING" => (Clause::Returning, 1),
            "UPDATE" => (Clause::Update, 1),
            "DELETE" => (Clause::Delete, 1),
            "INSERT" => (Clause::Insert, 1),
            "WITH" => (Clause::With, 1),
            "GROUP" if followed_by(p + 1, "BY") => (Clause::GroupBy, 2),
            "ORDER" if followed_by(p + 1, "BY") => (Clause::OrderBy, 2),
            "JOIN" => (Clause::Join, 1),
            "INNER" | "LEFT" | "RIGHT" | "FULL" | "CROSS" | "NATURAL" => {
                let mut q = p + 1;
                while self
                    .at(q)
                    .and_then(|l| l.keyword())
                    .map(|k| matches!(k.as_str(), "OUTER" | "INNER" | "LEFT" | "RIGHT" | "FULL"))
                    .unwrap_or(false)
                {
                    q += 1;
                }
                if followed_by(q, "JOIN") {
                    (Clause::Join, q + 1 - p)
                } else {
                    return None;
                }
            }
            _ => return None,
        };
        Some(found)
    }

    fn has_subquery(&self) -> bool {
        (1..self.end).any(|p| {
            self.at(p).map(|l| l.is_keyword("SELECT")).unwrap_or(false)
                && self.at(p - 1).map(|l| l.is_symbol("(")).unwrap_or(false)
        })
    }

    fn qualified_refs(&self) -> Vec<(String, String)> {
        let mut refs = Vec::new();
        for p in 0..self.end {
            let (Some(qualifier), Some(dot), Some(column)) = (self.at(p), self.at(p + 1), self.at(p + 2)) else {
                continue;
            };
            let continues = self.at(p + 3).map(|l| l.is_symbol(".")).unwrap_or(false);
            let preceded = p > 0 && self.at(p - 1).map(|l| l.is_symbol(".")).unwrap_or(false);
            if continues || preceded || !dot.is_symbol(".") {
                continue;
            }
            if let (Some(q), Some(c)) = (qualifier.word(), column.word()) {
                refs.push((q.to_string(), c.to_string()));
            }
        }
        refs
    }

    fn split_top_level(&self, range: Range<usize>, is_separator: impl Fn(&Lexeme) -> bool) -> Vec<Range<usize>> {
        let mut parts = Vec::new();
        let mut depth = 0i32;
        let mut start = range.start;
        for p in range.clone() {
            let Some(lexeme) = self.at(p) else { break };
            if lexeme.is_symbol("(") {
                depth += 1;
            } else if lexeme.is_symbol(")") {
                depth -= 1;
            } else if depth == 0 && is_separator(lexeme) {
                parts.push(start..p);
                start = p + 1;
            }
        }
        parts.push(start..range.end);
        parts.into_iter().filter(|r| r.start < r.end).collect()
    }

    /// `a.b.c` starting at `p`; returns the position after the name and its
    /// written form.
    fn dotted_name(&self, p: usize, end: usize) -> Option<(usize, String)> {
        let first = self.at(p)?;
        if first.word().is_none() || is_clause_keyword(first) {
            return None;
        }
        let mut last = p;
        while last + 2 < end
            && self.at(last + 1).map(|l| l.is_symbol(".")).unwrap_or(false)
            && self.at(last + 2).and_then(|l| l.word()).is_some()
        {
            last += 2;
        }
        Some((last + 1, self.render(p..last + 1)))
    }

    fn table_ref(&self, range: Range<usize>) -> Option<TableRef> {
        let (after, written) = self.dotted_name(range.start, range.end)?;
        let last = after - 1;
        let name = self.at(last)?.word()?.to_string();

        let mut alias_pos = after;
        if self.at(alias_pos).map(|l| l.is_keyword("AS")).unwrap_or(false) {
            alias_pos += 1;
        }
        let alias = if alias_pos < range.end {
            self.at(alias_pos)
                .filter(|l| !is_clause_keyword(l))
                .and_then(|l| l.word())
                .map(str::to_string)
        } else {
            None
        };

        Some(TableRef {
            name,
            written,
            alias,
            lexeme_index: self.sig[last],
        })
    }

    fn read_projection(&self, range: Range<usize>, statement: &mut ScannedStatement) {
        let mut p = range.start;
        if self.at(p).map(|l| l.is_keyword("DISTINCT")).unwrap_or(false) {
            statement.distinct = true;
            p += 1;
        } else if self.at(p).map(|l| l.is_keyword("ALL")).unwrap_or(false) {
            p += 1;
        }
        if self.at(p).map(|l| l.is_keyword("TOP")).unwrap_or(false) {
            let parenthesized = self.at(p + 1).map(|l| l.is_symbol("(")).unwrap_or(false);
            let number_pos = if parenthesized { p + 2 } else { p + 1 };
            if let Some(Lexeme::Number(n)) = self.at(number_pos) {
                statement.top = n.parse().ok();
                p = if parenthesized { number_pos + 2 } else { number_pos + 1 };
            }
        }
        statement.projection = self
            .split_top_level(p..range.end.max(p), |l| l.is_symbol(","))
            .into_iter()
            .map(|r| self.render(r))
            .filter(|s| !s.is_empty())
            .collect();
    }

    fn order_terms(&self, range: Range<usize>) -> Vec<OrderTerm> {
        self.split_top_level(range, |l| l.is_symbol(","))
            .into_iter()
            .map(|r| {
                let last = self.at(r.end - 1);
                let descending = last.map(|l| l.is_keyword("DESC")).unwrap_or(false);
                let has_direction = descending || last.map(|l| l.is_keyword("ASC")).unwrap_or(false);
                let expr_end = if has_direction { r.end - 1 } else { r.end };
                OrderTerm {
                    expr: self.render(r.start..expr_end),
                    descending,
                }
            })
            .filter(|t| !t.expr.is_empty())
            .collect()
    }

    fn conditions(&self, range: Range<usize>) -> Option<Vec<Condition>> {
        let has_or = {
            let mut depth = 0i32;
            range.clone().any(|p| match self.at(p) {
                Some(l) if l.is_symbol("(") => {
                    depth += 1;
                    false
                }
                Some(l) if l.is_symbol(")") => {
                    depth -= 1;
                    false
                }
                Some(l) => depth == 0 && l.is_keyword("OR"),
                None => false,
            })
        };
        if has_or {
            return None;
        }
        self.split_top_level(range, |l| l.is_keyword("AND"))
            .into_iter()
            .map(|r| self.condition(r))
            .collect()
    }

    fn condition(&self, range: Range<usize>) -> Option<Condition> {
        let mut p = range.start;
        let lower_column = self.at(p).map(|l| l.is_keyword("LOWER")).unwrap_or(false)
            && self.at(p + 1).map(|l| l.is_symbol("(")).unwrap_or(false);
        if lower_column {
            p += 2;
        }
        let (after, _) = self.dotted_name(p, range.end)?;
        let column = self.at(after - 1)?.word()?.to_string();
        p = after;
        if lower_column {
            if !self.at(p)?.is_symbol(")") {
                return None;
            }
            p += 1;
        }

        let op_lexeme = self.at(p)?;
        let op = if op_lexeme.is_keyword("IS") {
            let negated = self.at(p + 1).map(|l| l.is_keyword("NOT")).unwrap_or(false);
            let null_pos = if negated { p + 2 } else { p + 1 };
            if !self.at(null_pos)?.is_keyword("NULL") || null_pos + 1 != range.end {
                return None;
            }
            return Some(Condition {
                column,
                op: if negated { CompareOp::IsNotNull } else { CompareOp::IsNull },
                value: Literal::Null,
                lower_column,
                lower_value: false,
            });
        } else if op_lexeme.is_keyword("LIKE") {
            p += 1;
            CompareOp::Like
        } else if op_lexeme.is_keyword("NOT") && self.at(p + 1).map(|l| l.is_keyword("LIKE")).unwrap_or(false) {
            p += 2;
            CompareOp::NotLike
        } else if let Lexeme::Symbol(symbol) = op_lexeme {
            p += 1;
            CompareOp::from_symbol(symbol)?
        } else {
            return None;
        };

        let lower_value = self.at(p).map(|l| l.is_keyword("LOWER")).unwrap_or(false)
            && self.at(p + 1).map(|l| l.is_symbol("(")).unwrap_or(false);
        if lower_value {
            p += 2;
        }
        let (value, after) = self.literal(p)?;
        p = after;
        if lower_value {
            if !self.at(p)?.is_symbol(")") {
                return None;
            }
            p += 1;
        }
        if p != range.end {
            return None;
        }

        Some(Condition {
            column,
            op,
            value,
            lower_column,
            lower_value,
        })
    }

    fn literal(&self, p: usize) -> Option<(Literal, usize)> {
        match self.at(p)? {
            Lexeme::Str(s) => Some((Literal::Text(s.clone()), p + 1)),
            Lexeme::Number(n) => Some((Literal::Number(n.parse().ok()?), p + 1)),
            Lexeme::Symbol(s) if s == "-" => match self.at(p + 1)? {
                Lexeme::Number(n) => Some((Literal::Number(-n.parse::<f64>().ok()?), p + 2)),
                _ => None,
            },
            Lexeme::Symbol(s) if s.starts_with('?') || s.starts_with('$') || s.starts_with('@') => {
                Some((Literal::Placeholder(s.clone()), p + 1))
            }
            lexeme => match lexeme.keyword()?.as_str() {
                "TRUE" => Some((Literal::Bool(true), p + 1)),
                "FALSE" => Some((Literal::Bool(false), p + 1)),
                "NULL" => Some((Literal::Null, p + 1)),
                _ => None,
            },
        }
    }
}
