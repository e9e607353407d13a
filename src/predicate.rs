//! The compiled filter tree and its rendering to parameterised SQL.
//!
//! A [`WhereClauses`] is a list of [`Grouping`]s that are ANDed together. Each
//! grouping is an ordered list of [`Clause`]s, each joined to the previous one
//! by its own [`Relativity`]. A clause may carry several [`Key`]s (the same
//! logical field stored in more than one place); those are ORed.
//!
//! Rendering never splices a caller supplied value into the SQL text: every
//! value and every search needle becomes exactly one `?` placeholder, in
//! order. Context and data paths come from configuration and are written as
//! quoted string literals.

use std::fmt;

use crate::error::{HostdbError, Result};
use crate::mapping::Column;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relativity {
    And,
    Or,
}

impl Relativity {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Relativity::And => "AND",
            Relativity::Or => "OR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    NotEq,
    Like,
    NotLike,
    RLike,
    NotRLike,
    In,
    NotIn,
    IsNull,
    IsNotNull,
}

impl Operator {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::NotEq => "!=",
            Operator::Like => "LIKE",
            Operator::NotLike => "NOT LIKE",
            Operator::RLike => "REGEXP",
            Operator::NotRLike => "NOT REGEXP",
            Operator::In => "IN",
            Operator::NotIn => "NOT IN",
            Operator::IsNull => "IS NULL",
            Operator::IsNotNull => "IS NOT NULL",
        }
    }
    fn arity_ok(&self, values: usize) -> bool {
        match self {
            Operator::IsNull | Operator::IsNotNull => values == 0,
            Operator::In | Operator::NotIn => values >= 1,
            _ => values == 1,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// The JSON documents stored with every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Document {
    Context,
    Data,
}

impl Document {
    fn column(&self) -> &'static str {
        match self {
            Document::Context => "context",
            Document::Data => "data",
        }
    }
}

/// A storage location a clause tests.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    Column(Column),
    /// `$`-relative path into the context document, e.g. `.aws-region`.
    Context(String),
    /// `$`-relative path into the data document, e.g. `.VpcId`.
    Data(String),
    /// Free text search: the path of the first string value in the document
    /// containing `needle`, or NULL.
    Search { document: Document, needle: String },
}

impl Key {
    pub fn search(document: Document, needle: &str) -> Self {
        Key::Search { document, needle: needle.to_string() }
    }

    /// Writes the SQL expression for this key, pushing any bound values it needs.
    pub fn render(&self, params: &mut Vec<String>) -> String {
        match self {
            Key::Column(column) => format!("\"{}\"", column.as_str()),
            Key::Context(path) => json_value(Document::Context, path),
            Key::Data(path) => json_value(Document::Data, path),
            Key::Search { document, needle } => {
                params.push(format!("%{needle}%"));
                format!("json_search({}, 'one', ?)", document.column())
            }
        }
    }
}

fn json_value(document: Document, path: &str) -> String {
    format!("json_value({}, '${}')", document.column(), path.replace('\'', "''"))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub relativity: Relativity,
    pub keys: Vec<Key>,
    pub operator: Operator,
    pub values: Vec<String>,
}

impl Clause {
    pub fn new(relativity: Relativity, keys: Vec<Key>, operator: Operator, values: Vec<String>) -> Self {
        Self { relativity, keys, operator, values }
    }

    pub fn render(&self, params: &mut Vec<String>) -> Result<String> {
        if self.keys.is_empty() {
            return Err(HostdbError::validation("a where clause needs at least one key"));
        }
        if !self.operator.arity_ok(self.values.len()) {
            return Err(HostdbError::validation(format!(
                "operator {} cannot take {} value(s)",
                self.operator,
                self.values.len()
            )));
        }
        let mut tests = Vec::with_capacity(self.keys.len());
        for key in &self.keys {
            let mut sql = key.render(params);
            sql.push(' ');
            sql.push_str(self.operator.as_sql());
            match self.operator {
                Operator::IsNull | Operator::IsNotNull => {}
                Operator::In | Operator::NotIn => {
                    let marks = vec!["?"; self.values.len()].join(", ");
                    sql.push_str(&format!(" ({marks})"));
                    params.extend(self.values.iter().cloned());
                }
                _ => {
                    sql.push_str(" ?");
                    params.extend(self.values.iter().cloned());
                }
            }
            tests.push(sql);
        }
        if tests.len() == 1 {
            Ok(tests.remove(0))
        } else {
            Ok(format!("({})", tests.join(" OR ")))
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Grouping {
    pub clauses: Vec<Clause>,
}

impl Grouping {
    pub fn new(clauses: Vec<Clause>) -> Self {
        Self { clauses }
    }

    /// The relativity of the first clause has nothing to attach to and is ignored.
    pub fn render(&self, params: &mut Vec<String>) -> Result<String> {
        let mut sql = String::new();
        for (i, clause) in self.clauses.iter().enumerate() {
            if i > 0 {
                sql.push(' ');
                sql.push_str(clause.relativity.as_sql());
                sql.push(' ');
            }
            sql.push_str(&clause.render(params)?);
        }
        Ok(sql)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WhereClauses {
    pub groups: Vec<Grouping>,
}

impl WhereClauses {
    pub fn new() -> Self {
        Self { groups: Vec::new() }
    }

    pub fn push(&mut self, grouping: Grouping) {
        self.groups.push(grouping);
    }

    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(|g| g.clauses.is_empty())
    }

    /// Number of bound values a render produces: each value once per key it is
    /// tested against, plus one per search needle.
    pub fn placeholder_count(&self) -> usize {
        self.groups
            .iter()
            .flat_map(|g| g.clauses.iter())
            .map(|c| {
                let needles = c.keys.iter().filter(|k| matches!(k, Key::Search { .. })).count();
                c.values.len() * c.keys.len() + needles
            })
            .sum()
    }

    /// Renders `WHERE (...) AND (...)`, or an empty string when there is nothing to filter on.
    pub fn render(&self) -> Result<(String, Vec<String>)> {
        let mut params = Vec::new();
        let mut parts = Vec::new();
        for grouping in self.groups.iter().filter(|g| !g.clauses.is_empty()) {
            parts.push(format!("({})", grouping.render(&mut params)?));
        }
        if parts.is_empty() {
            Ok((String::new(), params))
        } else {
            Ok((format!("WHERE {}", parts.join(" AND ")), params))
        }
    }
}

/// Page size and row offset. Both are non-negative by construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Limit {
    pub limit: Option<u64>,
    pub offset: u64,
}

impl Limit {
    pub fn new(limit: Option<u64>, offset: u64) -> Self {
        Self { limit, offset }
    }

    pub fn render(&self) -> String {
        match (self.limit, self.offset) {
            (None, 0) => String::new(),
            (Some(limit), 0) => format!("LIMIT {limit}"),
            (Some(limit), offset) => format!("LIMIT {limit} OFFSET {offset}"),
            // SQLite has no OFFSET without LIMIT
            (None, offset) => format!("LIMIT -1 OFFSET {offset}"),
        }
    }
}
