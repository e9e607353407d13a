//! Query parameter compiler.
//!
//! Turns a multi-valued parameter map into a [`WhereClauses`] tree and a
//! [`Limit`]. Compilation is pure: it reads the field mapping and never
//! touches storage.
//!
//! Parameter forms:
//! * `_limit=n`, `_offset=n` paginate; negative values are rejected.
//! * `_search=text` matches text anywhere (data, context, hostname, ip, type,
//!   committer); `!_search=text` requires that it appears nowhere.
//! * `name=v` equality, `name=a,b` membership, `name=/re/` regex, bare `name`
//!   presence. A `!name` prefix negates; a `name[]` suffix is dropped.
//!   Regex patterns are checked here, and a regex cannot share a parameter
//!   with other values.
//! * Names not in the mapping are rejected unless they start with `_`.

use std::collections::BTreeMap;

use regex::RegexBuilder;
use tracing::debug;

use crate::error::{HostdbError, Result};
use crate::mapping::{Column, FieldMapping};
use crate::predicate::{Clause, Document, Grouping, Key, Limit, Operator, Relativity, WhereClauses};

/// Parameter name -> every value supplied for it, in request order.
pub type ParamMap = BTreeMap<String, Vec<String>>;

/// Groups `(name, value)` pairs as they come off a query string.
pub fn group_params<I, K, V>(pairs: I) -> ParamMap
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let mut params = ParamMap::new();
    for (name, value) in pairs {
        params.entry(name.into()).or_default().push(value.into());
    }
    params
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Compiled {
    pub clauses: WhereClauses,
    pub limit: Limit,
}

const SEARCH_COLUMNS: [Column; 4] = [Column::Hostname, Column::Ip, Column::Type, Column::Committer];

pub fn compile(params: &ParamMap, mapping: &FieldMapping) -> Result<Compiled> {
    let mut compiled = Compiled::default();
    for (name, values) in params {
        match name.as_str() {
            "_limit" => compiled.limit.limit = Some(non_negative(name, values)?),
            "_offset" => compiled.limit.offset = non_negative(name, values)?,
            "_search" | "!_search" => {
                let negated = name.starts_with('!');
                for needle in values.iter().filter(|v| !v.is_empty()) {
                    compiled.clauses.push(search_grouping(needle, negated));
                }
            }
            _ => {
                if let Some(grouping) = field_grouping(name, values, mapping)? {
                    compiled.clauses.push(grouping);
                }
            }
        }
    }
    debug!(groups = compiled.clauses.groups.len(), limit = ?compiled.limit, "compiled query params");
    Ok(compiled)
}

fn non_negative(name: &str, values: &[String]) -> Result<u64> {
    let raw = values.first().map(|v| v.trim()).unwrap_or_default();
    let parsed: i64 = raw
        .parse()
        .map_err(|_| HostdbError::validation(format!("{name} parameter must be an integer")))?;
    if parsed < 0 {
        return Err(HostdbError::validation(format!("{name} parameter must not be negative")));
    }
    Ok(parsed as u64)
}

/// One grouping testing every searchable surface for the needle.
fn search_grouping(needle: &str, negated: bool) -> Grouping {
    let (relativity, like, null) = if negated {
        (Relativity::And, Operator::NotLike, Operator::IsNull)
    } else {
        (Relativity::Or, Operator::Like, Operator::IsNotNull)
    };
    let mut clauses = Vec::with_capacity(2 + SEARCH_COLUMNS.len());
    for document in [Document::Data, Document::Context] {
        clauses.push(Clause::new(relativity, vec![Key::search(document, needle)], null, vec![]));
    }
    for column in SEARCH_COLUMNS {
        clauses.push(Clause::new(
            relativity,
            vec![Key::Column(column)],
            like,
            vec![format!("%{needle}%")],
        ));
    }
    Grouping::new(clauses)
}

fn field_grouping(raw_name: &str, raw_values: &[String], mapping: &FieldMapping) -> Result<Option<Grouping>> {
    let name = raw_name.strip_suffix("[]").unwrap_or(raw_name);
    let (name, negated) = match name.strip_prefix('!') {
        Some(stripped) => (stripped, true),
        None => (name, false),
    };

    let keys = match mapping.keys_for(name) {
        Some(keys) => keys,
        None if name.starts_with('_') => return Ok(None),
        None => {
            return Err(HostdbError::validation(format!("unsupported query param '{name}'")));
        }
    };
    if keys.is_empty() {
        return Ok(None);
    }

    let mut values = Vec::new();
    let mut regex = false;
    for value in raw_values {
        if value.contains(',') {
            values.extend(value.split(',').filter(|v| !v.is_empty()).map(String::from));
        } else if let Some(pattern) = regex_literal(value) {
            check_pattern(pattern)?;
            values.push(pattern.to_string());
            regex = true;
        } else if !value.is_empty() {
            values.push(value.clone());
        }
    }

    if regex && values.len() > 1 {
        return Err(HostdbError::validation(format!(
            "query param '{name}' cannot mix a regular expression with other values"
        )));
    }

    let operator = match (values.len(), negated) {
        (0, false) => Operator::IsNotNull,
        (0, true) => Operator::IsNull,
        (1, false) if regex => Operator::RLike,
        (1, true) if regex => Operator::NotRLike,
        (1, false) => Operator::Eq,
        (1, true) => Operator::NotEq,
        (_, false) => Operator::In,
        (_, true) => Operator::NotIn,
    };
    Ok(Some(Grouping::new(vec![Clause::new(Relativity::And, keys, operator, values)])))
}

/// The pattern inside `/.../`, if the value is bounded that way.
pub fn regex_literal(value: &str) -> Option<&str> {
    if value.len() >= 2 && value.starts_with('/') && value.ends_with('/') {
        Some(&value[1..value.len() - 1])
    } else {
        None
    }
}

/// Rejects a pattern the storage `regexp` function could not compile.
pub fn check_pattern(pattern: &str) -> Result<()> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map(drop)
        .map_err(|e| HostdbError::validation(format!("invalid regular expression '{pattern}': {e}")))
}
