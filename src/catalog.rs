//! Catalog aggregation: the distinct values a query parameter takes across
//! every storage location it maps to.

use std::collections::BTreeMap;

use tracing::debug;

use crate::compiler::{check_pattern, regex_literal};
use crate::error::{HostdbError, Result};
use crate::mapping::FieldMapping;
use crate::persist::Storage;
use crate::predicate::{Clause, Grouping, Operator, Relativity, WhereClauses};

/// Distinct value -> frequency. Frequencies are zero when they were not requested.
pub type Catalog = BTreeMap<String, u64>;

/// `count` is on unless spelled `0` or `false`.
pub fn frequency_flag(value: &str) -> bool {
    value != "0" && !value.eq_ignore_ascii_case("false")
}

/// Validates a `/pattern/` filter and returns the bare pattern.
pub fn parse_filter(filter: &str) -> Result<&str> {
    let pattern = regex_literal(filter).ok_or_else(|| HostdbError::validation("invalid regex encapsulation"))?;
    check_pattern(pattern)?;
    Ok(pattern)
}

pub fn aggregate(
    storage: &dyn Storage,
    mapping: &FieldMapping,
    item: &str,
    frequency: bool,
    filter: Option<&str>,
) -> Result<Catalog> {
    let keys = mapping
        .keys_for(item)
        .ok_or_else(|| HostdbError::validation(format!("that item is not familiar: '{item}'")))?;
    let pattern = filter.map(parse_filter).transpose()?;

    let mut catalog = Catalog::new();
    for key in keys {
        let mut clauses = vec![Clause::new(Relativity::And, vec![key.clone()], Operator::IsNotNull, vec![])];
        if let Some(pattern) = pattern {
            clauses.push(Clause::new(
                Relativity::And,
                vec![key.clone()],
                Operator::RLike,
                vec![pattern.to_string()],
            ));
        }
        let mut filter = WhereClauses::new();
        filter.push(Grouping::new(clauses));

        for (value, count) in storage.distinct_values(&key, &filter, frequency)? {
            // first location to report a value keeps its count
            catalog.entry(value).or_insert(count);
        }
    }
    debug!(item, entries = catalog.len(), "catalog aggregated");
    if catalog.is_empty() {
        return Err(HostdbError::not_found("catalog not found"));
    }
    Ok(catalog)
}
