//! Field-location mapping.
//!
//! Every logical query parameter (`hostname`, `aws-region`, `vc_url`, ...) is
//! declared per record-type variant with exactly one storage location: a table
//! column, a path into the record `context`, or a path into the record `data`.
//! The mapping is configuration; the compiler, the catalog aggregator and the
//! scope registry only read it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::predicate::Key;

/// The closed set of table columns a mapping may point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Column {
    Id,
    Type,
    Hostname,
    Ip,
    Timestamp,
    Committer,
}

impl Column {
    pub fn as_str(&self) -> &'static str {
        match self {
            Column::Id => "id",
            Column::Type => "type",
            Column::Hostname => "hostname",
            Column::Ip => "ip",
            Column::Timestamp => "timestamp",
            Column::Committer => "committer",
        }
    }
    pub fn parse(name: &str) -> Option<Column> {
        match name {
            "id" => Some(Column::Id),
            "type" => Some(Column::Type),
            "hostname" => Some(Column::Hostname),
            "ip" => Some(Column::Ip),
            "timestamp" => Some(Column::Timestamp),
            "committer" => Some(Column::Committer),
            _ => None,
        }
    }
}

/// One storage location as written in configuration, e.g. `{ context: ".aws-region" }`.
///
/// The three fields are mutually exclusive; when more than one is filled the
/// first non-empty one in the order table, context, data wins. A location
/// with none of them is inert.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldLocation {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub table: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub context: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data: String,
}

impl FieldLocation {
    pub fn table(column: Column) -> Self {
        Self { table: column.as_str().to_string(), ..Default::default() }
    }
    pub fn context(path: &str) -> Self {
        Self { context: path.to_string(), ..Default::default() }
    }
    pub fn data(path: &str) -> Self {
        Self { data: path.to_string(), ..Default::default() }
    }

    /// The predicate key this location resolves to, or `None` when inert.
    pub fn key(&self) -> Option<Key> {
        if !self.table.is_empty() {
            match Column::parse(&self.table) {
                Some(column) => Some(Key::Column(column)),
                None => {
                    warn!(table = %self.table, "mapping points at an unknown column, ignoring it");
                    None
                }
            }
        } else if !self.context.is_empty() {
            Some(Key::Context(self.context.clone()))
        } else if !self.data.is_empty() {
            Some(Key::Data(self.data.clone()))
        } else {
            None
        }
    }
}

/// Logical parameter name -> record-type variant -> location.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldMapping(BTreeMap<String, BTreeMap<String, FieldLocation>>);

impl FieldMapping {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn declare(&mut self, name: &str, variant: &str, location: FieldLocation) -> &mut Self {
        self.0
            .entry(name.to_string())
            .or_default()
            .insert(variant.to_string(), location);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Every distinct key the parameter maps to across all variants, in a stable order.
    /// `None` when the parameter is not declared at all; an empty vector when it is
    /// declared but every location is inert.
    pub fn keys_for(&self, name: &str) -> Option<Vec<Key>> {
        let variants = self.0.get(name)?;
        let mut keys: Vec<Key> = Vec::new();
        for key in variants.values().filter_map(FieldLocation::key) {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        Some(keys)
    }

    /// The key of one specific variant of a parameter.
    pub fn key_for(&self, name: &str, variant: &str) -> Option<Key> {
        self.0.get(name)?.get(variant)?.key()
    }
}
