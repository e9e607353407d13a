//! Records, bulk record sets, payload hashing and structural completeness.

use std::collections::BTreeMap;

use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{HostdbError, Result};

/// Textual timestamp format used on the wire and in storage (UTC).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Prefix of internally minted record identities.
pub const ID_PREFIX: &str = "hdb";

/// Metadata about the batch a record arrived in; key order is irrelevant.
pub type Context = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub record_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub committer: String,
    #[serde(default, skip_serializing_if = "Context::is_empty")]
    pub context: Context,
    /// Opaque payload; `Null` means absent.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: String,
}

/// A bulk submission: shared type, timestamp, committer and context plus the records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordSet {
    #[serde(rename = "type", default)]
    pub record_type: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub committer: String,
    /// `None` when the envelope carried no context at all.
    #[serde(default)]
    pub context: Option<Context>,
    #[serde(default)]
    pub records: Vec<Record>,
}

/// SHA-256 (lower-case hex) over the canonical compact form of a payload.
///
/// Object keys are sorted at every depth and no insignificant whitespace is
/// written, so payloads that differ only in formatting or key order hash the same.
pub fn hash_payload(data: &Value) -> Result<String> {
    let mut canonical = String::new();
    write_canonical(data, &mut canonical)?;
    Ok(format!("{:x}", Sha256::digest(canonical.as_bytes())))
}

fn write_canonical(value: &Value, out: &mut String) -> Result<()> {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_canonical(value, out)?;
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}

pub fn now_timestamp() -> String {
    Utc::now().format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT).ok()
}

/// A fresh identity, e.g. `hdb-6f1c0c3e-...`.
pub fn mint_id() -> String {
    format!("{}-{}", ID_PREFIX, uuid::Uuid::new_v4())
}

/// An absent-equivalent context value: `null` or the empty string.
pub fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Scalar context/data values as text; `None` for null, arrays and objects.
pub fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub fn validate_type(record_type: &str) -> Result<()> {
    if record_type.is_empty() {
        Err(HostdbError::validation("record has no type"))
    } else if record_type.chars().any(char::is_whitespace) {
        Err(HostdbError::validation("type cannot contain a space character"))
    } else {
        Ok(())
    }
}

impl Record {
    /// Checks the fields every stored record needs and fills the derivable ones:
    /// a missing timestamp becomes now and a missing hash is computed.
    pub fn ensure_complete(&mut self) -> Result<()> {
        validate_type(&self.record_type)?;
        if self.timestamp.is_empty() {
            self.timestamp = now_timestamp();
        }
        if self.context.is_empty() {
            return Err(HostdbError::validation("record has no context"));
        }
        if self.data.is_null() {
            return Err(HostdbError::validation("data payload/element is missing"));
        }
        if self.hash.is_empty() {
            self.hash = hash_payload(&self.data)?;
        }
        Ok(())
    }

    /// Recomputes the payload hash from `data`, discarding whatever the client sent.
    pub fn rehash(&mut self) -> Result<()> {
        self.hash = hash_payload(&self.data)?;
        Ok(())
    }

    /// Fills absent or blank context keys from the envelope; present values win.
    pub fn merge_context(&mut self, envelope: &Context) {
        for (key, value) in envelope {
            match self.context.get(key) {
                Some(existing) if !is_blank(existing) => {}
                _ => {
                    self.context.insert(key.clone(), value.clone());
                }
            }
        }
    }

    /// Back-fills type, timestamp, committer and context from a validated envelope.
    pub fn backfill(&mut self, set: &RecordSet) {
        if self.record_type.is_empty() {
            self.record_type = set.record_type.clone();
        }
        if self.timestamp.is_empty() {
            self.timestamp = set.timestamp.clone();
        }
        if self.committer.is_empty() {
            self.committer = set.committer.clone();
        }
        if let Some(context) = &set.context {
            self.merge_context(context);
        }
    }

    /// A copy keeping only the named fields; unknown names are ignored.
    pub fn project<S: AsRef<str>>(&self, fields: &[S]) -> Record {
        let mut projected = Record::default();
        for field in fields {
            let name = field.as_ref().trim().to_ascii_lowercase();
            if let Some((_, copy)) = FIELD_COPIERS.iter().find(|(n, _)| *n == name) {
                copy(self, &mut projected);
            }
        }
        projected
    }
}

type FieldCopier = fn(&Record, &mut Record);

const FIELD_COPIERS: &[(&str, FieldCopier)] = &[
    ("id", |from, to| to.id = from.id.clone()),
    ("type", |from, to| to.record_type = from.record_type.clone()),
    ("hostname", |from, to| to.hostname = from.hostname.clone()),
    ("ip", |from, to| to.ip = from.ip.clone()),
    ("timestamp", |from, to| to.timestamp = from.timestamp.clone()),
    ("committer", |from, to| to.committer = from.committer.clone()),
    ("context", |from, to| to.context = from.context.clone()),
    ("data", |from, to| to.data = from.data.clone()),
    ("hash", |from, to| to.hash = from.hash.clone()),
];

impl RecordSet {
    /// Envelope level validation. Runs before anything is read or written.
    ///
    /// `caller` is the committer used when the envelope names none. An
    /// unparseable timestamp is replaced by now; an empty one is an error.
    pub fn validate(&mut self, caller: &str) -> Result<()> {
        if self.record_type.is_empty() {
            return Err(HostdbError::validation("no type provided"));
        }
        validate_type(&self.record_type)?;
        if self.timestamp.is_empty() {
            return Err(HostdbError::validation("no timestamp provided"));
        }
        if parse_timestamp(&self.timestamp).is_none() {
            self.timestamp = now_timestamp();
        }
        if self.context.is_none() {
            return Err(HostdbError::validation("no context provided"));
        }
        if self.committer.is_empty() {
            self.committer = caller.to_string();
        }
        if self.records.iter().any(|r| r.data.is_null()) {
            return Err(HostdbError::validation(
                "data payload/element is missing from one or more records",
            ));
        }
        Ok(())
    }

    pub fn context(&self) -> &Context {
        self.context.as_ref().unwrap_or(&EMPTY_CONTEXT)
    }
}

static EMPTY_CONTEXT: Context = BTreeMap::new();
