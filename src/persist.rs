// used for persistence
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use regex::{Regex, RegexBuilder};
use rusqlite::functions::{Context as FunctionContext, FunctionFlags};
use rusqlite::types::ValueRef;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{HostdbError, Result};
use crate::predicate::{Key, Limit, WhereClauses};
use crate::record::Record;

/// Where the SQLite database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceMode {
    InMemory,
    File(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub total_records: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub newest_record: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oldest_record: Option<String>,
    /// Committer -> most recent timestamp written by it.
    pub last_seen_collectors: BTreeMap<String, String>,
}

/// The capability the request handling core needs from a backend.
pub trait Storage: Send + Sync {
    /// Rows matching the clauses (ordered by id, paginated) and the total match count
    /// ignoring pagination.
    fn fetch(&self, clauses: &WhereClauses, limit: &Limit) -> Result<(Vec<Record>, u64)>;
    fn get(&self, id: &str) -> Result<Option<Record>>;
    /// Inserts or replaces all records as one batch.
    fn upsert(&self, records: &[Record]) -> Result<()>;
    fn delete(&self, id: &str) -> Result<()>;
    /// Distinct values at one location among the rows matching the clauses, with
    /// their frequency when asked for (zero otherwise).
    fn distinct_values(&self, key: &Key, clauses: &WhereClauses, frequency: bool) -> Result<Vec<(String, u64)>>;
    fn stats(&self) -> Result<Stats>;
}

const COLUMNS: &str = "id, type, hostname, ip, timestamp, committer, context, data, hash";
// rows per insert statement, well below the bound variable limit
const UPSERT_CHUNK: usize = 100;

pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    pub fn new(mode: PersistenceMode, busy_timeout: Duration) -> Result<Self> {
        let conn = match &mode {
            PersistenceMode::InMemory => Connection::open_in_memory()?,
            PersistenceMode::File(path) => Connection::open(path)?,
        };
        conn.busy_timeout(busy_timeout)?;
        register_functions(&conn)?;
        create_schema(&conn)?;
        info!(?mode, "sqlite storage ready");
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(PersistenceMode::InMemory, Duration::from_millis(5000))
    }
}

fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        create table if not exists hostdb (
            id text not null,
            type text not null,
            hostname text not null default '',
            ip text not null default '',
            timestamp text not null,
            committer text not null default '',
            context text not null,
            data text not null,
            hash text not null,
            constraint unique_and_referenceable_id primary key (
                id
            )
        );
        create index if not exists hostdb_type on hostdb (type);
        create index if not exists hostdb_hostname on hostdb (hostname);
        ",
    )?;
    Ok(())
}

struct RawRow {
    id: String,
    record_type: String,
    hostname: String,
    ip: String,
    timestamp: String,
    committer: String,
    context: String,
    data: String,
    hash: String,
}

fn read_row(row: &rusqlite::Row) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        id: row.get(0)?,
        record_type: row.get(1)?,
        hostname: row.get(2)?,
        ip: row.get(3)?,
        timestamp: row.get(4)?,
        committer: row.get(5)?,
        context: row.get(6)?,
        data: row.get(7)?,
        hash: row.get(8)?,
    })
}

impl RawRow {
    fn into_record(self) -> Result<Record> {
        Ok(Record {
            context: serde_json::from_str(&self.context)?,
            data: serde_json::from_str(&self.data)?,
            id: self.id,
            record_type: self.record_type,
            hostname: self.hostname,
            ip: self.ip,
            timestamp: self.timestamp,
            committer: self.committer,
            hash: self.hash,
        })
    }
}

impl Storage for SqliteStorage {
    fn fetch(&self, clauses: &WhereClauses, limit: &Limit) -> Result<(Vec<Record>, u64)> {
        let (where_sql, params) = clauses.render()?;
        let statement = format!("select {COLUMNS} from hostdb {where_sql} order by id {}", limit.render());
        debug!(sql = %statement, ?params, "fetch");
        let conn = self.conn.lock()?;
        let raw: Vec<RawRow> = conn
            .prepare(&statement)?
            .query_map(params_from_iter(params.iter()), read_row)?
            .collect::<rusqlite::Result<_>>()?;
        let count_statement = format!("select count(*) from hostdb {where_sql}");
        let total: i64 = conn.query_row(&count_statement, params_from_iter(params.iter()), |row| row.get(0))?;
        drop(conn);
        let records = raw.into_iter().map(RawRow::into_record).collect::<Result<Vec<_>>>()?;
        Ok((records, total.max(0) as u64))
    }

    fn get(&self, id: &str) -> Result<Option<Record>> {
        let conn = self.conn.lock()?;
        let raw = conn
            .query_row(&format!("select {COLUMNS} from hostdb where id = ?"), [id], read_row)
            .optional()?;
        drop(conn);
        raw.map(RawRow::into_record).transpose()
    }

    fn upsert(&self, records: &[Record]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction()?;
        for chunk in records.chunks(UPSERT_CHUNK) {
            let rows = vec!["(?, ?, ?, ?, ?, ?, ?, ?, ?)"; chunk.len()].join(", ");
            let statement = format!("insert or replace into hostdb ({COLUMNS}) values {rows}");
            let mut values: Vec<String> = Vec::with_capacity(chunk.len() * 9);
            for record in chunk {
                values.extend([
                    record.id.clone(),
                    record.record_type.clone(),
                    record.hostname.clone(),
                    record.ip.clone(),
                    record.timestamp.clone(),
                    record.committer.clone(),
                    serde_json::to_string(&record.context)?,
                    serde_json::to_string(&record.data)?,
                    record.hash.clone(),
                ]);
            }
            debug!(sql = %statement, rows = chunk.len(), "upsert");
            tx.execute(&statement, params_from_iter(values.iter()))?;
        }
        tx.commit()?;
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock()?;
        let exists: Option<String> = conn
            .query_row("select id from hostdb where id = ?", [id], |row| row.get(0))
            .optional()?;
        if exists.is_none() {
            return Err(HostdbError::not_found(format!("record not found: {id}")));
        }
        debug!(%id, "delete");
        let affected = conn.execute("delete from hostdb where id = ?", [id])?;
        if affected == 0 {
            return Err(HostdbError::Storage(format!("zero records deleted for {id}")));
        }
        Ok(())
    }

    fn distinct_values(&self, key: &Key, clauses: &WhereClauses, frequency: bool) -> Result<Vec<(String, u64)>> {
        let mut params = Vec::new();
        let field = key.render(&mut params);
        let (where_sql, where_params) = clauses.render()?;
        params.extend(where_params);
        let statement = if frequency {
            format!("select {field}, count(*) from hostdb {where_sql} group by 1 order by 1")
        } else {
            format!("select distinct {field}, 0 from hostdb {where_sql} order by 1")
        };
        debug!(sql = %statement, ?params, "distinct values");
        let conn = self.conn.lock()?;
        let mut prepared = conn.prepare(&statement)?;
        let values = prepared
            .query_map(params_from_iter(params.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?.max(0) as u64))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(values)
    }

    fn stats(&self) -> Result<Stats> {
        let conn = self.conn.lock()?;
        let total: i64 = conn.query_row("select count(*) from hostdb", [], |row| row.get(0))?;
        let newest: Option<String> = conn
            .query_row("select timestamp from hostdb order by timestamp desc limit 1", [], |row| row.get(0))
            .optional()?;
        let oldest: Option<String> = conn
            .query_row("select timestamp from hostdb order by timestamp asc limit 1", [], |row| row.get(0))
            .optional()?;
        let mut prepared = conn.prepare(
            "select committer, max(timestamp) from hostdb where committer != '' group by committer",
        )?;
        let last_seen = prepared
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;
        Ok(Stats {
            total_records: total.max(0) as u64,
            newest_record: newest,
            oldest_record: oldest,
            last_seen_collectors: last_seen,
        })
    }
}

// ------------- SQL functions -------------
type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

fn register_functions(conn: &Connection) -> Result<()> {
    let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;
    // backs `x REGEXP y`; matching is case-insensitive
    conn.create_scalar_function("regexp", 2, flags, |ctx| {
        let regex: Arc<Regex> = ctx.get_or_create_aux(0, |pattern| -> std::result::Result<_, BoxError> {
            Ok(RegexBuilder::new(pattern.as_str()?).case_insensitive(true).build()?)
        })?;
        Ok(argument_text(ctx, 1)?.map(|text| regex.is_match(&text)))
    })?;
    conn.create_scalar_function("json_value", 2, flags, |ctx| {
        let (Some(document), Some(path)) = (argument_text(ctx, 0)?, argument_text(ctx, 1)?) else {
            return Ok(None);
        };
        let Ok(document) = serde_json::from_str::<Value>(&document) else {
            return Ok(None);
        };
        Ok(json_value(&document, &path))
    })?;
    conn.create_scalar_function("json_search", 3, flags, |ctx| {
        let (Some(document), Some(pattern)) = (argument_text(ctx, 0)?, argument_text(ctx, 2)?) else {
            return Ok(None);
        };
        let Ok(document) = serde_json::from_str::<Value>(&document) else {
            return Ok(None);
        };
        let pattern: Vec<char> = pattern.chars().collect();
        Ok(json_search(&document, &pattern, "$".to_string()))
    })?;
    Ok(())
}

fn argument_text(ctx: &FunctionContext<'_>, index: usize) -> rusqlite::Result<Option<String>> {
    match ctx.get_raw(index) {
        ValueRef::Null => Ok(None),
        ValueRef::Integer(i) => Ok(Some(i.to_string())),
        ValueRef::Real(f) => Ok(Some(f.to_string())),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => std::str::from_utf8(bytes)
            .map(|s| Some(s.to_string()))
            .map_err(|e| rusqlite::Error::UserFunctionError(e.into())),
    }
}

enum Step {
    Member(String),
    Index(usize),
}

/// Parses `$.a."b-c"[0]` style paths.
fn parse_path(path: &str) -> Option<Vec<Step>> {
    let mut chars = path.strip_prefix('$')?.chars().peekable();
    let mut steps = Vec::new();
    while let Some(c) = chars.next() {
        match c {
            '.' => {
                let mut name = String::new();
                if chars.peek() == Some(&'"') {
                    chars.next();
                    loop {
                        match chars.next()? {
                            '"' => break,
                            c => name.push(c),
                        }
                    }
                } else {
                    while let Some(&c) = chars.peek() {
                        if c == '.' || c == '[' {
                            break;
                        }
                        name.push(c);
                        chars.next();
                    }
                }
                if name.is_empty() {
                    return None;
                }
                steps.push(Step::Member(name));
            }
            '[' => {
                let mut digits = String::new();
                loop {
                    match chars.next()? {
                        ']' => break,
                        c => digits.push(c),
                    }
                }
                steps.push(Step::Index(digits.trim().parse().ok()?));
            }
            c if c.is_whitespace() => {}
            _ => return None,
        }
    }
    Some(steps)
}

/// The scalar at `path` as text; `None` for missing, null, arrays and objects.
pub fn json_value(document: &Value, path: &str) -> Option<String> {
    let mut current = document;
    for step in parse_path(path)? {
        current = match step {
            Step::Member(name) => current.get(&name)?,
            Step::Index(i) => current.get(i)?,
        };
    }
    crate::record::scalar_text(current)
}

/// Path of the first string value matching a LIKE pattern, in document order.
fn json_search(value: &Value, pattern: &[char], path: String) -> Option<String> {
    match value {
        Value::String(s) => {
            let text: Vec<char> = s.chars().collect();
            like_match(pattern, &text).then_some(path)
        }
        Value::Array(items) => items
            .iter()
            .enumerate()
            .find_map(|(i, item)| json_search(item, pattern, format!("{path}[{i}]"))),
        Value::Object(map) => map
            .iter()
            .find_map(|(k, item)| json_search(item, pattern, format!("{path}.\"{k}\""))),
        _ => None,
    }
}

/// SQL LIKE without an ESCAPE clause: `%` any run, `_` any one character; ASCII case-insensitive.
pub fn like_match(pattern: &[char], text: &[char]) -> bool {
    let same = |a: char, b: char| a.to_ascii_lowercase() == b.to_ascii_lowercase();
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() {
            match pattern[p] {
                '%' => {
                    backtrack = Some((p, t));
                    p += 1;
                    continue;
                }
                '_' => {
                    p += 1;
                    t += 1;
                    continue;
                }
                c => {
                    if same(c, text[t]) {
                        p += 1;
                        t += 1;
                        continue;
                    }
                }
            }
        }
        match backtrack {
            Some((star, from)) => {
                p = star + 1;
                t = from + 1;
                backtrack = Some((star, from + 1));
            }
            None => return false,
        }
    }
    while p < pattern.len() && pattern[p] == '%' {
        p += 1;
    }
    p == pattern.len()
}
