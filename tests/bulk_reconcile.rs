use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hostdb::config::ApiConfig;
use hostdb::error::{HostdbError, Result};
use hostdb::identity::IdentityRegistry;
use hostdb::interface::HostDb;
use hostdb::persist::{SqliteStorage, Stats, Storage};
use hostdb::predicate::{Key, Limit, WhereClauses};
use hostdb::reconcile::{Outcome, Reconciler, UPSERT_ATTEMPTS};
use hostdb::record::{Record, RecordSet};
use hostdb::scope::ScopeRegistry;
use serde_json::{json, Value};

fn set(body: Value) -> RecordSet {
    serde_json::from_value(body).expect("record set")
}

fn hostdb() -> HostDb {
    HostDb::new(Arc::new(SqliteStorage::open_in_memory().unwrap()), ApiConfig::default())
}

fn all(hostdb: &HostDb) -> Vec<Record> {
    hostdb.storage().fetch(&WhereClauses::new(), &Limit::default()).unwrap().0
}

fn three_tests() -> RecordSet {
    set(json!({
        "type": "test",
        "timestamp": "0000-00-00 00:00:00",
        "context": {"test": false},
        "records": [
            {"id": "abc123", "hostname": "m1.local", "context": {"test": true}, "data": {"testing": true}},
            {"id": "def456", "hostname": "m3.local", "context": {"test": true}, "data": {"testing": true}},
            {"id": "ghi789", "hostname": "m4.local", "context": {"test": true}, "data": {"testing": true}}
        ]
    }))
}

#[test]
fn empty_batch_is_processed() {
    let hostdb = hostdb();
    let outcome = hostdb
        .reconcile(set(json!({"type": "test", "timestamp": "2024-01-01 00:00:00", "context": {}, "records": []})), "c")
        .expect("reconcile");
    assert_eq!(outcome.processed, 0);
    assert_eq!(outcome.written, 0);
}

#[test]
fn bulk_save_writes_every_record() {
    let hostdb = hostdb();
    let outcome = hostdb.reconcile(three_tests(), "10.0.0.1:1234: test-agent").unwrap();
    assert_eq!(outcome.processed, 3);
    assert_eq!(outcome.written, 3);
    assert_eq!(outcome.minted, 0);

    let stored = all(&hostdb);
    assert_eq!(stored.len(), 3);
    for record in &stored {
        assert_eq!(record.context["test"], json!(true), "record context wins over the envelope");
        assert_eq!(record.committer, "10.0.0.1:1234: test-agent");
        assert_ne!(record.timestamp, "0000-00-00 00:00:00");
        assert_eq!(record.hash, "099d2e284887764ae5afa796ab56c09c14173aac32c49bbc5514afc803497e8a");
    }
}

#[test]
fn unchanged_resubmission_writes_nothing() {
    let hostdb = hostdb();
    hostdb.reconcile(three_tests(), "c").unwrap();
    let before = all(&hostdb);
    let outcome = hostdb.reconcile(three_tests(), "c").unwrap();
    assert_eq!(outcome.written, 0);
    assert_eq!(outcome.deleted, 0);
    assert_eq!(all(&hostdb), before, "timestamps are untouched when nothing changed");
}

#[test]
fn records_missing_from_a_batch_are_deleted() {
    let hostdb = hostdb();
    hostdb.reconcile(three_tests(), "c").unwrap();
    let outcome = hostdb
        .reconcile(
            set(json!({
                "type": "test",
                "timestamp": "2024-01-01 00:00:00",
                "context": {"test": true},
                "records": [
                    {"id": "ghi789", "hostname": "m4.local", "data": {"testing": true}},
                    {"hostname": "m2.local", "data": {"testing": true}}
                ]
            })),
            "c",
        )
        .unwrap();
    assert_eq!(outcome.processed, 2);
    assert_eq!(outcome.minted, 1);
    assert_eq!(outcome.deleted, 2);

    let stored = all(&hostdb);
    assert_eq!(stored.len(), 2);
    assert!(stored.iter().any(|r| r.id == "ghi789"));
    assert!(stored.iter().any(|r| r.hostname == "m2.local" && r.id.starts_with("hdb-")));
}

#[test]
fn record_level_fields_override_the_envelope() {
    let hostdb = hostdb();
    hostdb
        .reconcile(
            set(json!({
                "type": "test",
                "timestamp": "2024-01-01 00:00:00",
                "committer": "testing",
                "context": {"test": true},
                "records": [
                    {"type": "test-regular", "hostname": "r.local", "data": {"q": "a b"}},
                    {"type": "test-urlencode", "hostname": "u.local", "data": {"q": "a%20b&c=d"}}
                ]
            })),
            "c",
        )
        .unwrap();
    let stored = all(&hostdb);
    assert_eq!(stored.len(), 2);
    let types: Vec<&str> = stored.iter().map(|r| r.record_type.as_str()).collect();
    assert!(types.contains(&"test-regular"));
    assert!(types.contains(&"test-urlencode"));
    for record in &stored {
        assert_eq!(record.committer, "testing");
        assert_eq!(record.context.len(), 1);
        assert_eq!(record.context["test"], json!(true));
    }
}

#[test]
fn identity_property_resolves_records_without_ids() {
    let hostdb = hostdb();
    let vpcs = |cidr: &str| {
        set(json!({
            "type": "aws-vpc",
            "timestamp": "2024-01-01 00:00:00",
            "context": {"aws-account-id": "111", "aws-region": "eu-west-1"},
            "records": [{"data": {"VpcId": "vpc-1", "CidrBlock": cidr}}]
        }))
    };
    let first = hostdb.reconcile(vpcs("10.0.0.0/16"), "c").unwrap();
    assert_eq!(first.minted, 1);
    let id = all(&hostdb)[0].id.clone();

    let again = hostdb.reconcile(vpcs("10.0.0.0/16"), "c").unwrap();
    assert_eq!(again.minted, 0);
    assert_eq!(again.written, 0);

    let changed = hostdb.reconcile(vpcs("10.9.0.0/16"), "c").unwrap();
    assert_eq!(changed.written, 1);
    let stored = all(&hostdb);
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, id, "the stored id is kept");
    assert_eq!(stored[0].data["CidrBlock"], json!("10.9.0.0/16"));
}

#[test]
fn scope_is_limited_to_the_submitting_account() {
    let hostdb = hostdb();
    let account = |id: &str, vpc: &str| {
        set(json!({
            "type": "aws-vpc",
            "timestamp": "2024-01-01 00:00:00",
            "context": {"aws-account-id": id, "aws-region": "eu-west-1"},
            "records": [{"data": {"VpcId": vpc}}]
        }))
    };
    hostdb.reconcile(account("111", "vpc-a"), "c").unwrap();
    hostdb.reconcile(account("222", "vpc-b"), "c").unwrap();
    assert_eq!(all(&hostdb).len(), 2, "another account's records are out of scope");

    let outcome = hostdb
        .reconcile(
            set(json!({
                "type": "aws-vpc",
                "timestamp": "2024-01-01 00:00:00",
                "context": {"aws-account-id": "111", "aws-region": "eu-west-1"},
                "records": []
            })),
            "c",
        )
        .unwrap();
    assert_eq!(outcome.deleted, 1);
    let left = all(&hostdb);
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].context["aws-account-id"], json!("222"));
}

#[test]
fn scope_is_limited_to_the_type() {
    let hostdb = hostdb();
    hostdb.reconcile(three_tests(), "c").unwrap();
    hostdb
        .reconcile(
            set(json!({
                "type": "other",
                "timestamp": "2024-01-01 00:00:00",
                "context": {"test": true},
                "records": []
            })),
            "c",
        )
        .unwrap();
    assert_eq!(all(&hostdb).len(), 3);
}

#[test]
fn ties_resolve_to_the_first_stored_id() {
    let hostdb = hostdb();
    for id in ["b-dup", "a-dup"] {
        let record = Record {
            record_type: "test".into(),
            hostname: "same.local".into(),
            context: serde_json::from_value(json!({"test": true})).unwrap(),
            data: json!({"v": id}),
            ..Default::default()
        };
        hostdb.save(id, record, "seed").unwrap();
    }
    let outcome = hostdb
        .reconcile(
            set(json!({
                "type": "test",
                "timestamp": "2024-01-01 00:00:00",
                "context": {"test": true},
                "records": [{"hostname": "same.local", "data": {"v": "new"}}]
            })),
            "c",
        )
        .unwrap();
    assert_eq!(outcome.minted, 0);
    assert_eq!(outcome.deleted, 1);
    let stored = all(&hostdb);
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, "a-dup");
}

#[test]
fn required_context_is_enforced() {
    let hostdb = hostdb();
    let err = hostdb
        .reconcile(
            set(json!({
                "type": "aws-vpc",
                "timestamp": "2024-01-01 00:00:00",
                "context": {"aws-account-id": "111"},
                "records": []
            })),
            "c",
        )
        .unwrap_err();
    assert_eq!(err.to_string(), "missing context value for aws-region");
    assert_eq!(err.status(), 400);

    let err = hostdb
        .reconcile(
            set(json!({
                "type": "vrops-vmware",
                "timestamp": "2024-01-01 00:00:00",
                "context": {"vc_url": ""},
                "records": []
            })),
            "c",
        )
        .unwrap_err();
    assert_eq!(err.to_string(), "missing context value for vc_url", "blank values do not count");
}

#[test]
fn envelope_errors_write_nothing() {
    let hostdb = hostdb();
    let err = hostdb
        .reconcile(
            set(json!({
                "type": "test",
                "timestamp": "2024-01-01 00:00:00",
                "context": {"test": true},
                "records": [{"hostname": "a"}]
            })),
            "c",
        )
        .unwrap_err();
    assert_eq!(err.to_string(), "data payload/element is missing from one or more records");
    assert!(all(&hostdb).is_empty());
}

/// Wraps the SQLite backend, failing upserts or deletes on demand.
struct Flaky {
    inner: SqliteStorage,
    transient_upserts: usize,
    upserts: AtomicUsize,
    fail_deletes: bool,
}

impl Flaky {
    fn new(transient_upserts: usize, fail_deletes: bool) -> Self {
        Self {
            inner: SqliteStorage::open_in_memory().unwrap(),
            transient_upserts,
            upserts: AtomicUsize::new(0),
            fail_deletes,
        }
    }
}

impl Storage for Flaky {
    fn fetch(&self, clauses: &WhereClauses, limit: &Limit) -> Result<(Vec<Record>, u64)> {
        self.inner.fetch(clauses, limit)
    }
    fn get(&self, id: &str) -> Result<Option<Record>> {
        self.inner.get(id)
    }
    fn upsert(&self, records: &[Record]) -> Result<()> {
        let attempt = self.upserts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.transient_upserts {
            return Err(HostdbError::TransientStorage("database is locked".into()));
        }
        self.inner.upsert(records)
    }
    fn delete(&self, id: &str) -> Result<()> {
        if self.fail_deletes {
            return Err(HostdbError::Storage(format!("cannot delete {id}")));
        }
        self.inner.delete(id)
    }
    fn distinct_values(&self, key: &Key, clauses: &WhereClauses, frequency: bool) -> Result<Vec<(String, u64)>> {
        self.inner.distinct_values(key, clauses, frequency)
    }
    fn stats(&self) -> Result<Stats> {
        self.inner.stats()
    }
}

fn reconcile_with(storage: &dyn Storage, set: RecordSet) -> Result<Outcome> {
    let config = ApiConfig::default();
    let identities = IdentityRegistry::default();
    let scopes = ScopeRegistry::default();
    Reconciler::new(storage, &config, &identities, &scopes).reconcile(set, "c")
}

#[test]
fn transient_upsert_failures_are_retried() {
    let storage = Flaky::new(UPSERT_ATTEMPTS - 1, false);
    let outcome = reconcile_with(&storage, three_tests()).expect("last attempt succeeds");
    assert_eq!(outcome.written, 3);
    assert_eq!(storage.upserts.load(Ordering::SeqCst), UPSERT_ATTEMPTS);
}

#[test]
fn retries_give_up_after_the_last_attempt() {
    let storage = Flaky::new(usize::MAX, false);
    let err = reconcile_with(&storage, three_tests()).unwrap_err();
    assert!(err.is_transient());
    assert_eq!(storage.upserts.load(Ordering::SeqCst), UPSERT_ATTEMPTS);
}

#[test]
fn delete_failures_are_aggregated_after_the_upsert() {
    let storage = Flaky::new(0, true);
    reconcile_with(&storage, three_tests()).unwrap();
    let err = reconcile_with(
        &storage,
        set(json!({"type": "test", "timestamp": "2024-01-01 00:00:00", "context": {"test": true}, "records": []})),
    )
    .unwrap_err();
    match err {
        HostdbError::Aggregate { failed, .. } => assert_eq!(failed, 3),
        other => panic!("expected an aggregate error, got {other:?}"),
    }
    assert_eq!(storage.inner.fetch(&WhereClauses::new(), &Limit::default()).unwrap().1, 3);
}

/// Runs a second submission right after the first one has read its candidates.
struct Interleaved {
    inner: SqliteStorage,
    during_fetch: std::sync::Mutex<Option<RecordSet>>,
}

impl Storage for Interleaved {
    fn fetch(&self, clauses: &WhereClauses, limit: &Limit) -> Result<(Vec<Record>, u64)> {
        let fetched = self.inner.fetch(clauses, limit)?;
        let pending = self.during_fetch.lock().unwrap().take();
        if let Some(other) = pending {
            reconcile_with(&self.inner, other).expect("overlapping submission");
        }
        Ok(fetched)
    }
    fn get(&self, id: &str) -> Result<Option<Record>> {
        self.inner.get(id)
    }
    fn upsert(&self, records: &[Record]) -> Result<()> {
        self.inner.upsert(records)
    }
    fn delete(&self, id: &str) -> Result<()> {
        self.inner.delete(id)
    }
    fn distinct_values(&self, key: &Key, clauses: &WhereClauses, frequency: bool) -> Result<Vec<(String, u64)>> {
        self.inner.distinct_values(key, clauses, frequency)
    }
    fn stats(&self) -> Result<Stats> {
        self.inner.stats()
    }
}

// Known race: submissions for one scope are not serialised. Both read the
// same candidates, so the stale one fails to delete what the other already
// removed and neither removes the other's new record.
#[test]
fn overlapping_submissions_race() {
    let batch = |hostname: &str| {
        set(json!({
            "type": "test",
            "timestamp": "2024-01-01 00:00:00",
            "context": {"test": true},
            "records": [{"hostname": hostname, "data": {"h": hostname}}]
        }))
    };
    let storage = Interleaved {
        inner: SqliteStorage::open_in_memory().unwrap(),
        during_fetch: std::sync::Mutex::new(None),
    };
    reconcile_with(&storage.inner, batch("h1.local")).unwrap();

    *storage.during_fetch.lock().unwrap() = Some(batch("h3.local"));
    let err = reconcile_with(&storage, batch("h2.local")).unwrap_err();
    assert!(matches!(err, HostdbError::Aggregate { failed: 1, .. }));

    let (left, total) = storage.inner.fetch(&WhereClauses::new(), &Limit::default()).unwrap();
    assert_eq!(total, 2, "run one after the other, only the last batch would remain");
    let hostnames: Vec<&str> = left.iter().map(|r| r.hostname.as_str()).collect();
    assert!(hostnames.contains(&"h2.local"));
    assert!(hostnames.contains(&"h3.local"));
}
