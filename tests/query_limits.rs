use std::sync::Arc;

use hostdb::compiler::group_params;
use hostdb::config::ApiConfig;
use hostdb::interface::HostDb;
use hostdb::persist::SqliteStorage;
use hostdb::record::Record;
use serde_json::json;

fn seeded(count: usize) -> HostDb {
    let storage = SqliteStorage::open_in_memory().expect("storage");
    let hostdb = HostDb::new(Arc::new(storage), ApiConfig::default());
    for i in 0..count {
        let record = Record {
            record_type: "test".into(),
            hostname: format!("m{i}.local"),
            context: serde_json::from_value(json!({"test": true})).unwrap(),
            data: json!({"n": i}),
            ..Default::default()
        };
        hostdb.save(&format!("t{i:02}"), record, "seed").expect("save");
    }
    hostdb
}

#[test]
fn limit_bounds_results_but_not_count() {
    let hostdb = seeded(22);
    let result = hostdb.query(&group_params([("type", "test"), ("_limit", "7")])).unwrap();
    assert_eq!(result.records.len(), 7);
    assert_eq!(result.total, 22, "count ignores pagination");
}

#[test]
fn offset_follows_id_order() {
    let hostdb = seeded(12);
    let result = hostdb.query(&group_params([("_limit", "3"), ("_offset", "5")])).unwrap();
    let ids: Vec<&str> = result.records.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["t05", "t06", "t07"]);

    let tail = hostdb.query(&group_params([("_offset", "10")])).unwrap();
    assert_eq!(tail.records.len(), 2, "offset alone pages to the end");
}

#[test]
fn negative_limit_is_rejected() {
    let hostdb = seeded(1);
    let err = hostdb.query(&group_params([("_limit", "-1")])).unwrap_err();
    assert_eq!(err.status(), 400);
}

#[test]
fn list_projects_fields() {
    let hostdb = seeded(2);
    let listed = hostdb.list(&group_params([("_fields", "id,timestamp,hash")])).unwrap();
    for record in &listed.records {
        assert!(!record.id.is_empty());
        assert!(!record.timestamp.is_empty());
        assert!(!record.hash.is_empty());
        assert!(record.hostname.is_empty());
        assert!(record.context.is_empty());
        assert!(record.data.is_null());
    }

    let defaults = hostdb.list(&group_params(Vec::<(String, String)>::new())).unwrap();
    assert_eq!(defaults.records[0].record_type, "test");
    assert!(defaults.records[0].hash.is_empty(), "hash is not a default list field");
}

#[test]
fn search_matches_payload_text() {
    let hostdb = seeded(3);
    let found = hostdb.query(&group_params([("_search", "m1.loc")])).unwrap();
    assert_eq!(found.total, 1);
    let excluded = hostdb.query(&group_params([("!_search", "m1.loc")])).unwrap();
    assert_eq!(excluded.total, 2);
}

#[test]
fn search_treats_backslashes_literally() {
    let hostdb = seeded(0);
    for (id, hostname, path) in [("w1", "win\\host", "C:\\temp"), ("w2", "other", "/tmp")] {
        let record = Record {
            record_type: "test".into(),
            hostname: hostname.into(),
            context: serde_json::from_value(json!({"test": true})).unwrap(),
            data: json!({"path": path}),
            ..Default::default()
        };
        hostdb.save(id, record, "seed").unwrap();
    }

    let column = hostdb.query(&group_params([("_search", "win\\host")])).unwrap();
    assert_eq!(column.total, 1);
    let payload = hostdb.query(&group_params([("_search", "C:\\temp")])).unwrap();
    assert_eq!(payload.total, 1);
    assert_eq!(payload.records[0].id, "w1");
    let excluded = hostdb.query(&group_params([("!_search", "C:\\temp")])).unwrap();
    assert_eq!(excluded.total, 1);
    assert_eq!(excluded.records[0].id, "w2");
}
