use hostdb::config::{ApiConfig, GlobalConfig};
use hostdb::predicate::Key;

#[test]
fn defaults_without_files() {
    let config = GlobalConfig::load_from(&[]).expect("defaults load");
    assert_eq!(config.hostdb.port, 8080);
    assert!(config.sqlite.path.is_none());
    assert!(config.api.v0.query_params.contains("aws-account-id"));
    assert_eq!(config.api.v0.list_fields, ApiConfig::default().list_fields);
}

#[test]
fn missing_files_are_skipped() {
    let config = GlobalConfig::load_from(&["/nonexistent/hostdb/config"]).expect("optional files");
    assert_eq!(config.hostdb.host, "0.0.0.0");
}

#[test]
fn file_values_layer_over_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hostdb.yaml");
    std::fs::write(
        &path,
        r#"
hostdb:
  port: 9090
  debug: true
sqlite:
  path: /var/lib/hostdb/hostdb.sqlite3
api:
  v0:
    query_params:
      rack:
        netbox:
          data: .rack.name
    list_fields: [id, hostname]
"#,
    )
    .unwrap();
    let config = GlobalConfig::load_from(&[path.to_str().unwrap()]).expect("load");
    assert_eq!(config.hostdb.port, 9090);
    assert!(config.hostdb.debug);
    assert_eq!(config.sqlite.path.as_deref(), Some("/var/lib/hostdb/hostdb.sqlite3"));
    assert_eq!(config.api.v0.list_fields, vec!["id", "hostname"]);

    let params = &config.api.v0.query_params;
    assert_eq!(params.key_for("rack", "netbox"), Some(Key::Data(".rack.name".into())));
    assert!(params.contains("aws-region"), "built-in params remain");
}

#[test]
fn required_context_lookup() {
    let config = ApiConfig::default();
    assert_eq!(config.required_context("aws-vpc"), ["aws-account-id", "aws-region"]);
    assert_eq!(config.required_context("openstack"), ["tenant_name"]);
    assert_eq!(config.required_context("vrops-vmware-vm"), ["vc_url"]);
    assert!(config.required_context("test").is_empty());
}
