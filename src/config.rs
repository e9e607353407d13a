//! Service configuration.
//!
//! Values are layered: built-in defaults, then `/etc/hostdb/config.*`, then
//! `./config.*`, then `HOSTDB_*` environment variables, then the two
//! deployment overrides for the listening port and the SQLite path.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::mapping::{Column, FieldLocation, FieldMapping};

pub const ENV_PREFIX: &str = "HOSTDB";
pub const PORT_OVERRIDE: &str = "HOSTDB_HOSTDB_SERVER_SERVICE_PORT";
pub const SQLITE_PATH_OVERRIDE: &str = "HOSTDB_SQLITE_PATH";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub hostdb: ServerConfig,
    #[serde(default)]
    pub sqlite: SqliteConfig,
    #[serde(default)]
    pub api: ApiVersions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: default_host(), port: default_port(), debug: false, url: String::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteConfig {
    /// Database file; in-memory when absent.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self { path: None, busy_timeout_ms: default_busy_timeout() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiVersions {
    #[serde(default)]
    pub v0: ApiConfig,
}

/// The `api.v0` block: everything the request handling core reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Supported query parameters and where each one is stored per record type.
    #[serde(default)]
    pub query_params: FieldMapping,
    /// Context keys a bulk submission of a given type must carry.
    #[serde(default)]
    pub context_fields: BTreeMap<String, Vec<String>>,
    /// Fields returned by the list view when the caller names none.
    #[serde(default)]
    pub list_fields: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_busy_timeout() -> u64 {
    5000
}

impl Default for ApiConfig {
    fn default() -> Self {
        let mut params = FieldMapping::new();
        for column in [
            Column::Id,
            Column::Type,
            Column::Hostname,
            Column::Ip,
            Column::Timestamp,
            Column::Committer,
        ] {
            params.declare(column.as_str(), "hostdb", FieldLocation::table(column));
        }
        params
            .declare("test", "test", FieldLocation::context(".test"))
            .declare("aws-region", "aws", FieldLocation::context(".\"aws-region\""))
            .declare("aws-account-id", "aws", FieldLocation::context(".\"aws-account-id\""))
            .declare("oneview_url", "oneview", FieldLocation::context(".oneview_url"))
            .declare("tenant", "openstack", FieldLocation::context(".tenant_name"))
            .declare("ucs_url", "ucs", FieldLocation::context(".ucs_url"))
            .declare("vc_url", "vrops-vmware", FieldLocation::context(".vc_url"))
            .declare("name", "aws", FieldLocation::data(".Name"))
            .declare("name", "openstack", FieldLocation::data(".name"))
            .declare("name", "vrops-vmware", FieldLocation::data(".resourceKey.name"))
            .declare("vpc-id", "aws", FieldLocation::data(".VpcId"))
            .declare("image-id", "aws", FieldLocation::data(".ImageId"))
            .declare("uri", "oneview", FieldLocation::data(".uri"))
            .declare("dn", "ucs", FieldLocation::data(".dn"))
            .declare("serial", "ucs", FieldLocation::data(".serial"))
            .declare("resource-id", "vrops-vmware", FieldLocation::data(".resourceId"))
            .declare("status", "openstack", FieldLocation::data(".status"))
            .declare("flavor", "openstack", FieldLocation::data(".flavor.original_name"));

        let context_fields = [
            ("aws", vec!["aws-account-id", "aws-region"]),
            ("oneview", vec!["oneview_url"]),
            ("openstack", vec!["tenant_name"]),
            ("ucs", vec!["ucs_url"]),
            ("vrops-vmware", vec!["vc_url"]),
        ]
        .into_iter()
        .map(|(t, keys)| (t.to_string(), keys.into_iter().map(String::from).collect()))
        .collect();

        Self {
            query_params: params,
            context_fields,
            list_fields: ["id", "type", "hostname", "ip", "timestamp"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl ApiConfig {
    /// Required context keys for a record type: an exact entry wins, otherwise
    /// the first entry whose name is contained in the type.
    pub fn required_context(&self, record_type: &str) -> &[String] {
        if let Some(keys) = self.context_fields.get(record_type) {
            return keys;
        }
        self.context_fields
            .iter()
            .find(|(name, _)| record_type.contains(name.as_str()))
            .map(|(_, keys)| keys.as_slice())
            .unwrap_or(&[])
    }
}

impl GlobalConfig {
    /// Loads the layered configuration.
    pub fn load() -> Result<Self> {
        Self::load_from(&["/etc/hostdb/config", "config"])
    }

    /// Loads defaults, then each named file (all optional), then the environment.
    pub fn load_from(files: &[&str]) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&GlobalConfig::default())?);
        for file in files {
            builder = builder.add_source(config::File::with_name(file).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );
        if let Ok(port) = std::env::var(PORT_OVERRIDE) {
            info!(%port, "overriding hostdb port");
            builder = builder.set_override("hostdb.port", port)?;
        }
        if let Ok(path) = std::env::var(SQLITE_PATH_OVERRIDE) {
            info!(%path, "overriding sqlite path");
            builder = builder.set_override("sqlite.path", path)?;
        }
        Ok(builder.build()?.try_deserialize()?)
    }
}
