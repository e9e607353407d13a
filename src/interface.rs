//! The service facade.
//!
//! [`HostDb`] wires an injected [`Storage`] backend and the `api.v0`
//! configuration to the operations the HTTP layer exposes. It holds no
//! mutable state of its own, so one instance serves concurrent requests.

use std::sync::Arc;

use tracing::{debug, info};

use crate::catalog::{self, Catalog};
use crate::compiler::{compile, ParamMap};
use crate::config::ApiConfig;
use crate::error::{HostdbError, Result};
use crate::identity::IdentityRegistry;
use crate::persist::{Stats, Storage};
use crate::reconcile::{Outcome, Reconciler};
use crate::record::Record;
use crate::scope::ScopeRegistry;

/// Query parameter naming the fields the list view keeps.
pub const FIELDS_PARAM: &str = "_fields";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    /// Ordered by id.
    pub records: Vec<Record>,
    /// Matches before pagination.
    pub total: u64,
}

pub struct HostDb {
    storage: Arc<dyn Storage>,
    config: ApiConfig,
    identities: IdentityRegistry,
    scopes: ScopeRegistry,
}

impl HostDb {
    pub fn new(storage: Arc<dyn Storage>, config: ApiConfig) -> Self {
        Self::with_registries(storage, config, IdentityRegistry::default(), ScopeRegistry::default())
    }

    pub fn with_registries(
        storage: Arc<dyn Storage>,
        config: ApiConfig,
        identities: IdentityRegistry,
        scopes: ScopeRegistry,
    ) -> Self {
        Self { storage, config, identities, scopes }
    }

    pub fn api_config(&self) -> &ApiConfig {
        &self.config
    }

    pub fn storage(&self) -> &dyn Storage {
        self.storage.as_ref()
    }

    /// Records matching the parameters, with full detail.
    pub fn query(&self, params: &ParamMap) -> Result<QueryResult> {
        let compiled = compile(params, &self.config.query_params)?;
        let (records, total) = self.storage.fetch(&compiled.clauses, &compiled.limit)?;
        debug!(returned = records.len(), total, "query");
        Ok(QueryResult { records, total })
    }

    /// Like [`HostDb::query`], with each record cut down to the `_fields` named
    /// by the caller or to the configured list fields.
    pub fn list(&self, params: &ParamMap) -> Result<QueryResult> {
        let mut result = self.query(params)?;
        let fields = self.list_fields(params);
        for record in result.records.iter_mut() {
            *record = record.project(&fields);
        }
        Ok(result)
    }

    /// The fields a list response keeps: `_fields` (comma separated, repeatable) or the defaults.
    pub fn list_fields(&self, params: &ParamMap) -> Vec<String> {
        let requested: Vec<String> = params
            .get(FIELDS_PARAM)
            .into_iter()
            .flatten()
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(String::from)
            .collect();
        if requested.is_empty() {
            self.config.list_fields.clone()
        } else {
            requested
        }
    }

    pub fn detail(&self, id: &str) -> Result<Record> {
        self.storage
            .get(id)?
            .ok_or_else(|| HostdbError::not_found(format!("record not found: {id}")))
    }

    pub fn catalog(&self, item: &str, frequency: bool, filter: Option<&str>) -> Result<Catalog> {
        catalog::aggregate(self.storage.as_ref(), &self.config.query_params, item, frequency, filter)
    }

    pub fn reconcile(&self, set: crate::record::RecordSet, caller: &str) -> Result<Outcome> {
        Reconciler::new(self.storage.as_ref(), &self.config, &self.identities, &self.scopes).reconcile(set, caller)
    }

    /// Stores a single record under `id`, which overrides any id in the body.
    pub fn save(&self, id: &str, mut record: Record, caller: &str) -> Result<String> {
        if id.is_empty() {
            return Err(HostdbError::validation("no id provided"));
        }
        record.id = id.to_string();
        if record.committer.is_empty() {
            record.committer = caller.to_string();
        }
        record.rehash()?;
        record.ensure_complete()?;
        self.storage.upsert(std::slice::from_ref(&record))?;
        info!(id = %record.id, record_type = %record.record_type, "record saved");
        Ok(record.id)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(HostdbError::validation("no id provided"));
        }
        self.storage.delete(id)?;
        info!(%id, "record deleted");
        Ok(())
    }

    pub fn stats(&self) -> Result<Stats> {
        self.storage.stats()
    }
}
