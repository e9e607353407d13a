//! Bulk reconciliation.
//!
//! Makes the stored records of one scope match a submitted [`RecordSet`]:
//! incoming records are resolved to stored ones (by id, or by the identity
//! registry), changed and new ones are upserted as one batch, and stored
//! records the submission no longer mentions are deleted.
//!
//! Two submissions for the same scope are not serialised against each other.
//! Both read the candidate set before either writes, so they can claim the same
//! stored record or delete what the other just wrote.

use tracing::{debug, info, warn};

use crate::change::anything_changed;
use crate::config::ApiConfig;
use crate::error::{HostdbError, Result};
use crate::identity::IdentityRegistry;
use crate::persist::Storage;
use crate::predicate::Limit;
use crate::record::{mint_id, Record, RecordSet};
use crate::scope::ScopeRegistry;

/// Attempts for the batch upsert when the backend reports lock contention.
pub const UPSERT_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Outcome {
    /// Records in the submission, written or not.
    pub processed: usize,
    pub written: usize,
    pub deleted: usize,
    pub minted: usize,
}

pub struct Reconciler<'a> {
    storage: &'a dyn Storage,
    config: &'a ApiConfig,
    identities: &'a IdentityRegistry,
    scopes: &'a ScopeRegistry,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        storage: &'a dyn Storage,
        config: &'a ApiConfig,
        identities: &'a IdentityRegistry,
        scopes: &'a ScopeRegistry,
    ) -> Self {
        Self { storage, config, identities, scopes }
    }

    /// Runs a submission. `caller` is the committer used when the envelope names none.
    pub fn reconcile(&self, mut set: RecordSet, caller: &str) -> Result<Outcome> {
        set.validate(caller)?;
        for key in self.config.required_context(&set.record_type) {
            if !set.context().contains_key(key) {
                return Err(HostdbError::validation(format!("missing context value for {key}")));
            }
        }
        let scope = self
            .scopes
            .scope_for(&set.record_type, set.context(), &self.config.query_params)?;
        let (mut candidates, _) = self.storage.fetch(&scope, &Limit::default())?;
        debug!(record_type = %set.record_type, candidates = candidates.len(), "scope fetched");

        let mut outcome = Outcome { processed: set.records.len(), ..Default::default() };
        let mut replacements: Vec<Record> = Vec::new();
        for mut record in std::mem::take(&mut set.records) {
            record.backfill(&set);
            record.rehash()?;
            record.ensure_complete()?;

            let existing = if record.id.is_empty() {
                match self.claim(&record, &candidates) {
                    Some(found) => {
                        record.id = found.id.clone();
                        Some(found)
                    }
                    None => None,
                }
            } else {
                self.storage.get(&record.id)?
            };
            if record.id.is_empty() {
                record.id = mint_id();
                outcome.minted += 1;
            }
            if anything_changed(&record, existing.as_ref()) {
                replacements.push(record.clone());
            }
            candidates.retain(|c| c.id != record.id);
        }

        self.upsert_with_retry(&replacements)?;
        outcome.written = replacements.len();

        let mut failed = Vec::new();
        for abandoned in &candidates {
            match self.storage.delete(&abandoned.id) {
                Ok(()) => outcome.deleted += 1,
                Err(e) => {
                    warn!(id = %abandoned.id, error = %e, "delete failed, continuing");
                    failed.push(abandoned.id.clone());
                }
            }
        }
        info!(
            record_type = %set.record_type,
            processed = outcome.processed,
            written = outcome.written,
            deleted = outcome.deleted,
            minted = outcome.minted,
            "reconciled"
        );
        if !failed.is_empty() {
            return Err(HostdbError::Aggregate {
                failed: failed.len(),
                message: format!("deleting one or more records failed: {}", failed.join(", ")),
            });
        }
        Ok(outcome)
    }

    /// The first candidate sharing the record's identity. Ties are logged; the
    /// first in storage order (by id) wins.
    fn claim(&self, record: &Record, candidates: &[Record]) -> Option<Record> {
        let rule = self.identities.rule_for(&record.record_type);
        let mut matches = candidates.iter().filter(|c| rule.same_identity(record, c));
        let first = matches.next()?;
        let tied: Vec<&str> = matches.map(|c| c.id.as_str()).collect();
        if !tied.is_empty() {
            warn!(
                record_type = %record.record_type,
                chosen = %first.id,
                ?tied,
                "several stored records share this identity, taking the first"
            );
        }
        Some(first.clone())
    }

    fn upsert_with_retry(&self, records: &[Record]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut attempt = 1;
        loop {
            match self.storage.upsert(records) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < UPSERT_ATTEMPTS => {
                    warn!(attempt, error = %e, "bulk upsert hit lock contention, retrying");
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        warn!(attempts = attempt, "maximum number of upsert attempts reached");
                    }
                    return Err(e);
                }
            }
        }
    }
}
