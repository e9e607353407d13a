//! Change detection between an incoming record and the stored record it resolved to.

use tracing::debug;

use crate::record::Record;

/// True when the incoming record must be written: it is new, its payload hash
/// differs, or its context differs key by key.
pub fn anything_changed(incoming: &Record, existing: Option<&Record>) -> bool {
    let Some(existing) = existing else {
        return true;
    };
    if incoming.hash != existing.hash {
        debug!(id = %incoming.id, "payload hash changed");
        return true;
    }
    if incoming.context != existing.context {
        debug!(id = %incoming.id, "context changed");
        return true;
    }
    false
}
