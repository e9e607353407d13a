//! HostDB – a catalog of infrastructure records gathered by collectors.
//!
//! Collectors submit whole batches of records for one *scope* (a record type,
//! optionally narrowed by vendor context such as an AWS account or a vCenter
//! URL). The service reconciles each batch against what it already stores:
//! records are matched by id or by a per-type identity property, only changed
//! payloads are rewritten, and stored records the batch no longer mentions are
//! removed.
//!
//! ## Modules
//! * [`record`] – The [`record::Record`] and [`record::RecordSet`] shapes, payload hashing and validation.
//! * [`mapping`] – Query parameter names mapped onto table columns and JSON paths.
//! * [`predicate`] – Typed WHERE clauses that render to parameterised SQL.
//! * [`compiler`] – Turns URL query parameters into [`predicate::WhereClauses`].
//! * [`catalog`] – Distinct values of a query parameter, optionally with frequencies.
//! * [`identity`] – Which payload property identifies a record of a given type.
//! * [`scope`] – The stored records a submission is reconciled against.
//! * [`change`] – Whether an incoming record differs from its stored counterpart.
//! * [`reconcile`] – The bulk submission algorithm.
//! * [`persist`] – The [`persist::Storage`] seam and its SQLite implementation.
//! * [`interface`] – The [`interface::HostDb`] facade the HTTP layer calls.
//! * [`server`] – The axum router.
//!
//! ## Configuration
//! [`config::GlobalConfig`] layers built-in defaults, optional YAML/TOML/JSON
//! files (`/etc/hostdb/config.*`, `./config.*`) and `HOSTDB_*` environment
//! variables.

pub mod catalog;
pub mod change;
pub mod compiler;
pub mod config;
pub mod error;
pub mod identity;
pub mod interface;
pub mod mapping;
pub mod observability;
pub mod persist;
pub mod predicate;
pub mod record;
pub mod reconcile;
pub mod scope;
pub mod server;
