use thiserror::Error;

#[derive(Error, Debug)]
pub enum HostdbError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("Transient storage error: {0}")]
    TransientStorage(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Lock poisoned: {0}")]
    Lock(String),
    #[error("{failed} deletion(s) failed: {message}")]
    Aggregate { failed: usize, message: String },
}

pub type Result<T> = std::result::Result<T, HostdbError>;

impl HostdbError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }
    /// Lock and contention signals from the backend; the bulk upsert retries on these.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientStorage(_))
    }
    /// HTTP status class: client errors for validation and missing things, server errors otherwise.
    pub fn status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::NotFound(_) => 404,
            _ => 500,
        }
    }
}

// Helper conversions
impl From<rusqlite::Error> for HostdbError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
                Self::TransientStorage(e.to_string())
            }
            _ => Self::Storage(e.to_string()),
        }
    }
}
impl From<serde_json::Error> for HostdbError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
impl From<config::ConfigError> for HostdbError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}
impl From<std::io::Error> for HostdbError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
impl<T> From<std::sync::PoisonError<T>> for HostdbError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::Lock(e.to_string())
    }
}
