//! Error taxonomy for the reporting engine.
//!
//! Every fallible operation in the crate returns [`WardenResult`]. Helper
//! functions never swallow errors; the per-unit invocation boundary owned
//! by the embedding scheduler is the only place where catch-and-log is
//! appropriate.

use thiserror::Error;

/// Crate-wide result alias.
pub type WardenResult<T> = Result<T, WardenError>;

#[derive(Error, Debug)]
pub enum WardenError {
    /// Malformed filter rule or invalid engine settings. Fatal at setup
    /// time, before any event is touched.
    #[error("configuration error: {0}")]
    Config(String),

    /// Event store or thresholding cache backend failure. Fatal for the
    /// current reporting unit; the unit is retryable wholesale on the next
    /// scheduled run.
    #[error("storage error: {0}")]
    Storage(String),

    /// Uniqueness conflict in the storage backend. An expected signal for
    /// the thresholding cache (a record already exists for the key); not a
    /// failure of the reporting unit.
    #[error("storage integrity conflict: {0}")]
    StorageIntegrity(String),

    /// An event or statistical record does not fit the constructed
    /// timeline. Indicates a caller bug in window construction.
    #[error("data inconsistency: {0}")]
    DataInconsistency(String),

    /// Report mail delivery failure surfaced from the mailer collaborator.
    #[error("mail delivery error: {0}")]
    Mail(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}
