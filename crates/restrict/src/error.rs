//! Restriction error types

use plenum_datastore::FetchError;
use thiserror::Error;

/// Errors from the restriction engine.
///
/// Missing permissions are never errors; they suppress or redact the
/// affected keys. Errors here mean the engine itself could not read
/// the data it needs.
#[derive(Debug, Error)]
pub enum RestrictError {
    /// Reading permission data failed
    #[error("reading permission data: {0}")]
    Fetch(#[from] FetchError),
}

/// Result alias for restriction operations.
pub type Result<T, E = RestrictError> = std::result::Result<T, E>;
