//! Datastore error types

use std::sync::Arc;

use plenum_key::Key;
use thiserror::Error;

/// Errors from a [`Source`](crate::Source) implementation.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The reader service could not be reached or answered non-2xx
    #[error("datastore reader request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The reader answered with a payload this service cannot parse
    #[error("datastore reader answered with a malformed payload: {0}")]
    Protocol(String),

    /// The change feed was closed by the transport
    #[error("change feed closed")]
    FeedClosed,

    /// A read was abandoned before it produced an answer
    #[error("read aborted before completion")]
    Aborted,
}

/// Errors returned from [`Datastore::get`](crate::Datastore::get).
///
/// Clonable so that all callers parked on one in-flight read receive
/// the same error.
#[derive(Debug, Clone, Error)]
pub enum DatastoreError {
    /// The underlying source read failed
    #[error("reading from source: {0}")]
    Source(Arc<SourceError>),
}

impl From<SourceError> for DatastoreError {
    fn from(err: SourceError) -> Self {
        Self::Source(Arc::new(err))
    }
}

/// Errors from the per-request [`Fetcher`](crate::Fetcher).
#[derive(Debug, Error)]
pub enum FetchError {
    /// A required key resolved to the absent marker
    #[error("{0} does not exist")]
    DoesNotExist(Key),

    /// The stored bytes do not parse as the requested shape
    #[error("decoding value of {key}: {source}")]
    Decode {
        key: Key,
        #[source]
        source: serde_json::Error,
    },

    /// Propagated reader error
    #[error("reading from datastore: {0}")]
    Source(#[from] DatastoreError),
}

impl FetchError {
    /// Whether this is the absent-value error for any key.
    pub fn is_does_not_exist(&self) -> bool {
        matches!(self, Self::DoesNotExist(_))
    }
}

/// Result alias for datastore operations.
pub type Result<T, E = DatastoreError> = std::result::Result<T, E>;
