//! Source contract - the remote datastore reader plus its change stream
//!
//! The physical reader is an external service. This module fixes the
//! contract the cache builds on: a bulk read that reports the stream
//! position it observed, and a blocking receive for the next change
//! batch. `None` is the absent marker, distinct from stored JSON
//! `null` bytes.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use plenum_key::Key;

use crate::error::SourceError;

/// A stored value: raw JSON bytes, or `None` for "this key does not
/// exist in the datastore at this moment".
pub type Value = Option<Bytes>;

/// A set of key/value pairs together with the change-stream position
/// at which they were observed.
///
/// Returned by both [`Source::get`] (one entry per requested key) and
/// [`Source::update`] (one entry per changed key, `None` meaning the
/// key was deleted).
#[derive(Debug, Clone, Default)]
pub struct SourceAnswer {
    /// Values keyed by datastore key
    pub values: HashMap<Key, Value>,
    /// Monotonic change-stream position
    pub position: u64,
}

/// The remote datastore reader.
///
/// Implementations wrap a remote HTTP service and a change-stream
/// transport. The cache guarantees that for any key at most one
/// `get` covering it is in flight at a time.
#[async_trait]
pub trait Source: Send + Sync + 'static {
    /// Fetch the current values of `keys` in one bulk read.
    ///
    /// The answer contains one entry per requested key; absent keys
    /// map to `None`.
    async fn get(&self, keys: &[Key]) -> Result<SourceAnswer, SourceError>;

    /// Block until the next change batch arrives.
    ///
    /// Called by a single consumer (the cache's update loop).
    async fn update(&self) -> Result<SourceAnswer, SourceError>;
}
