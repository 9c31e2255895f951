//! Plenum - Autoupdate
//!
//! The service at the heart of the system: clients subscribe with a
//! declarative request and receive an initial snapshot followed by
//! restricted deltas until they disconnect.
//!
//! # Per-subscriber loop
//!
//! ```text
//! repeat:
//!   keys    := keysbuilder.expand(request)      // restricted reads
//!   values  := datastore.get(keys)
//!   visible := restricter.restrict(user, values)
//!   emit      visible minus previously-sent (byte-wise)
//!   park      until a change touches a relevant key
//! ```
//!
//! The relevant key set covers the emitted keys, the keys the
//! expansion read and the keys restriction read, so permission
//! changes wake the connection like data changes do. Computed-field
//! dependencies are covered transparently: the datastore includes
//! invalidated computed keys in every update batch.

mod connection;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use plenum_datastore::{BoxError, Datastore, Fetcher, Value};
use plenum_key::Key;
use plenum_keysbuilder::{KeyRequest, KeysBuilder, ValueLoader};
use plenum_restrict::Restricter;

pub use connection::{Connection, ConnectionError, Frame, encode_frame};

/// The autoupdate service: hands out [`Connection`]s over one shared
/// datastore and restricter.
pub struct Autoupdate {
    ds: Datastore,
    restricter: Arc<Restricter>,
}

impl Autoupdate {
    pub fn new(ds: Datastore, restricter: Restricter) -> Self {
        Self {
            ds,
            restricter: Arc::new(restricter),
        }
    }

    /// The underlying datastore.
    pub fn datastore(&self) -> &Datastore {
        &self.ds
    }

    /// Open a subscription for `user_id`. The first
    /// [`next`](Connection::next) call emits the snapshot.
    pub fn connect(&self, user_id: i32, requests: Vec<KeyRequest>) -> Connection {
        Connection::new(
            self.ds.clone(),
            self.restricter.clone(),
            user_id,
            KeysBuilder::new(requests),
        )
    }
}

impl std::fmt::Debug for Autoupdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Autoupdate").finish()
    }
}

/// One connection round's restricted view: values are fetched from
/// the datastore and restricted before the keysbuilder sees them, so
/// subscriptions only follow relations the user may read. Every key
/// that is requested or read for permissions lands in the round's
/// wake-up filter.
pub(crate) struct RoundLoader {
    restricter: Arc<Restricter>,
    user_id: i32,
    /// Shared fetcher recording permission reads across the round
    fetch: tokio::sync::Mutex<Fetcher>,
    /// Keys requested through the loader
    requested: Mutex<HashSet<Key>>,
}

impl RoundLoader {
    pub(crate) fn new(restricter: Arc<Restricter>, user_id: i32) -> Self {
        let fetch = Fetcher::new(restricter.datastore());
        Self {
            restricter,
            user_id,
            fetch: tokio::sync::Mutex::new(fetch),
            requested: Mutex::new(HashSet::new()),
        }
    }

    /// Restricted bulk read outside the `ValueLoader` seam.
    pub(crate) async fn load(&self, keys: &[Key]) -> Result<HashMap<Key, Value>, BoxError> {
        self.requested.lock().extend(keys.iter().cloned());
        let mut data = self.restricter.datastore().get(keys).await?;
        let mut fetch = self.fetch.lock().await;
        self.restricter
            .restrict_with(&mut fetch, self.user_id, &mut data)
            .await?;
        Ok(data)
    }

    /// Everything this round touched: requested keys plus permission
    /// reads.
    pub(crate) fn into_relevant(self) -> HashSet<Key> {
        let mut relevant = self.requested.into_inner();
        relevant.extend(self.fetch.into_inner().into_touched());
        relevant
    }
}

#[async_trait]
impl ValueLoader for RoundLoader {
    async fn values(&self, keys: Vec<Key>) -> Result<HashMap<Key, Value>, BoxError> {
        self.load(&keys).await
    }
}

#[cfg(test)]
#[path = "autoupdate_test.rs"]
mod tests;
