//! The per-subscriber connection loop

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use plenum_datastore::{Datastore, UpdateBatch, Value};
use plenum_key::Key;
use plenum_keysbuilder::{ExpandError, KeysBuilder};
use plenum_restrict::{RestrictError, Restricter};
use serde_json::value::RawValue;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::RoundLoader;

/// One emission: key to restricted value. `None` encodes as `null`,
/// telling the client the key is gone.
pub type Frame = HashMap<Key, Value>;

/// Errors terminating a connection. They affect only this
/// subscriber.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The subscription request could not be expanded
    #[error("expanding request: {0}")]
    Expand(#[from] ExpandError),

    /// Restriction failed
    #[error("restricting data: {0}")]
    Restrict(#[from] RestrictError),

    /// Reading values failed
    #[error("reading data: {0}")]
    Datastore(#[from] plenum_datastore::DatastoreError),
}

/// One subscriber's stream of emission frames.
///
/// Drive it with [`next`](Self::next); dropping the connection ends
/// the subscription.
pub struct Connection {
    restricter: Arc<Restricter>,
    user_id: i32,
    builder: KeysBuilder,
    updates: broadcast::Receiver<Arc<UpdateBatch>>,
    /// Visible values of the previous emission round
    sent: HashMap<Key, Value>,
    snapshot_sent: bool,
}

impl Connection {
    pub(crate) fn new(
        ds: Datastore,
        restricter: Arc<Restricter>,
        user_id: i32,
        builder: KeysBuilder,
    ) -> Self {
        // Subscribing before the first read closes the gap between
        // evaluating a round and parking: batches applied in between
        // wait in the channel.
        let updates = ds.subscribe();
        Self {
            restricter,
            user_id,
            builder,
            updates,
            sent: HashMap::new(),
            snapshot_sent: false,
        }
    }

    /// The subscribing user.
    pub fn user_id(&self) -> i32 {
        self.user_id
    }

    /// The next emission frame.
    ///
    /// The first call answers immediately with the full snapshot
    /// (absent keys included, as `None`). Later calls block until a
    /// relevant change produces a non-empty diff. `Ok(None)` means
    /// the datastore shut down.
    pub async fn next(&mut self) -> Result<Option<Frame>, ConnectionError> {
        loop {
            let (visible, relevant) = self.evaluate().await?;

            let mut frame: Frame = HashMap::new();
            for (key, value) in &visible {
                if self.sent.get(key) != Some(value) {
                    frame.insert(key.clone(), value.clone());
                }
            }
            for (key, value) in &self.sent {
                // Keys the expansion no longer covers are deletions,
                // unless the client already saw them as gone.
                if value.is_some() && !visible.contains_key(key) {
                    frame.insert(key.clone(), None);
                }
            }

            let snapshot = !self.snapshot_sent;
            self.snapshot_sent = true;
            self.sent = visible;

            if snapshot {
                debug!(
                    user_id = self.user_id,
                    keys = self.sent.len(),
                    "emitting snapshot"
                );
                return Ok(Some(self.sent.clone()));
            }
            if !frame.is_empty() {
                debug!(
                    user_id = self.user_id,
                    keys = frame.len(),
                    "emitting delta"
                );
                return Ok(Some(frame));
            }

            trace!(user_id = self.user_id, "no visible change, parking");
            if !self.wait_for_relevant_change(&relevant).await {
                return Ok(None);
            }
        }
    }

    /// Expand, fetch and restrict one round. Returns the visible
    /// values and the round's wake-up filter.
    async fn evaluate(&self) -> Result<(HashMap<Key, Value>, HashSet<Key>), ConnectionError> {
        let loader = RoundLoader::new(self.restricter.clone(), self.user_id);

        let keys = self.builder.expand(&loader).await?;
        let ordered: Vec<Key> = keys.iter().cloned().collect();
        let visible = loader.load(&ordered).await.map_err(flatten_loader_error)?;

        let mut relevant = loader.into_relevant();
        relevant.extend(keys);
        Ok((visible, relevant))
    }

    /// Park until an update batch touches a relevant key. Returns
    /// false when the update stream is gone.
    async fn wait_for_relevant_change(&mut self, relevant: &HashSet<Key>) -> bool {
        loop {
            match self.updates.recv().await {
                Ok(batch) => {
                    if batch.keys().any(|key| relevant.contains(key)) {
                        return true;
                    }
                    trace!(user_id = self.user_id, "ignoring unrelated change batch");
                }
                // Falling behind loses which keys changed; the next
                // round re-reads everything instead.
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(
                        user_id = self.user_id,
                        skipped, "update stream lagged, forcing re-evaluation"
                    );
                    return true;
                }
                Err(broadcast::error::RecvError::Closed) => return false,
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("user_id", &self.user_id)
            .field("sent", &self.sent.len())
            .finish()
    }
}

/// The loader reports `BoxError` at the `ValueLoader` seam; recover
/// the concrete kinds it can actually carry.
fn flatten_loader_error(err: plenum_datastore::BoxError) -> ConnectionError {
    let err = match err.downcast::<RestrictError>() {
        Ok(restrict) => return ConnectionError::Restrict(*restrict),
        Err(err) => err,
    };
    match err.downcast::<plenum_datastore::DatastoreError>() {
        Ok(ds) => ConnectionError::Datastore(*ds),
        Err(err) => ConnectionError::Expand(ExpandError::Loader(err)),
    }
}

/// Serialise a frame to its wire form: a JSON object from textual
/// key to raw value, `null` for deletions. Keys are ordered for
/// stable output.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, serde_json::Error> {
    let mut object: BTreeMap<String, Option<Box<RawValue>>> = BTreeMap::new();
    for (key, value) in frame {
        let raw = match value {
            None => None,
            Some(bytes) => Some(RawValue::from_string(
                String::from_utf8_lossy(bytes).into_owned(),
            )?),
        };
        object.insert(key.to_string(), raw);
    }
    serde_json::to_vec(&object)
}
