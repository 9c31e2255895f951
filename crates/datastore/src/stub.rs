//! Test support - in-memory source with change injection
//!
//! `StubSource` answers reads from a static map, counts every request
//! it sees, and lets tests inject change batches with
//! [`send`](StubSource::send). Data literals are written as JSON
//! objects keyed by the textual key form:
//!
//! ```ignore
//! let (ds, source) = stub::datastore(json!({
//!     "projection/1/id": 1,
//!     "projection/1/content_object_id": "test_model/1",
//! }));
//! ```
//!
//! The helpers panic on malformed input; they exist for tests only.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use plenum_key::Key;
use tokio::sync::mpsc;

use crate::datastore::Datastore;
use crate::error::SourceError;
use crate::source::{Source, SourceAnswer, Value};

/// In-memory [`Source`] for tests.
pub struct StubSource {
    data: Mutex<HashMap<Key, Bytes>>,
    position: AtomicU64,
    requests: Mutex<Vec<Vec<Key>>>,
    feed_tx: mpsc::UnboundedSender<SourceAnswer>,
    feed_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SourceAnswer>>,
}

impl StubSource {
    /// Create a stub answering from `data`.
    pub fn new(data: HashMap<Key, Bytes>) -> Self {
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        Self {
            data: Mutex::new(data),
            position: AtomicU64::new(1),
            requests: Mutex::new(Vec::new()),
            feed_tx,
            feed_rx: tokio::sync::Mutex::new(feed_rx),
        }
    }

    /// Inject a change batch: update the stub's own data and hand the
    /// batch to whoever consumes [`Source::update`]. `None` deletes.
    pub fn send(&self, changes: HashMap<Key, Value>) {
        let position = self.position.fetch_add(1, Ordering::Relaxed) + 1;
        {
            let mut data = self.data.lock();
            for (key, value) in &changes {
                match value {
                    Some(bytes) => {
                        data.insert(key.clone(), bytes.clone());
                    }
                    None => {
                        data.remove(key);
                    }
                }
            }
        }
        let _ = self.feed_tx.send(SourceAnswer {
            values: changes,
            position,
        });
    }

    /// Number of `get` calls this stub answered.
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// The key batches of every `get` call, in order.
    pub fn requests(&self) -> Vec<Vec<Key>> {
        self.requests.lock().clone()
    }

    /// How many `get` calls covered `key`.
    pub fn reads_of(&self, key: &Key) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|batch| batch.contains(key))
            .count()
    }
}

#[async_trait]
impl Source for StubSource {
    async fn get(&self, keys: &[Key]) -> Result<SourceAnswer, SourceError> {
        self.requests.lock().push(keys.to_vec());

        let data = self.data.lock();
        let values = keys
            .iter()
            .map(|key| (key.clone(), data.get(key).cloned()))
            .collect();
        Ok(SourceAnswer {
            values,
            position: self.position.load(Ordering::Relaxed),
        })
    }

    async fn update(&self) -> Result<SourceAnswer, SourceError> {
        let mut feed = self.feed_rx.lock().await;
        feed.recv().await.ok_or(SourceError::FeedClosed)
    }
}

/// A source that fails every read, for error-path tests.
pub struct BrokenSource;

#[async_trait]
impl Source for BrokenSource {
    async fn get(&self, _keys: &[Key]) -> Result<SourceAnswer, SourceError> {
        Err(SourceError::Protocol("broken test source".to_string()))
    }

    async fn update(&self) -> Result<SourceAnswer, SourceError> {
        Err(SourceError::FeedClosed)
    }
}

/// Build a data map from a JSON object keyed by textual keys.
/// `null` entries are skipped (the key stays absent).
///
/// # Panics
///
/// On non-object input or malformed keys.
pub fn data(object: serde_json::Value) -> HashMap<Key, Bytes> {
    let serde_json::Value::Object(entries) = object else {
        panic!("stub data must be a JSON object");
    };
    entries
        .into_iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(key, value)| {
            let key = Key::parse(&key).unwrap_or_else(|e| panic!("stub data: {e}"));
            (key, Bytes::from(value.to_string()))
        })
        .collect()
}

/// Build a change batch from a JSON object keyed by textual keys.
/// `null` entries delete the key.
///
/// # Panics
///
/// On non-object input or malformed keys.
pub fn changes(object: serde_json::Value) -> HashMap<Key, Value> {
    let serde_json::Value::Object(entries) = object else {
        panic!("stub changes must be a JSON object");
    };
    entries
        .into_iter()
        .map(|(key, value)| {
            let key = Key::parse(&key).unwrap_or_else(|e| panic!("stub changes: {e}"));
            let value = match value {
                serde_json::Value::Null => None,
                other => Some(Bytes::from(other.to_string())),
            };
            (key, value)
        })
        .collect()
}

/// A datastore over a fresh stub with `initial` data. Returns the
/// stub handle for change injection and request counting.
pub fn datastore(initial: serde_json::Value) -> (Datastore, Arc<StubSource>) {
    let source = Arc::new(StubSource::new(data(initial)));
    (Datastore::new(source.clone()), source)
}
