//! Fetcher - per-request batching over the cached datastore
//!
//! A fetcher lives for one request (one connection round, one
//! restriction pass, one computed-field production). Keys are
//! recorded with [`lazy`](Fetcher::lazy)/[`want`](Fetcher::want),
//! read in one bulk [`execute`](Fetcher::execute), and decoded into
//! typed slots. The fetcher remembers every key it was asked for;
//! callers use that set as their change wake-up filter, and the
//! datastore uses it as the dependency set of computed fields.
//!
//! # Example
//!
//! ```ignore
//! let mut fetch = Fetcher::new(&datastore);
//! let title = fetch.lazy::<String>(Key::new("topic", 1, "title"));
//! let author = fetch.lazy_required::<i32>(Key::new("topic", 1, "author_id"));
//! fetch.execute().await?;
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use plenum_key::Key;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::datastore::Datastore;
use crate::error::FetchError;
use crate::source::Value;

type Decoder = Box<dyn FnOnce(Option<&Bytes>) -> Result<(), FetchError> + Send>;

/// A typed slot filled by [`Fetcher::execute`].
///
/// Before execution, and for absent values, [`value`](Lazy::value)
/// yields `None`.
pub struct Lazy<T>(Arc<OnceLock<Option<T>>>);

impl<T> Lazy<T> {
    fn empty() -> Self {
        Self(Arc::new(OnceLock::new()))
    }

    fn fill(&self, value: Option<T>) {
        let _ = self.0.set(value);
    }

    /// The decoded value, or `None` when the key is absent (or the
    /// slot was never executed).
    pub fn value(&self) -> Option<&T> {
        self.0.get().and_then(|inner| inner.as_ref())
    }

    /// Whether the key resolved to a present value.
    pub fn exists(&self) -> bool {
        matches!(self.0.get(), Some(Some(_)))
    }
}

impl<T> Clone for Lazy<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

/// Per-request batching facade over a [`Datastore`].
pub struct Fetcher {
    ds: Datastore,
    /// Currently-computing chain for cycle rejection; empty outside
    /// computed-field production
    stack: Vec<Key>,
    /// Recorded but not yet executed requests
    queued: Vec<(Key, Option<Decoder>)>,
    /// Executed results
    values: HashMap<Key, Value>,
    /// Every key ever recorded
    touched: HashSet<Key>,
}

impl Fetcher {
    /// Create a fetcher for one request.
    pub fn new(ds: &Datastore) -> Self {
        Self::with_stack(ds.clone(), Vec::new())
    }

    pub(crate) fn with_stack(ds: Datastore, stack: Vec<Key>) -> Self {
        Self {
            ds,
            stack,
            queued: Vec::new(),
            values: HashMap::new(),
            touched: HashSet::new(),
        }
    }

    /// The datastore this fetcher reads from.
    pub fn datastore(&self) -> &Datastore {
        &self.ds
    }

    /// Record a request without a typed slot; nothing is read yet.
    pub fn want(&mut self, key: Key) {
        self.touched.insert(key.clone());
        self.queued.push((key, None));
    }

    /// Record a request with a typed slot. Absent values leave the
    /// slot empty.
    pub fn lazy<T>(&mut self, key: Key) -> Lazy<T>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let slot = Lazy::empty();
        let filled = slot.clone();
        self.touched.insert(key.clone());
        let decode_key = key.clone();
        self.queued.push((
            key,
            Some(Box::new(move |bytes| match bytes {
                None => {
                    filled.fill(None);
                    Ok(())
                }
                Some(bytes) => match serde_json::from_slice(bytes) {
                    Ok(value) => {
                        filled.fill(Some(value));
                        Ok(())
                    }
                    Err(source) => Err(FetchError::Decode {
                        key: decode_key,
                        source,
                    }),
                },
            })),
        ));
        slot
    }

    /// Like [`lazy`](Self::lazy), but an absent value fails the
    /// execution with [`FetchError::DoesNotExist`].
    pub fn lazy_required<T>(&mut self, key: Key) -> Lazy<T>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let slot = Lazy::empty();
        let filled = slot.clone();
        self.touched.insert(key.clone());
        let decode_key = key.clone();
        self.queued.push((
            key,
            Some(Box::new(move |bytes| match bytes {
                None => Err(FetchError::DoesNotExist(decode_key)),
                Some(bytes) => match serde_json::from_slice(bytes) {
                    Ok(value) => {
                        filled.fill(Some(value));
                        Ok(())
                    }
                    Err(source) => Err(FetchError::Decode {
                        key: decode_key,
                        source,
                    }),
                },
            })),
        ));
        slot
    }

    /// Perform one batched read for every recorded key and run the
    /// typed decoders.
    ///
    /// When several slots fail, an arbitrary one of the errors is
    /// returned and the rest are logged; callers must not depend on
    /// which error wins. Without recorded keys this is a no-op.
    pub async fn execute(&mut self) -> Result<(), FetchError> {
        let queued = std::mem::take(&mut self.queued);
        if queued.is_empty() {
            return Ok(());
        }

        let keys: Vec<Key> = queued.iter().map(|(key, _)| key.clone()).collect();
        let data = self.ds.get_with_stack(&keys, &self.stack).await?;
        self.values.extend(data);

        let mut first_err: Option<FetchError> = None;
        for (key, decoder) in queued {
            let Some(decoder) = decoder else { continue };
            let bytes = self.values.get(&key).and_then(|value| value.as_ref());
            if let Err(err) = decoder(bytes) {
                if first_err.is_none() {
                    first_err = Some(err);
                } else {
                    debug!(key = %key, error = %err, "suppressing concurrent fetch error");
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Raw bytes of an executed key; `None` for absent values and
    /// keys that were never executed.
    pub fn raw(&self, key: &Key) -> Option<&Bytes> {
        self.values.get(key).and_then(|value| value.as_ref())
    }

    /// Decode an executed key. Absent values and keys that were never
    /// executed read as `None`.
    pub fn decoded<T: DeserializeOwned>(&self, key: &Key) -> Result<Option<T>, FetchError> {
        match self.raw(key) {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(bytes)
                .map(Some)
                .map_err(|source| FetchError::Decode {
                    key: key.clone(),
                    source,
                }),
        }
    }

    /// Decode an executed key that must exist.
    pub fn required<T: DeserializeOwned>(&self, key: &Key) -> Result<T, FetchError> {
        self.decoded(key)?
            .ok_or_else(|| FetchError::DoesNotExist(key.clone()))
    }

    /// Fetch and decode one key: record, execute, decode.
    pub async fn value<T>(&mut self, key: Key) -> Result<Option<T>, FetchError>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        self.want(key.clone());
        self.execute().await?;
        self.decoded(&key)
    }

    /// Fetch and decode one key that must exist.
    pub async fn require<T>(&mut self, key: Key) -> Result<T, FetchError>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        match self.value(key.clone()).await? {
            Some(value) => Ok(value),
            None => Err(FetchError::DoesNotExist(key)),
        }
    }

    /// Every key this fetcher was asked for, executed or not. The
    /// caller's wake-up filter.
    pub fn touched(&self) -> &HashSet<Key> {
        &self.touched
    }

    /// Consume the fetcher and keep only the touched set.
    pub fn into_touched(self) -> HashSet<Key> {
        self.touched
    }
}

impl std::fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher")
            .field("queued", &self.queued.len())
            .field("touched", &self.touched.len())
            .finish()
    }
}

#[cfg(test)]
#[path = "fetcher_test.rs"]
mod tests;
