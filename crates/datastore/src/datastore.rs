//! Cached datastore
//!
//! Multiplexes many concurrent readers onto the source reader,
//! invalidates entries from the change stream and hosts computed
//! fields.
//!
//! # Design
//!
//! - **Single-flight**: concurrent `get`s of a cold key share one
//!   source request (see [`cache`](crate::cache) internals).
//! - **Computed fields**: a read that targets a registered
//!   `(collection, field)` pair runs the producer inside a nested
//!   [`Fetcher`] instead of contacting the source. The keys the
//!   producer touches become the dependency set; an upstream change
//!   to any of them drops the cached value so the next read
//!   recomputes. Producer failures are cached as `{"error":"..."}`.
//! - **Change loop**: [`listen`](Datastore::listen) consumes
//!   [`Source::update`] batches one at a time. After a batch is
//!   applied, registered listeners run synchronously, then
//!   subscribers are notified; a read started after the listeners
//!   return sees the new values.
//!
//! The handle is cheap to clone; all clones share the same cache.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use plenum_key::Key;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::{AfterWait, BeginOne, Cache, ReadGuard};
use crate::error::{DatastoreError, Result, SourceError};
use crate::fetcher::Fetcher;
use crate::source::{Source, SourceAnswer, Value};

/// Capacity of the update broadcast channel. A subscriber that lags
/// behind re-reads from the cache, so overflow is recoverable.
const UPDATES_CAPACITY: usize = 128;

/// Delay before retrying after a transient change-stream error.
const UPDATE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Error type for computed-field producers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// One applied change batch: raw changes plus invalidated computed
/// keys (mapped to `None`; their new values are recomputed on the
/// next read).
pub type UpdateBatch = HashMap<Key, Value>;

/// A derived key whose value is produced by a function rather than
/// fetched from the source.
///
/// Producers read everything through the fetcher they are handed;
/// the touched keys become the dependency set that drives
/// invalidation. Recursing into another computed field goes through
/// the same fetcher, never around the cache.
#[async_trait]
pub trait ComputedField: Send + Sync + 'static {
    /// Produce the value for `(collection, id, field)`.
    ///
    /// `Ok(None)` means the key is absent. Errors are cached as a
    /// JSON object with a single `error` member.
    async fn produce(&self, fetch: &mut Fetcher, id: i32) -> std::result::Result<Value, BoxError>;
}

type Listener = Box<dyn Fn(&UpdateBatch) + Send + Sync>;

struct Inner {
    source: Arc<dyn Source>,
    cache: Cache,
    /// Highest change-stream position observed so far
    position: AtomicU64,
    /// collection -> field -> producer
    computed: RwLock<HashMap<String, HashMap<String, Arc<dyn ComputedField>>>>,
    /// computed key -> keys its last computation touched
    deps: Mutex<HashMap<Key, HashSet<Key>>>,
    listeners: RwLock<Vec<Listener>>,
    updates_tx: broadcast::Sender<Arc<UpdateBatch>>,
}

/// The in-process cached view of the remote datastore.
#[derive(Clone)]
pub struct Datastore {
    inner: Arc<Inner>,
}

impl Datastore {
    /// Create a datastore over `source`. Spawn
    /// [`listen`](Self::listen) to activate change handling.
    pub fn new(source: Arc<dyn Source>) -> Self {
        let (updates_tx, _) = broadcast::channel(UPDATES_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                source,
                cache: Cache::new(),
                position: AtomicU64::new(0),
                computed: RwLock::new(HashMap::new()),
                deps: Mutex::new(HashMap::new()),
                listeners: RwLock::new(Vec::new()),
                updates_tx,
            }),
        }
    }

    /// Register the producer for a computed `(collection, field)`
    /// pair. Later registrations replace earlier ones.
    pub fn register_computed(
        &self,
        collection: &str,
        field: &str,
        producer: Arc<dyn ComputedField>,
    ) {
        self.inner
            .computed
            .write()
            .entry(collection.to_string())
            .or_default()
            .insert(field.to_string(), producer);
    }

    /// Register a listener invoked synchronously for every applied
    /// change batch, before subscribers are woken.
    pub fn register_change_listener<F>(&self, listener: F)
    where
        F: Fn(&UpdateBatch) + Send + Sync + 'static,
    {
        self.inner.listeners.write().push(Box::new(listener));
    }

    /// Subscribe to applied change batches. Used by connections as
    /// their wake-up signal.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<UpdateBatch>> {
        self.inner.updates_tx.subscribe()
    }

    /// Highest change-stream position observed so far.
    pub fn position(&self) -> u64 {
        self.inner.position.load(Ordering::Relaxed)
    }

    /// Fetch the current values of `keys`, from the cache where
    /// possible. The answer holds one entry per input key; `None` is
    /// the absent marker.
    pub async fn get(&self, keys: &[Key]) -> Result<HashMap<Key, Value>> {
        self.get_with_stack(keys, &[]).await
    }

    /// Single-key convenience over [`get`](Self::get).
    pub async fn get_one(&self, key: &Key) -> Result<Value> {
        let mut values = self.get(std::slice::from_ref(key)).await?;
        Ok(values.remove(key).flatten())
    }

    /// Consume change batches from the source until cancellation or
    /// the end of the feed. Transient stream errors are retried.
    pub async fn listen(&self, cancel: CancellationToken) {
        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => break,
                batch = self.inner.source.update() => batch,
            };
            match batch {
                Ok(batch) => {
                    debug!(
                        keys = batch.values.len(),
                        position = batch.position,
                        "applying change batch"
                    );
                    self.apply(batch);
                }
                Err(SourceError::FeedClosed) => {
                    debug!("change feed closed, update loop ends");
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "reading the change stream failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(UPDATE_RETRY_DELAY) => {}
                    }
                }
            }
        }
    }

    /// Inner get carrying the currently-computing chain for cycle
    /// rejection. Public callers enter with an empty stack via
    /// [`get`](Self::get); nested fetchers carry their producer's
    /// chain.
    pub(crate) async fn get_with_stack(
        &self,
        keys: &[Key],
        stack: &[Key],
    ) -> Result<HashMap<Key, Value>> {
        let mut result: HashMap<Key, Value> = HashMap::with_capacity(keys.len());
        if keys.is_empty() {
            return Ok(result);
        }

        let mut raw: Vec<Key> = Vec::new();
        let mut computed: Vec<Key> = Vec::new();
        {
            let registry = self.inner.computed.read();
            for key in keys {
                if result.contains_key(key) || raw.contains(key) || computed.contains(key) {
                    continue;
                }
                let is_computed = registry
                    .get(key.collection())
                    .is_some_and(|fields| fields.contains_key(key.field()));
                if !is_computed {
                    raw.push(key.clone());
                } else if stack.contains(key) {
                    // Cycle: reject at read time, uncached.
                    let msg = format!("circular dependency while computing {key}");
                    result.insert(key.clone(), Some(error_value(&msg)));
                } else {
                    computed.push(key.clone());
                }
            }
        }

        // Raw keys first, so computed producers find their own
        // entity's fields already resolved. Retried keys come from
        // readers that vanished without resolving.
        let mut todo = raw;
        while !todo.is_empty() {
            let outcome = self.inner.cache.begin(&todo);
            result.extend(outcome.ready);

            if let Some(guard) = outcome.reader {
                let read = self.read_source(guard).await?;
                result.extend(read);
            }

            let mut retry = Vec::new();
            for (key, mut rx) in outcome.waiting {
                loop {
                    let _ = rx.changed().await;
                    match self.inner.cache.after_wait(&key) {
                        AfterWait::Ready(value) => {
                            result.insert(key, value);
                            break;
                        }
                        AfterWait::Failed(err) => return Err(err),
                        AfterWait::Pending(next) => rx = next,
                        AfterWait::Gone => {
                            retry.push(key);
                            break;
                        }
                    }
                }
            }
            todo = retry;
        }

        for key in computed {
            let value = self.get_computed(&key, stack).await?;
            result.insert(key, value);
        }

        Ok(result)
    }

    /// Issue the bulk source read for a batch of newly-pending keys.
    ///
    /// The read runs on its own task: when the calling subscriber is
    /// cancelled mid-read, the flight still completes and populates
    /// the cache for the parked waiters.
    async fn read_source(&self, guard: ReadGuard) -> Result<HashMap<Key, Value>> {
        let inner = self.inner.clone();
        let (done_tx, done_rx) = oneshot::channel();

        tokio::spawn(async move {
            let outcome = match inner.source.get(&guard.keys).await {
                Ok(answer) => {
                    inner.position.fetch_max(answer.position, Ordering::Relaxed);
                    let values = guard
                        .keys
                        .iter()
                        .map(|key| {
                            let value = answer.values.get(key).cloned().flatten();
                            (key.clone(), (value, answer.position))
                        })
                        .collect();
                    Ok(inner.cache.resolve(guard, values))
                }
                Err(err) => {
                    let err = DatastoreError::from(err);
                    inner.cache.fail(guard, err.clone());
                    Err(err)
                }
            };
            let _ = done_tx.send(outcome);
        });

        match done_rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(SourceError::Aborted.into()),
        }
    }

    /// Single-flight read of one computed key.
    async fn get_computed(&self, key: &Key, stack: &[Key]) -> Result<Value> {
        loop {
            match self.inner.cache.begin_one(key) {
                BeginOne::Ready(value) => return Ok(value),
                BeginOne::Wait(mut rx) => {
                    let _ = rx.changed().await;
                    match self.inner.cache.after_wait(key) {
                        AfterWait::Ready(value) => return Ok(value),
                        AfterWait::Failed(err) => return Err(err),
                        AfterWait::Pending(_) | AfterWait::Gone => continue,
                    }
                }
                BeginOne::Read(guard) => {
                    let value = self.compute(key, stack).await;
                    let position = self.position();
                    let mut values = HashMap::with_capacity(1);
                    values.insert(key.clone(), (value, position));
                    let mut effective = self.inner.cache.resolve(guard, values);
                    return Ok(effective.remove(key).flatten());
                }
            }
        }
    }

    /// Run the producer inside a nested fetcher and record the keys
    /// it touched as the dependency set.
    async fn compute(&self, key: &Key, stack: &[Key]) -> Value {
        let producer = {
            let registry = self.inner.computed.read();
            registry
                .get(key.collection())
                .and_then(|fields| fields.get(key.field()))
                .cloned()
        };
        let Some(producer) = producer else {
            // The partition above only sends registered keys here.
            return Some(error_value(&format!("no producer registered for {key}")));
        };

        let mut chain = Vec::with_capacity(stack.len() + 1);
        chain.extend_from_slice(stack);
        chain.push(key.clone());

        let mut fetch = Fetcher::with_stack(self.clone(), chain);
        let produced = producer.produce(&mut fetch, key.id()).await;

        let deps = fetch.into_touched();
        self.inner.deps.lock().insert(key.clone(), deps);

        match produced {
            Ok(value) => value,
            Err(err) => {
                debug!(key = %key, error = %err, "computed field failed");
                Some(error_value(&err.to_string()))
            }
        }
    }

    /// Apply one change batch: overwrite cached raw entries, drop the
    /// transitive set of stale computed entries, then deliver the
    /// combined map to listeners and subscribers.
    fn apply(&self, batch: SourceAnswer) {
        let inner = &self.inner;
        inner.position.fetch_max(batch.position, Ordering::Relaxed);

        for (key, value) in &batch.values {
            inner.cache.apply_change(key, value.clone(), batch.position);
        }

        // Staleness closes transitively: a computed field may depend
        // on another computed field.
        let stale = {
            let deps = inner.deps.lock();
            let mut stale: HashSet<Key> = HashSet::new();
            let mut frontier: Vec<Key> = batch.values.keys().cloned().collect();
            while let Some(changed) = frontier.pop() {
                for (computed_key, dep_set) in deps.iter() {
                    if !stale.contains(computed_key) && dep_set.contains(&changed) {
                        stale.insert(computed_key.clone());
                        frontier.push(computed_key.clone());
                    }
                }
            }
            stale
        };

        {
            let mut deps = inner.deps.lock();
            for key in &stale {
                inner.cache.invalidate(key);
                deps.remove(key);
            }
        }

        let mut update: UpdateBatch = batch.values;
        for key in stale {
            update.entry(key).or_insert(None);
        }
        let update = Arc::new(update);

        {
            let listeners = inner.listeners.read();
            for listener in listeners.iter() {
                listener(&update);
            }
        }

        // No receivers is fine; connections come and go.
        let _ = inner.updates_tx.send(update);
    }

    #[cfg(test)]
    pub(crate) fn cache(&self) -> &Cache {
        &self.inner.cache
    }
}

impl std::fmt::Debug for Datastore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Datastore")
            .field("position", &self.position())
            .finish()
    }
}

/// The serialised form of a failed computation: a JSON object with a
/// single `error` member.
pub(crate) fn error_value(msg: &str) -> Bytes {
    let mut object = serde_json::Map::with_capacity(1);
    object.insert(
        "error".to_string(),
        serde_json::Value::String(msg.to_string()),
    );
    Bytes::from(serde_json::Value::Object(object).to_string())
}

#[cfg(test)]
#[path = "datastore_test.rs"]
mod tests;
