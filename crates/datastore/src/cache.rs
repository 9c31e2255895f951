//! Single-flight value cache
//!
//! Maps keys to their last observed value and coordinates concurrent
//! readers: for a cold key exactly one caller becomes the reader and
//! installs a pending marker; everyone else parks on a `watch`
//! channel and shares the reader's result (or its error). The entry
//! mutex is held only for O(1) install/lookup steps, never across
//! source I/O.
//!
//! A change that arrives for a key with an outstanding pending marker
//! is queued on the entry and applied when the reader resolves, so it
//! is never dropped.

use std::collections::HashMap;

use parking_lot::Mutex;
use plenum_key::Key;
use tokio::sync::watch;

use crate::error::DatastoreError;
use crate::source::Value;

/// One cached entry.
struct Entry {
    state: State,
    /// Change-stream position at which the value was observed
    position: u64,
    /// Change that landed while the entry was pending
    queued: Option<Queued>,
}

enum State {
    /// A reader is fetching or computing this key
    Pending(watch::Receiver<()>),
    /// Last observed value
    Ready(Value),
    /// The read failed; parked waiters share the error, the next
    /// fresh lookup drops the entry and retries
    Failed(DatastoreError),
}

enum Queued {
    /// Direct change: overwrite on resolution
    Set(Value, u64),
    /// Dependency change of a computed entry: drop on resolution so
    /// the next read recomputes
    Invalidate,
}

/// Reader token for a batch of newly-pending keys.
///
/// The holder is the single reader for `keys` and must end the flight
/// with [`Cache::resolve`] or [`Cache::fail`]. Dropping the token
/// wakes the waiters, which recover by retrying.
pub(crate) struct ReadGuard {
    pub(crate) keys: Vec<Key>,
    _tx: watch::Sender<()>,
}

/// Outcome of classifying a batch of keys under one lock.
pub(crate) struct BeginOutcome {
    /// Keys already cached
    pub(crate) ready: HashMap<Key, Value>,
    /// Keys pending under another reader
    pub(crate) waiting: Vec<(Key, watch::Receiver<()>)>,
    /// Reader token for the remaining keys, if any were cold
    pub(crate) reader: Option<ReadGuard>,
}

/// Outcome of a single-key classification.
pub(crate) enum BeginOne {
    Ready(Value),
    Wait(watch::Receiver<()>),
    Read(ReadGuard),
}

/// What a parked waiter finds after its wake-up.
pub(crate) enum AfterWait {
    Ready(Value),
    Failed(DatastoreError),
    /// A new reader took over; park again
    Pending(watch::Receiver<()>),
    /// The entry vanished; retry from scratch
    Gone,
}

/// Lock-scope classification of one key, computed before mutating.
enum Lookup {
    Ready(Value),
    Wait(watch::Receiver<()>),
    /// Failed earlier or a vanished reader left it pending; drop and
    /// treat as a miss
    Stale,
    Miss,
}

#[derive(Default)]
pub(crate) struct Cache {
    entries: Mutex<HashMap<Key, Entry>>,
}

impl Cache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn classify(entries: &HashMap<Key, Entry>, key: &Key) -> Lookup {
        match entries.get(key) {
            None => Lookup::Miss,
            Some(entry) => match &entry.state {
                State::Ready(value) => Lookup::Ready(value.clone()),
                State::Pending(rx) => Lookup::Wait(rx.clone()),
                State::Failed(_) => Lookup::Stale,
            },
        }
    }

    /// Classify `keys`, installing one pending marker batch for all
    /// cold keys. Input may contain duplicates; each key is handled
    /// once.
    pub(crate) fn begin(&self, keys: &[Key]) -> BeginOutcome {
        let mut outcome = BeginOutcome {
            ready: HashMap::new(),
            waiting: Vec::new(),
            reader: None,
        };
        let mut missing: Vec<Key> = Vec::new();

        let mut entries = self.entries.lock();
        for key in keys {
            if outcome.ready.contains_key(key)
                || missing.contains(key)
                || outcome.waiting.iter().any(|(k, _)| k == key)
            {
                continue;
            }
            match Self::classify(&entries, key) {
                Lookup::Ready(value) => {
                    outcome.ready.insert(key.clone(), value);
                }
                Lookup::Wait(rx) => {
                    outcome.waiting.push((key.clone(), rx));
                }
                Lookup::Stale => {
                    entries.remove(key);
                    missing.push(key.clone());
                }
                Lookup::Miss => {
                    missing.push(key.clone());
                }
            }
        }

        if !missing.is_empty() {
            let (tx, rx) = watch::channel(());
            for key in &missing {
                entries.insert(
                    key.clone(),
                    Entry {
                        state: State::Pending(rx.clone()),
                        position: 0,
                        queued: None,
                    },
                );
            }
            outcome.reader = Some(ReadGuard {
                keys: missing,
                _tx: tx,
            });
        }

        outcome
    }

    /// Single-key variant of [`begin`](Self::begin), used for
    /// computed fields which are produced one at a time.
    pub(crate) fn begin_one(&self, key: &Key) -> BeginOne {
        let mut entries = self.entries.lock();
        match Self::classify(&entries, key) {
            Lookup::Ready(value) => return BeginOne::Ready(value),
            Lookup::Wait(rx) => return BeginOne::Wait(rx),
            Lookup::Stale => {
                entries.remove(key);
            }
            Lookup::Miss => {}
        }

        let (tx, rx) = watch::channel(());
        entries.insert(
            key.clone(),
            Entry {
                state: State::Pending(rx),
                position: 0,
                queued: None,
            },
        );
        BeginOne::Read(ReadGuard {
            keys: vec![key.clone()],
            _tx: tx,
        })
    }

    /// Store the reader's results and wake the waiters.
    ///
    /// Queued changes win over the read result: a `Set` observed
    /// during the flight is newer than the value the source answered
    /// with, and an `Invalidate` drops the entry so the next read
    /// recomputes. Returns the effective value per key.
    pub(crate) fn resolve(
        &self,
        guard: ReadGuard,
        mut values: HashMap<Key, (Value, u64)>,
    ) -> HashMap<Key, Value> {
        let mut effective = HashMap::with_capacity(guard.keys.len());

        let mut entries = self.entries.lock();
        for key in &guard.keys {
            let (value, position) = values.remove(key).unwrap_or((None, 0));

            let queued = match entries.get_mut(key) {
                Some(entry) => entry.queued.take(),
                None => {
                    effective.insert(key.clone(), value);
                    continue;
                }
            };

            match queued {
                Some(Queued::Set(queued_value, queued_position)) => {
                    if let Some(entry) = entries.get_mut(key) {
                        entry.state = State::Ready(queued_value.clone());
                        entry.position = queued_position;
                    }
                    effective.insert(key.clone(), queued_value);
                }
                Some(Queued::Invalidate) => {
                    entries.remove(key);
                    effective.insert(key.clone(), value);
                }
                None => {
                    if let Some(entry) = entries.get_mut(key) {
                        entry.state = State::Ready(value.clone());
                        entry.position = position;
                    }
                    effective.insert(key.clone(), value);
                }
            }
        }
        drop(entries);

        // Dropping the guard drops the watch sender and wakes waiters.
        effective
    }

    /// Record the reader's failure and wake the waiters with it.
    pub(crate) fn fail(&self, guard: ReadGuard, err: DatastoreError) {
        let mut entries = self.entries.lock();
        for key in &guard.keys {
            if let Some(entry) = entries.get_mut(key) {
                entry.state = State::Failed(err.clone());
                entry.queued = None;
            }
        }
    }

    /// Look up a key after a pending wake-up.
    pub(crate) fn after_wait(&self, key: &Key) -> AfterWait {
        let mut entries = self.entries.lock();

        let result = match entries.get(key) {
            None => AfterWait::Gone,
            Some(entry) => match &entry.state {
                State::Ready(value) => AfterWait::Ready(value.clone()),
                State::Failed(err) => AfterWait::Failed(err.clone()),
                State::Pending(rx) => {
                    if rx.has_changed().is_err() {
                        // The reader vanished without resolving.
                        AfterWait::Gone
                    } else {
                        AfterWait::Pending(rx.clone())
                    }
                }
            },
        };

        // Every parked waiter shares a Failed entry; the next fresh
        // lookup drops it. Abandoned pending entries are dropped here
        // so a retry can take over as the new reader.
        if matches!(result, AfterWait::Gone) {
            entries.remove(key);
        }

        result
    }

    /// Apply one changed key from the stream. Only keys the cache
    /// holds are touched; a change for a pending key is queued behind
    /// the resolution.
    pub(crate) fn apply_change(&self, key: &Key, value: Value, position: u64) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            return;
        };
        if matches!(entry.state, State::Pending(_)) {
            entry.queued = Some(Queued::Set(value, position));
        } else {
            entry.state = State::Ready(value);
            entry.position = position;
            entry.queued = None;
        }
    }

    /// Drop a computed entry whose dependency changed. Pending
    /// entries are marked so the resolution drops them instead.
    pub(crate) fn invalidate(&self, key: &Key) {
        let mut entries = self.entries.lock();
        let is_pending = match entries.get(key) {
            Some(entry) => matches!(entry.state, State::Pending(_)),
            None => return,
        };
        if is_pending {
            if let Some(entry) = entries.get_mut(key) {
                entry.queued = Some(Queued::Invalidate);
            }
        } else {
            entries.remove(key);
        }
    }

    /// Whether the cache currently holds an entry for `key`.
    pub(crate) fn contains(&self, key: &Key) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Highest position stored on any entry (for invariants in
    /// tests).
    #[cfg(test)]
    pub(crate) fn max_entry_position(&self) -> u64 {
        self.entries
            .lock()
            .values()
            .map(|entry| entry.position)
            .max()
            .unwrap_or(0)
    }
}
