//! Plenum - Restrict
//!
//! The permission engine: given a requesting user and a batch of
//! key/value pairs, replace everything the user may not see.
//!
//! # Design
//!
//! Restriction is driven per collection. A [`Collection`] plug-in
//! maps each field to a named *mode* and answers, for all ids of one
//! request in a single pass, which ids are visible under that mode.
//! The framework:
//!
//! 1. groups the requested keys by `(collection, mode)`,
//! 2. short-circuits superadmins (unless the plug-in overrides,
//!    like `personal_note`),
//! 3. runs one restricter pass per group through a shared
//!    [`Fetcher`], so permission lookups batch,
//! 4. suppresses or redacts invisible values according to the
//!    field's mode policy. Redaction always emits the JSON literal
//!    `null`, so diffing stays stable.
//!
//! Keys of unknown collections or fields are suppressed. Absent
//! values pass through untouched; there is nothing to hide.

mod collection;
pub mod collections;
mod error;
mod perm;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use plenum_datastore::{Datastore, FetchError, Fetcher, Value};
use plenum_key::Key;
use tracing::debug;

pub use collection::{Collection, FieldMode, ModePolicy, group_by_relation};
pub use error::{RestrictError, Result};
pub use perm::{MeetingPermission, MeetingPerms, Permission};

/// The permission engine over a datastore.
pub struct Restricter {
    ds: Datastore,
    collections: HashMap<&'static str, Arc<dyn Collection>>,
}

impl Restricter {
    /// An engine with the built-in collection catalog.
    pub fn new(ds: Datastore) -> Self {
        let mut restricter = Self::without_catalog(ds);
        for collection in collections::defaults() {
            restricter.register(collection);
        }
        restricter
    }

    /// An engine without any collections; everything is suppressed
    /// until plug-ins are registered.
    pub fn without_catalog(ds: Datastore) -> Self {
        Self {
            ds,
            collections: HashMap::new(),
        }
    }

    /// Register a collection plug-in, replacing any previous one of
    /// the same name.
    pub fn register(&mut self, collection: Arc<dyn Collection>) {
        self.collections.insert(collection.name(), collection);
    }

    /// The datastore this engine reads permission data from.
    pub fn datastore(&self) -> &Datastore {
        &self.ds
    }

    /// Fetch `keys` and restrict them for `user_id` in one step.
    pub async fn restricted_get(
        &self,
        user_id: i32,
        keys: &[Key],
    ) -> Result<HashMap<Key, Value>> {
        let mut data = self
            .ds
            .get(keys)
            .await
            .map_err(FetchError::from)?;
        self.restrict(user_id, &mut data).await?;
        Ok(data)
    }

    /// Replace every value in `data` the user may not see: suppressed
    /// fields become the absent marker, redacted fields the JSON
    /// literal `null`.
    pub async fn restrict(&self, user_id: i32, data: &mut HashMap<Key, Value>) -> Result<()> {
        let mut fetch = Fetcher::new(&self.ds);
        self.restrict_with(&mut fetch, user_id, data).await
    }

    /// Like [`restrict`](Self::restrict), but reads permission data
    /// through the caller's fetcher. The connection loop passes one
    /// fetcher per round so that permission reads end up in its
    /// change wake-up filter.
    pub async fn restrict_with(
        &self,
        fetch: &mut Fetcher,
        user_id: i32,
        data: &mut HashMap<Key, Value>,
    ) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let mut perms = MeetingPermission::new(user_id);
        let superadmin = perms.is_superadmin(fetch).await?;

        struct Group {
            collection: Arc<dyn Collection>,
            mode: &'static str,
            ids: Vec<i32>,
            keys: Vec<(Key, ModePolicy)>,
        }

        let mut groups: Vec<Group> = Vec::new();
        let mut group_index: HashMap<(&'static str, &'static str), usize> = HashMap::new();
        let mut suppressed: Vec<Key> = Vec::new();

        for (key, value) in data.iter() {
            if value.is_none() {
                continue;
            }
            let Some(collection) = self.collections.get(key.collection()) else {
                suppressed.push(key.clone());
                continue;
            };
            let Some(field_mode) = collection.field_mode(key.bare_field()) else {
                suppressed.push(key.clone());
                continue;
            };

            let index = *group_index
                .entry((collection.name(), field_mode.mode))
                .or_insert_with(|| {
                    groups.push(Group {
                        collection: collection.clone(),
                        mode: field_mode.mode,
                        ids: Vec::new(),
                        keys: Vec::new(),
                    });
                    groups.len() - 1
                });
            let group = &mut groups[index];
            if !group.ids.contains(&key.id()) {
                group.ids.push(key.id());
            }
            group.keys.push((key.clone(), field_mode.policy));
        }

        if !suppressed.is_empty() {
            debug!(
                user_id,
                count = suppressed.len(),
                "suppressing keys without restriction rules"
            );
            for key in suppressed {
                data.insert(key, None);
            }
        }

        for group in groups {
            let allowed: HashSet<i32> = if superadmin {
                group
                    .collection
                    .super_admin(fetch, &mut perms, group.mode, &group.ids)
                    .await?
            } else {
                group
                    .collection
                    .restrict_mode(fetch, &mut perms, group.mode, &group.ids)
                    .await?
            }
            .into_iter()
            .collect();

            for (key, policy) in group.keys {
                if allowed.contains(&key.id()) {
                    continue;
                }
                match policy {
                    ModePolicy::Suppress => {
                        data.insert(key, None);
                    }
                    ModePolicy::Redact => {
                        data.insert(key, Some(Bytes::from_static(b"null")));
                    }
                }
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for Restricter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Restricter")
            .field("collections", &self.collections.len())
            .finish()
    }
}

#[cfg(test)]
#[path = "restrict_test.rs"]
mod tests;
