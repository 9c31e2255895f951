//! Collection plug-in interface
//!
//! One implementation per collection decides which entity ids are
//! visible for each restriction mode. Modes are named restriction
//! policies ("A" is the plain can-see mode); every field of a
//! collection maps to one mode, and fields without a mapping are
//! suppressed.
//!
//! Restricters receive all ids of their collection referenced by the
//! current request and answer in one pass, so relation lookups batch
//! through the fetcher.

use std::collections::HashMap;

use async_trait::async_trait;
use plenum_datastore::Fetcher;
use plenum_key::Key;

use crate::error::Result;
use crate::perm::MeetingPermission;

/// How an invisible field is reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModePolicy {
    /// The key is absent from the emission
    Suppress,
    /// The key is emitted as the stable JSON literal `null`
    Redact,
}

/// The restriction mode of one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldMode {
    /// Mode name, dispatched through [`Collection::restrict_mode`]
    pub mode: &'static str,
    /// What happens to invisible values
    pub policy: ModePolicy,
}

impl FieldMode {
    /// The plain can-see mode with suppression.
    pub const A: FieldMode = FieldMode {
        mode: "A",
        policy: ModePolicy::Suppress,
    };

    /// A private mode that redacts instead of suppressing.
    pub const B_REDACTED: FieldMode = FieldMode {
        mode: "B",
        policy: ModePolicy::Redact,
    };
}

/// Restriction rules for one collection.
#[async_trait]
pub trait Collection: Send + Sync {
    /// The collection this plug-in answers for.
    fn name(&self) -> &'static str;

    /// The mode of `field` (template fields in their bare form), or
    /// `None` for fields that are never visible.
    fn field_mode(&self, field: &str) -> Option<FieldMode>;

    /// The meeting an entity belongs to, or `None` when it does not
    /// exist or lives outside any meeting.
    async fn meeting_id(&self, fetch: &mut Fetcher, id: i32) -> Result<Option<i32>>;

    /// The subset of `ids` whose fields of `mode` the user may see.
    ///
    /// Unknown modes yield no ids.
    async fn restrict_mode(
        &self,
        fetch: &mut Fetcher,
        perms: &mut MeetingPermission,
        mode: &str,
        ids: &[i32],
    ) -> Result<Vec<i32>>;

    /// Superadmin short-circuit; the default allows everything.
    /// Collections hiding data even from superadmins override this.
    async fn super_admin(
        &self,
        fetch: &mut Fetcher,
        perms: &mut MeetingPermission,
        mode: &str,
        ids: &[i32],
    ) -> Result<Vec<i32>> {
        let _ = (fetch, perms, mode);
        Ok(ids.to_vec())
    }
}

/// Group `ids` by the value of a relation field, skipping entities
/// whose relation is absent. One batched read for all ids.
pub async fn group_by_relation(
    fetch: &mut Fetcher,
    field: impl Fn(i32) -> Key,
    ids: &[i32],
) -> Result<HashMap<i32, Vec<i32>>> {
    let slots: Vec<_> = ids
        .iter()
        .map(|&id| (id, fetch.lazy::<i32>(field(id))))
        .collect();
    fetch.execute().await?;

    let mut grouped: HashMap<i32, Vec<i32>> = HashMap::new();
    for (id, slot) in slots {
        if let Some(&related) = slot.value() {
            grouped.entry(related).or_default().push(id);
        }
    }
    Ok(grouped)
}
