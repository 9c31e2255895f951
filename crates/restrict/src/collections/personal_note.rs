//! Restrictions for the personal_note collection
//!
//! A personal note is visible only to the user it belongs to. This
//! holds for superadmins as well, which makes this collection the
//! canonical override of the superadmin short-circuit.

use async_trait::async_trait;
use plenum_datastore::Fetcher;
use plenum_key::Key;

use crate::collection::{Collection, FieldMode, group_by_relation};
use crate::error::Result;
use crate::perm::MeetingPermission;

pub struct PersonalNote;

#[async_trait]
impl Collection for PersonalNote {
    fn name(&self) -> &'static str {
        "personal_note"
    }

    fn field_mode(&self, field: &str) -> Option<FieldMode> {
        match field {
            "id" | "note" | "star" | "user_id" | "meeting_id" | "content_object_id" => {
                Some(FieldMode::A)
            }
            _ => None,
        }
    }

    async fn meeting_id(&self, fetch: &mut Fetcher, id: i32) -> Result<Option<i32>> {
        Ok(fetch
            .value(Key::new("personal_note", id, "meeting_id"))
            .await?)
    }

    async fn restrict_mode(
        &self,
        fetch: &mut Fetcher,
        perms: &mut MeetingPermission,
        mode: &str,
        ids: &[i32],
    ) -> Result<Vec<i32>> {
        if mode != "A" {
            return Ok(Vec::new());
        }
        let by_owner =
            group_by_relation(fetch, |id| Key::new("personal_note", id, "user_id"), ids).await?;

        Ok(by_owner
            .into_iter()
            .filter(|(owner, _)| *owner == perms.user_id())
            .flat_map(|(_, ids)| ids)
            .collect())
    }

    async fn super_admin(
        &self,
        fetch: &mut Fetcher,
        perms: &mut MeetingPermission,
        mode: &str,
        ids: &[i32],
    ) -> Result<Vec<i32>> {
        // Superadmins do not see other users' notes either.
        self.restrict_mode(fetch, perms, mode, ids).await
    }
}
