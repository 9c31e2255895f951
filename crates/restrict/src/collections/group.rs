//! Restrictions for the group collection
//!
//! Mode A: the user belongs to the group's meeting.

use async_trait::async_trait;
use plenum_datastore::Fetcher;
use plenum_key::Key;

use crate::collection::{Collection, FieldMode, group_by_relation};
use crate::error::Result;
use crate::perm::MeetingPermission;

pub struct Group;

#[async_trait]
impl Collection for Group {
    fn name(&self) -> &'static str {
        "group"
    }

    fn field_mode(&self, field: &str) -> Option<FieldMode> {
        match field {
            "id" | "name" | "permissions" | "meeting_id" | "user_ids" => Some(FieldMode::A),
            _ => None,
        }
    }

    async fn meeting_id(&self, fetch: &mut Fetcher, id: i32) -> Result<Option<i32>> {
        Ok(fetch.value(Key::new("group", id, "meeting_id")).await?)
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
        let by_meeting =
            group_by_relation(fetch, |id| Key::new("group", id, "meeting_id"), ids).await?;

        let mut allowed = Vec::new();
        for (meeting_id, group_ids) in by_meeting {
            if perms.meeting(fetch, meeting_id).await?.is_member() {
                allowed.extend(group_ids);
            }
        }
        Ok(allowed)
    }
}
