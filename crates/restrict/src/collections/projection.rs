//! Restrictions for the projection collection
//!
//! Mode A: the user holds `projector.can_see` in the projection's
//! meeting.

use async_trait::async_trait;
use plenum_datastore::Fetcher;
use plenum_key::Key;

use crate::collection::{Collection, FieldMode, group_by_relation};
use crate::error::Result;
use crate::perm::{MeetingPermission, Permission};

pub struct Projection;

#[async_trait]
impl Collection for Projection {
    fn name(&self) -> &'static str {
        "projection"
    }

    fn field_mode(&self, field: &str) -> Option<FieldMode> {
        match field {
            "id" | "content" | "content_object_id" | "type" | "meeting_id" | "options"
            | "stable" | "current_projector_id" => Some(FieldMode::A),
            _ => None,
        }
    }

    async fn meeting_id(&self, fetch: &mut Fetcher, id: i32) -> Result<Option<i32>> {
        Ok(fetch.value(Key::new("projection", id, "meeting_id")).await?)
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
            group_by_relation(fetch, |id| Key::new("projection", id, "meeting_id"), ids).await?;

        let mut allowed = Vec::new();
        for (meeting_id, projection_ids) in by_meeting {
            if perms
                .meeting(fetch, meeting_id)
                .await?
                .has(Permission::PROJECTOR_CAN_SEE)
            {
                allowed.extend(projection_ids);
            }
        }
        Ok(allowed)
    }
}
