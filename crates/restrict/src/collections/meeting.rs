//! Restrictions for the meeting collection
//!
//! Mode A: the user belongs to the meeting (is in any of its groups).

use async_trait::async_trait;
use plenum_datastore::Fetcher;

use crate::collection::{Collection, FieldMode};
use crate::error::Result;
use crate::perm::MeetingPermission;

pub struct Meeting;

#[async_trait]
impl Collection for Meeting {
    fn name(&self) -> &'static str {
        "meeting"
    }

    fn field_mode(&self, field: &str) -> Option<FieldMode> {
        match field {
            "id" | "name" | "welcome_title" | "description" | "admin_group_id"
            | "chat_group_ids" | "group_ids" | "committee_id" | "projection_ids" => {
                Some(FieldMode::A)
            }
            _ => None,
        }
    }

    async fn meeting_id(&self, _fetch: &mut Fetcher, id: i32) -> Result<Option<i32>> {
        Ok(Some(id))
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
        let mut allowed = Vec::new();
        for &id in ids {
            if perms.meeting(fetch, id).await?.is_member() {
                allowed.push(id);
            }
        }
        Ok(allowed)
    }
}
