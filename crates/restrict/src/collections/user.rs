//! Restrictions for the user collection
//!
//! Mode A: the user themselves, or anyone holding `user.can_see` in a
//! meeting the target belongs to.
//!
//! Mode B: the user themselves. Redacted for everyone else, so the
//! key stays visible as `null`.

use async_trait::async_trait;
use plenum_datastore::Fetcher;
use plenum_key::Key;

use crate::collection::{Collection, FieldMode};
use crate::error::Result;
use crate::perm::{MeetingPermission, Permission};

pub struct User;

#[async_trait]
impl Collection for User {
    fn name(&self) -> &'static str {
        "user"
    }

    fn field_mode(&self, field: &str) -> Option<FieldMode> {
        match field {
            "id" | "username" | "first_name" | "last_name" | "meeting_ids" | "group_ids$"
            | "organization_management_level" => Some(FieldMode::A),
            "email" => Some(FieldMode::B_REDACTED),
            _ => None,
        }
    }

    async fn meeting_id(&self, _fetch: &mut Fetcher, _id: i32) -> Result<Option<i32>> {
        // Users live outside any single meeting.
        Ok(None)
    }

    async fn restrict_mode(
        &self,
        fetch: &mut Fetcher,
        perms: &mut MeetingPermission,
        mode: &str,
        ids: &[i32],
    ) -> Result<Vec<i32>> {
        match mode {
            "A" => self.see(fetch, perms, ids).await,
            "B" => Ok(ids
                .iter()
                .copied()
                .filter(|&id| id == perms.user_id())
                .collect()),
            _ => Ok(Vec::new()),
        }
    }
}

impl User {
    async fn see(
        &self,
        fetch: &mut Fetcher,
        perms: &mut MeetingPermission,
        ids: &[i32],
    ) -> Result<Vec<i32>> {
        let slots: Vec<_> = ids
            .iter()
            .map(|&id| (id, fetch.lazy::<Vec<i32>>(Key::new("user", id, "meeting_ids"))))
            .collect();
        fetch.execute().await?;

        let mut allowed = Vec::new();
        'users: for (id, meetings) in slots {
            if id == perms.user_id() {
                allowed.push(id);
                continue;
            }
            for meeting_id in meetings.value().cloned().unwrap_or_default() {
                if perms
                    .meeting(fetch, meeting_id)
                    .await?
                    .has(Permission::USER_CAN_SEE)
                {
                    allowed.push(id);
                    continue 'users;
                }
            }
        }
        Ok(allowed)
    }
}
