//! Restrictions for the chat collections
//!
//! A chat group is visible to users with `chat.can_manage` and to
//! members of its read or write groups. A chat message is visible to
//! users with `chat.can_manage`, to members of the chat group's read
//! groups, and to its author.

use async_trait::async_trait;
use plenum_datastore::Fetcher;
use plenum_key::Key;

use crate::collection::{Collection, FieldMode, group_by_relation};
use crate::error::Result;
use crate::perm::{MeetingPermission, Permission};

pub struct ChatGroup;

#[async_trait]
impl Collection for ChatGroup {
    fn name(&self) -> &'static str {
        "chat_group"
    }

    fn field_mode(&self, field: &str) -> Option<FieldMode> {
        match field {
            "id" | "name" | "meeting_id" | "read_group_ids" | "write_group_ids"
            | "chat_message_ids" => Some(FieldMode::A),
            _ => None,
        }
    }

    async fn meeting_id(&self, fetch: &mut Fetcher, id: i32) -> Result<Option<i32>> {
        Ok(fetch.value(Key::new("chat_group", id, "meeting_id")).await?)
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
            group_by_relation(fetch, |id| Key::new("chat_group", id, "meeting_id"), ids).await?;

        let mut allowed = Vec::new();
        for (meeting_id, chat_group_ids) in by_meeting {
            let meeting = perms.meeting(fetch, meeting_id).await?;
            if !meeting.is_member() {
                continue;
            }
            if meeting.has(Permission::CHAT_CAN_MANAGE) {
                allowed.extend(chat_group_ids);
                continue;
            }

            let slots: Vec<_> = chat_group_ids
                .iter()
                .map(|&id| {
                    (
                        id,
                        fetch.lazy::<Vec<i32>>(Key::new("chat_group", id, "read_group_ids")),
                        fetch.lazy::<Vec<i32>>(Key::new("chat_group", id, "write_group_ids")),
                    )
                })
                .collect();
            fetch.execute().await?;

            for (id, read, write) in slots {
                let readable = read
                    .value()
                    .map(|groups| groups.iter().any(|&group| meeting.in_group(group)))
                    .unwrap_or(false);
                let writable = write
                    .value()
                    .map(|groups| groups.iter().any(|&group| meeting.in_group(group)))
                    .unwrap_or(false);
                if readable || writable {
                    allowed.push(id);
                }
            }
        }
        Ok(allowed)
    }
}

pub struct ChatMessage;

#[async_trait]
impl Collection for ChatMessage {
    fn name(&self) -> &'static str {
        "chat_message"
    }

    fn field_mode(&self, field: &str) -> Option<FieldMode> {
        match field {
            "id" | "content" | "created" | "user_id" | "chat_group_id" => Some(FieldMode::A),
            _ => None,
        }
    }

    async fn meeting_id(&self, fetch: &mut Fetcher, id: i32) -> Result<Option<i32>> {
        let Some(chat_group_id) = fetch
            .value::<i32>(Key::new("chat_message", id, "chat_group_id"))
            .await?
        else {
            return Ok(None);
        };
        ChatGroup.meeting_id(fetch, chat_group_id).await
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
        let by_chat_group = group_by_relation(
            fetch,
            |id| Key::new("chat_message", id, "chat_group_id"),
            ids,
        )
        .await?;

        let mut allowed = Vec::new();
        for (chat_group_id, message_ids) in by_chat_group {
            let Some(meeting_id) = ChatGroup.meeting_id(fetch, chat_group_id).await? else {
                continue;
            };
            let meeting = perms.meeting(fetch, meeting_id).await?;

            if meeting.has(Permission::CHAT_CAN_MANAGE) {
                allowed.extend(message_ids);
                continue;
            }

            let read_groups: Vec<i32> = fetch
                .value(Key::new("chat_group", chat_group_id, "read_group_ids"))
                .await?
                .unwrap_or_default();
            if read_groups.iter().any(|&group| meeting.in_group(group)) {
                allowed.extend(message_ids);
                continue;
            }

            // Authors always see their own messages.
            let slots: Vec<_> = message_ids
                .iter()
                .map(|&id| (id, fetch.lazy::<i32>(Key::new("chat_message", id, "user_id"))))
                .collect();
            fetch.execute().await?;

            for (id, author) in slots {
                if author.value() == Some(&perms.user_id()) {
                    allowed.push(id);
                }
            }
        }
        Ok(allowed)
    }
}
