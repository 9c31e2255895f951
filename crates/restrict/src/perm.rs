//! Permissions and the per-user meeting permission view
//!
//! Permissions are meeting-scoped string identifiers granted through
//! group membership (`user/U/group_ids$M` lists the user's groups,
//! `group/G/permissions` the granted names). Membership in the
//! meeting's admin group grants everything. A permission may imply
//! weaker ones; `can_manage` names include their `can_see`
//! counterpart.
//!
//! [`MeetingPermission`] is built once per request and caches one
//! [`MeetingPerms`] view per meeting.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use plenum_datastore::Fetcher;
use plenum_key::Key;
use tracing::debug;

use crate::error::Result;

/// A meeting-scoped permission name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Permission(&'static str);

impl Permission {
    pub const AGENDA_ITEM_CAN_SEE: Permission = Permission("agenda_item.can_see");
    pub const AGENDA_ITEM_CAN_MANAGE: Permission = Permission("agenda_item.can_manage");
    pub const CHAT_CAN_MANAGE: Permission = Permission("chat.can_manage");
    pub const LIST_OF_SPEAKERS_CAN_SEE: Permission = Permission("list_of_speakers.can_see");
    pub const LIST_OF_SPEAKERS_CAN_MANAGE: Permission = Permission("list_of_speakers.can_manage");
    pub const PROJECTOR_CAN_SEE: Permission = Permission("projector.can_see");
    pub const PROJECTOR_CAN_MANAGE: Permission = Permission("projector.can_manage");
    pub const USER_CAN_SEE: Permission = Permission("user.can_see");
    pub const USER_CAN_MANAGE: Permission = Permission("user.can_manage");

    const ALL: &'static [Permission] = &[
        Self::AGENDA_ITEM_CAN_SEE,
        Self::AGENDA_ITEM_CAN_MANAGE,
        Self::CHAT_CAN_MANAGE,
        Self::LIST_OF_SPEAKERS_CAN_SEE,
        Self::LIST_OF_SPEAKERS_CAN_MANAGE,
        Self::PROJECTOR_CAN_SEE,
        Self::PROJECTOR_CAN_MANAGE,
        Self::USER_CAN_SEE,
        Self::USER_CAN_MANAGE,
    ];

    /// Parse a permission name from stored group data.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.0 == s)
    }

    /// The permission name.
    pub fn as_str(&self) -> &'static str {
        self.0
    }

    /// Weaker permissions this one implies.
    pub fn implied(&self) -> &'static [Permission] {
        match *self {
            Self::AGENDA_ITEM_CAN_MANAGE => &[Self::AGENDA_ITEM_CAN_SEE],
            Self::LIST_OF_SPEAKERS_CAN_MANAGE => &[Self::LIST_OF_SPEAKERS_CAN_SEE],
            Self::PROJECTOR_CAN_MANAGE => &[Self::PROJECTOR_CAN_SEE],
            Self::USER_CAN_MANAGE => &[Self::USER_CAN_SEE],
            _ => &[],
        }
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

/// The organization management level that bypasses restriction.
const OML_SUPERADMIN: &str = "superadmin";

/// What one user may do in one meeting.
#[derive(Debug, Default)]
pub struct MeetingPerms {
    /// Member of the meeting's admin group
    admin: bool,
    /// Groups of the user in this meeting
    groups: HashSet<i32>,
    /// Granted permissions, implication closure included
    permissions: HashSet<Permission>,
}

impl MeetingPerms {
    /// Whether the user holds `permission` in this meeting.
    pub fn has(&self, permission: Permission) -> bool {
        self.admin || self.permissions.contains(&permission)
    }

    /// Whether the user is in group `id`.
    pub fn in_group(&self, id: i32) -> bool {
        self.groups.contains(&id)
    }

    /// Whether the user belongs to this meeting at all.
    pub fn is_member(&self) -> bool {
        self.admin || !self.groups.is_empty()
    }
}

/// Per-user permission view, built once per request.
///
/// Meeting views are loaded lazily and cached; the superadmin check
/// reads the user's organization management level once.
pub struct MeetingPermission {
    user_id: i32,
    meetings: HashMap<i32, Arc<MeetingPerms>>,
    superadmin: Option<bool>,
}

impl MeetingPermission {
    /// A view for `user_id`. Id `0` is the anonymous user, which has
    /// no groups anywhere.
    pub fn new(user_id: i32) -> Self {
        Self {
            user_id,
            meetings: HashMap::new(),
            superadmin: None,
        }
    }

    /// The requesting user.
    pub fn user_id(&self) -> i32 {
        self.user_id
    }

    /// Whether the user holds the superadmin management level.
    pub async fn is_superadmin(&mut self, fetch: &mut Fetcher) -> Result<bool> {
        if let Some(known) = self.superadmin {
            return Ok(known);
        }
        let level = if self.user_id == 0 {
            None
        } else {
            fetch
                .value::<String>(Key::new(
                    "user",
                    self.user_id,
                    "organization_management_level",
                ))
                .await?
        };
        let superadmin = level.as_deref() == Some(OML_SUPERADMIN);
        self.superadmin = Some(superadmin);
        Ok(superadmin)
    }

    /// The user's permissions in `meeting_id`, loading them on first
    /// use.
    pub async fn meeting(
        &mut self,
        fetch: &mut Fetcher,
        meeting_id: i32,
    ) -> Result<Arc<MeetingPerms>> {
        if let Some(perms) = self.meetings.get(&meeting_id) {
            return Ok(perms.clone());
        }
        let perms = Arc::new(self.load_meeting(fetch, meeting_id).await?);
        self.meetings.insert(meeting_id, perms.clone());
        Ok(perms)
    }

    async fn load_meeting(&self, fetch: &mut Fetcher, meeting_id: i32) -> Result<MeetingPerms> {
        if self.user_id == 0 {
            return Ok(MeetingPerms::default());
        }

        let group_ids_key =
            Key::new("user", self.user_id, "group_ids$").concrete(&meeting_id.to_string());
        let group_ids = fetch.lazy::<Vec<i32>>(group_ids_key);
        let admin_group = fetch.lazy::<i32>(Key::new("meeting", meeting_id, "admin_group_id"));
        fetch.execute().await?;

        let groups: HashSet<i32> = group_ids
            .value()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .collect();
        if groups.is_empty() {
            return Ok(MeetingPerms::default());
        }

        if let Some(&admin_group) = admin_group.value()
            && groups.contains(&admin_group)
        {
            return Ok(MeetingPerms {
                admin: true,
                groups,
                permissions: HashSet::new(),
            });
        }

        let slots: Vec<_> = groups
            .iter()
            .map(|&group_id| fetch.lazy::<Vec<String>>(Key::new("group", group_id, "permissions")))
            .collect();
        fetch.execute().await?;

        let mut permissions = HashSet::new();
        for slot in slots {
            for name in slot.value().cloned().unwrap_or_default() {
                match Permission::parse(&name) {
                    Some(permission) => grant(&mut permissions, permission),
                    None => debug!(permission = %name, "ignoring unknown permission"),
                }
            }
        }

        Ok(MeetingPerms {
            admin: false,
            groups,
            permissions,
        })
    }
}

/// Insert a permission together with everything it implies.
fn grant(into: &mut HashSet<Permission>, permission: Permission) {
    if into.insert(permission) {
        for &implied in permission.implied() {
            grant(into, implied);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plenum_datastore::stub;
    use serde_json::json;

    #[test]
    fn test_parse_known_permission() {
        assert_eq!(
            Permission::parse("chat.can_manage"),
            Some(Permission::CHAT_CAN_MANAGE)
        );
        assert_eq!(Permission::parse("nope.can_fly"), None);
    }

    #[test]
    fn test_implication_closure() {
        let mut set = HashSet::new();
        grant(&mut set, Permission::USER_CAN_MANAGE);
        assert!(set.contains(&Permission::USER_CAN_SEE));
    }

    #[tokio::test]
    async fn test_permissions_from_group_membership() {
        let (ds, _source) = stub::datastore(json!({
            "user/1/group_ids$7": [10],
            "group/10/permissions": ["chat.can_manage"],
            "meeting/7/admin_group_id": 99,
        }));
        let mut fetch = Fetcher::new(&ds);
        let mut perms = MeetingPermission::new(1);

        let meeting = perms.meeting(&mut fetch, 7).await.unwrap();
        assert!(meeting.has(Permission::CHAT_CAN_MANAGE));
        assert!(!meeting.has(Permission::PROJECTOR_CAN_SEE));
        assert!(meeting.in_group(10));
        assert!(meeting.is_member());
    }

    #[tokio::test]
    async fn test_admin_group_grants_everything() {
        let (ds, _source) = stub::datastore(json!({
            "user/1/group_ids$7": [99],
            "meeting/7/admin_group_id": 99,
        }));
        let mut fetch = Fetcher::new(&ds);
        let mut perms = MeetingPermission::new(1);

        let meeting = perms.meeting(&mut fetch, 7).await.unwrap();
        assert!(meeting.has(Permission::CHAT_CAN_MANAGE));
        assert!(meeting.has(Permission::PROJECTOR_CAN_SEE));
    }

    #[tokio::test]
    async fn test_no_groups_means_no_membership() {
        let (ds, _source) = stub::datastore(json!({}));
        let mut fetch = Fetcher::new(&ds);
        let mut perms = MeetingPermission::new(1);

        let meeting = perms.meeting(&mut fetch, 7).await.unwrap();
        assert!(!meeting.is_member());
        assert!(!meeting.has(Permission::CHAT_CAN_MANAGE));
    }

    #[tokio::test]
    async fn test_anonymous_user() {
        let (ds, source) = stub::datastore(json!({}));
        let mut fetch = Fetcher::new(&ds);
        let mut perms = MeetingPermission::new(0);

        assert!(!perms.is_superadmin(&mut fetch).await.unwrap());
        let meeting = perms.meeting(&mut fetch, 7).await.unwrap();
        assert!(!meeting.is_member());
        // Anonymous never touches the datastore.
        assert_eq!(source.request_count(), 0);
    }

    #[tokio::test]
    async fn test_superadmin_level() {
        let (ds, _source) = stub::datastore(json!({
            "user/1/organization_management_level": "superadmin",
        }));
        let mut fetch = Fetcher::new(&ds);
        let mut perms = MeetingPermission::new(1);

        assert!(perms.is_superadmin(&mut fetch).await.unwrap());
    }

    #[tokio::test]
    async fn test_meeting_view_is_cached() {
        let (ds, source) = stub::datastore(json!({
            "user/1/group_ids$7": [10],
            "group/10/permissions": ["chat.can_manage"],
            "meeting/7/admin_group_id": 99,
        }));
        let mut fetch = Fetcher::new(&ds);
        let mut perms = MeetingPermission::new(1);

        perms.meeting(&mut fetch, 7).await.unwrap();
        let before = source.request_count();
        perms.meeting(&mut fetch, 7).await.unwrap();
        assert_eq!(source.request_count(), before);
    }
}
