//! Follows, memberships and community administration.
//!
//! Follows and memberships are records in the citizen's public database, so
//! every change here can alter what local indexes subscribe to. Each write is
//! followed by a reconcile pass that loads or drops external databases.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::info;

use super::invoke;
use crate::db::schemas::{Follow, Membership, Profile, UserRef};
use crate::directory::Directory;
use crate::node::Node;
use crate::types::{AgoraError, Result};
use crate::util::now;

// =============================================================================
// Follows
// =============================================================================

/// Follow `subject_id`. Re-following only refreshes the record.
pub async fn follow(node: &Node, user_id: &str, subject_id: &str) -> Result<Follow> {
    if user_id == subject_id {
        return Err(AgoraError::Validation("Cannot follow yourself".to_string()));
    }
    let citizen = node.citizen(user_id)?;
    let subject = node.directory().resolve_user_id(subject_id).await?;

    let record = Follow {
        subject: subject.user_ref(),
        created_at: now(),
    };
    citizen.public.table::<Follow>().put(subject_id, &record).await?;
    info!(user_id = %user_id, subject = %subject_id, "Followed");

    node.after_write(&citizen.public).await;
    node.reconcile().await?;
    Ok(record)
}

/// Stop following `subject_id`. Returns whether a follow existed.
pub async fn unfollow(node: &Node, user_id: &str, subject_id: &str) -> Result<bool> {
    let citizen = node.citizen(user_id)?;
    let follows = citizen.public.table::<Follow>();
    if follows.get(subject_id).await?.is_none() {
        return Ok(false);
    }
    follows.del(subject_id).await?;
    info!(user_id = %user_id, subject = %subject_id, "Unfollowed");

    node.after_write(&citizen.public).await;
    node.reconcile().await?;
    Ok(true)
}

// =============================================================================
// Memberships
// =============================================================================

/// Ask the community to admit the citizen, then record the membership.
///
/// A ban surfaces as a `Permissions` error and nothing is recorded.
pub async fn join_community(
    node: &Node,
    user_id: &str,
    community_id: &str,
    timeout: Option<Duration>,
) -> Result<Membership> {
    let citizen = node.citizen(user_id)?;
    let community = node.directory().resolve_user_id(community_id).await?;
    invoke(node, user_id, community_id, "community-join", json!({}), timeout).await?;

    let membership = Membership {
        community: community.user_ref(),
        joined_at: now(),
    };
    citizen
        .public
        .table::<Membership>()
        .put(community_id, &membership)
        .await?;
    info!(user_id = %user_id, community = %community_id, "Joined community");

    node.after_write(&citizen.public).await;
    node.reconcile().await?;
    Ok(membership)
}

/// Leave a community. The local membership record is removed even when the
/// community no longer lists the citizen.
pub async fn leave_community(
    node: &Node,
    user_id: &str,
    community_id: &str,
    timeout: Option<Duration>,
) -> Result<bool> {
    let citizen = node.citizen(user_id)?;
    let details = invoke(node, user_id, community_id, "community-leave", json!({}), timeout).await?;

    let memberships = citizen.public.table::<Membership>();
    let had_record = memberships.get(community_id).await?.is_some();
    if had_record {
        memberships.del(community_id).await?;
        node.after_write(&citizen.public).await;
        node.reconcile().await?;
    }
    info!(user_id = %user_id, community = %community_id, "Left community");
    Ok(had_record || details["left"].as_bool().unwrap_or(false))
}

// =============================================================================
// Moderation
// =============================================================================

/// Remove a member, optionally banning them.
pub async fn remove_member(
    node: &Node,
    admin_id: &str,
    community_id: &str,
    member_id: &str,
    ban: bool,
    ban_reason: Option<&str>,
) -> Result<Value> {
    invoke(
        node,
        admin_id,
        community_id,
        "community-remove-member",
        json!({ "memberId": member_id, "ban": ban, "banReason": ban_reason }),
        None,
    )
    .await
}

/// Ban a user, member or not.
pub async fn put_ban(
    node: &Node,
    admin_id: &str,
    community_id: &str,
    banned_id: &str,
    reason: Option<&str>,
) -> Result<Value> {
    let banned = node.directory().resolve_user_id(banned_id).await?;
    invoke(
        node,
        admin_id,
        community_id,
        "community-put-ban",
        json!({ "user": banned.user_ref(), "reason": reason }),
        None,
    )
    .await
}

pub async fn delete_ban(node: &Node, admin_id: &str, community_id: &str, banned_id: &str) -> Result<Value> {
    invoke(
        node,
        admin_id,
        community_id,
        "community-delete-ban",
        json!({ "userId": banned_id }),
        None,
    )
    .await
}

pub async fn set_member_roles(
    node: &Node,
    admin_id: &str,
    community_id: &str,
    member_id: &str,
    roles: &[String],
) -> Result<Value> {
    invoke(
        node,
        admin_id,
        community_id,
        "community-set-member-roles",
        json!({ "memberId": member_id, "roles": roles }),
        None,
    )
    .await
}

pub async fn put_role(
    node: &Node,
    admin_id: &str,
    community_id: &str,
    role_id: &str,
    permissions: &[&str],
) -> Result<Value> {
    invoke(
        node,
        admin_id,
        community_id,
        "community-put-role",
        json!({ "roleId": role_id, "permissions": permissions }),
        None,
    )
    .await
}

pub async fn update_community_profile(
    node: &Node,
    admin_id: &str,
    community_id: &str,
    profile: &Profile,
) -> Result<Value> {
    invoke(
        node,
        admin_id,
        community_id,
        "community-update-profile",
        serde_json::to_value(profile)?,
        None,
    )
    .await
}

// =============================================================================
// Items
// =============================================================================

pub async fn create_item(
    node: &Node,
    caller_id: &str,
    community_id: &str,
    class_id: &str,
    qty: u64,
    owner: Option<UserRef>,
) -> Result<Value> {
    invoke(
        node,
        caller_id,
        community_id,
        "create-item",
        json!({ "classId": class_id, "qty": qty, "owner": owner }),
        None,
    )
    .await
}

/// Move `qty` (all when `None`) of an item to another member.
pub async fn transfer_item(
    node: &Node,
    caller_id: &str,
    community_id: &str,
    item_key: &str,
    qty: Option<u64>,
    recipient_id: &str,
) -> Result<Value> {
    let recipient = node.directory().resolve_user_id(recipient_id).await?;
    invoke(
        node,
        caller_id,
        community_id,
        "transfer-item",
        json!({ "itemKey": item_key, "qty": qty, "recipient": recipient.user_ref() }),
        None,
    )
    .await
}
