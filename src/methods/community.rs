//! Community methods: membership, bans, roles and profile.
//!
//! Lock order is members, then bans, then roles. Every handler that touches
//! more than one of these tables takes them in that order.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::handlers::{MethodContext, MethodHandler, MethodRegistry};
use crate::db::schemas::{
    permissions, Ban, Member, Profile, Role, UserRef, ADMIN_ROLE, PROFILE_KEY,
};
use crate::types::{AgoraError, Result};
use crate::util::now;

pub(super) fn register(registry: &mut MethodRegistry) {
    registry.register(Arc::new(Join));
    registry.register(Arc::new(Leave));
    registry.register(Arc::new(RemoveMember));
    registry.register(Arc::new(PutBan));
    registry.register(Arc::new(DeleteBan));
    registry.register(Arc::new(SetMemberRoles));
    registry.register(Arc::new(PutRole));
    registry.register(Arc::new(UpdateProfile));
}

// =============================================================================
// Membership
// =============================================================================

struct Join;

#[async_trait]
impl MethodHandler for Join {
    fn name(&self) -> &'static str {
        "community-join"
    }

    async fn handle(&self, ctx: &MethodContext, _args: Value) -> Result<Value> {
        let _members = ctx.locks.lock(&ctx.lock_name("members")).await;
        let _bans = ctx.locks.lock(&ctx.lock_name("bans")).await;

        let user_id = &ctx.caller.user_id;
        if let Some(ban) = ctx.database.table::<Ban>().get(user_id).await? {
            return Err(AgoraError::Permissions(match ban.reason {
                Some(reason) => format!("{user_id} is banned: {reason}"),
                None => format!("{user_id} is banned"),
            }));
        }

        let members = ctx.database.table::<Member>();
        if let Some(existing) = members.get(user_id).await? {
            return Ok(json!({ "member": existing, "alreadyMember": true }));
        }

        let member = Member {
            user: ctx.caller.clone(),
            roles: Vec::new(),
            joined_at: now(),
        };
        members.put(user_id, &member).await?;
        info!(community = %ctx.database.url(), user_id = %user_id, "Member joined");
        Ok(json!({ "member": member }))
    }
}

struct Leave;

#[async_trait]
impl MethodHandler for Leave {
    fn name(&self) -> &'static str {
        "community-leave"
    }

    async fn handle(&self, ctx: &MethodContext, _args: Value) -> Result<Value> {
        let _members = ctx.locks.lock(&ctx.lock_name("members")).await;

        let members = ctx.database.table::<Member>();
        let user_id = &ctx.caller.user_id;
        let was_member = members.get(user_id).await?.is_some();
        if was_member {
            members.del(user_id).await?;
            info!(community = %ctx.database.url(), user_id = %user_id, "Member left");
        }
        Ok(json!({ "left": was_member }))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoveMemberArgs {
    member_id: String,
    #[serde(default)]
    ban: bool,
    #[serde(default)]
    ban_reason: Option<String>,
}

struct RemoveMember;

#[async_trait]
impl MethodHandler for RemoveMember {
    fn name(&self) -> &'static str {
        "community-remove-member"
    }

    async fn handle(&self, ctx: &MethodContext, args: Value) -> Result<Value> {
        let args: RemoveMemberArgs = serde_json::from_value(args)?;
        let caller = ctx.require_permission(permissions::REMOVE_MEMBER).await?;
        if args.ban {
            ctx.require_permission(permissions::BAN).await?;
        }
        if args.member_id == ctx.caller.user_id {
            return Err(AgoraError::Validation(
                "Use community-leave to remove yourself".to_string(),
            ));
        }

        let _members = ctx.locks.lock(&ctx.lock_name("members")).await;
        let _bans = ctx.locks.lock(&ctx.lock_name("bans")).await;

        let members = ctx.database.table::<Member>();
        let member = members
            .get(&args.member_id)
            .await?
            .ok_or_else(|| AgoraError::NotFound(format!("Member {}", args.member_id)))?;
        if member.is_admin() && !caller.is_admin() {
            return Err(AgoraError::Permissions(
                "Only admins can remove admins".to_string(),
            ));
        }
        members.del(&args.member_id).await?;

        if args.ban {
            let ban = Ban {
                user: member.user.clone(),
                reason: args.ban_reason,
                created_by: ctx.caller.user_id.clone(),
                created_at: now(),
            };
            ctx.database.table::<Ban>().put(&args.member_id, &ban).await?;
        }
        info!(
            community = %ctx.database.url(),
            member_id = %args.member_id,
            banned = args.ban,
            by = %ctx.caller.user_id,
            "Member removed"
        );
        Ok(json!({ "removed": args.member_id, "banned": args.ban }))
    }
}

// =============================================================================
// Bans
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PutBanArgs {
    user: UserRef,
    #[serde(default)]
    reason: Option<String>,
}

struct PutBan;

#[async_trait]
impl MethodHandler for PutBan {
    fn name(&self) -> &'static str {
        "community-put-ban"
    }

    async fn handle(&self, ctx: &MethodContext, args: Value) -> Result<Value> {
        let args: PutBanArgs = serde_json::from_value(args)?;
        let caller = ctx.require_permission(permissions::BAN).await?;
        if args.user.user_id == ctx.caller.user_id {
            return Err(AgoraError::Validation("Cannot ban yourself".to_string()));
        }

        let _members = ctx.locks.lock(&ctx.lock_name("members")).await;
        let _bans = ctx.locks.lock(&ctx.lock_name("bans")).await;

        let members = ctx.database.table::<Member>();
        if let Some(member) = members.get(&args.user.user_id).await? {
            if member.is_admin() && !caller.is_admin() {
                return Err(AgoraError::Permissions("Only admins can ban admins".to_string()));
            }
            members.del(&args.user.user_id).await?;
        }

        let ban = Ban {
            user: args.user,
            reason: args.reason,
            created_by: ctx.caller.user_id.clone(),
            created_at: now(),
        };
        ctx.database.table::<Ban>().put(&ban.user.user_id, &ban).await?;
        info!(community = %ctx.database.url(), user_id = %ban.user.user_id, "User banned");
        Ok(json!({ "ban": ban }))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteBanArgs {
    user_id: String,
}

struct DeleteBan;

#[async_trait]
impl MethodHandler for DeleteBan {
    fn name(&self) -> &'static str {
        "community-delete-ban"
    }

    async fn handle(&self, ctx: &MethodContext, args: Value) -> Result<Value> {
        let args: DeleteBanArgs = serde_json::from_value(args)?;
        ctx.require_permission(permissions::BAN).await?;

        let _bans = ctx.locks.lock(&ctx.lock_name("bans")).await;
        let bans = ctx.database.table::<Ban>();
        if bans.get(&args.user_id).await?.is_none() {
            return Err(AgoraError::NotFound(format!("Ban on {}", args.user_id)));
        }
        bans.del(&args.user_id).await?;
        info!(community = %ctx.database.url(), user_id = %args.user_id, "Ban lifted");
        Ok(json!({ "unbanned": args.user_id }))
    }
}

// =============================================================================
// Roles
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetMemberRolesArgs {
    member_id: String,
    roles: Vec<String>,
}

struct SetMemberRoles;

#[async_trait]
impl MethodHandler for SetMemberRoles {
    fn name(&self) -> &'static str {
        "community-set-member-roles"
    }

    async fn handle(&self, ctx: &MethodContext, args: Value) -> Result<Value> {
        let mut args: SetMemberRolesArgs = serde_json::from_value(args)?;
        let caller = ctx.require_permission(permissions::MANAGE_ROLES).await?;
        args.roles.sort();
        args.roles.dedup();

        let _members = ctx.locks.lock(&ctx.lock_name("members")).await;
        let _roles = ctx.locks.lock(&ctx.lock_name("roles")).await;

        let members = ctx.database.table::<Member>();
        let mut member = members
            .get(&args.member_id)
            .await?
            .ok_or_else(|| AgoraError::NotFound(format!("Member {}", args.member_id)))?;

        let touches_admin = member.is_admin() || args.roles.iter().any(|r| r == ADMIN_ROLE);
        if touches_admin && !caller.is_admin() {
            return Err(AgoraError::Permissions(
                "Only admins can grant or revoke admin".to_string(),
            ));
        }

        let roles = ctx.database.table::<Role>();
        for role_id in args.roles.iter().filter(|r| *r != ADMIN_ROLE) {
            if roles.get(role_id).await?.is_none() {
                return Err(AgoraError::Validation(format!("Unknown role: {role_id}")));
            }
        }

        member.roles = args.roles;
        members.put(&args.member_id, &member).await?;
        Ok(json!({ "member": member }))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PutRoleArgs {
    role_id: String,
    #[serde(default)]
    permissions: Vec<String>,
}

struct PutRole;

#[async_trait]
impl MethodHandler for PutRole {
    fn name(&self) -> &'static str {
        "community-put-role"
    }

    async fn handle(&self, ctx: &MethodContext, args: Value) -> Result<Value> {
        let args: PutRoleArgs = serde_json::from_value(args)?;
        ctx.require_permission(permissions::MANAGE_ROLES).await?;
        if args.role_id == ADMIN_ROLE {
            return Err(AgoraError::Validation(
                "The admin role cannot be redefined".to_string(),
            ));
        }

        let _roles = ctx.locks.lock(&ctx.lock_name("roles")).await;
        let role = Role {
            role_id: args.role_id,
            permissions: args.permissions,
        };
        ctx.database.table::<Role>().put(&role.role_id, &role).await?;
        Ok(json!({ "role": role }))
    }
}

// =============================================================================
// Profile
// =============================================================================

struct UpdateProfile;

#[async_trait]
impl MethodHandler for UpdateProfile {
    fn name(&self) -> &'static str {
        "community-update-profile"
    }

    async fn handle(&self, ctx: &MethodContext, args: Value) -> Result<Value> {
        let profile: Profile = serde_json::from_value(args)?;
        ctx.require_permission(permissions::UPDATE_PROFILE).await?;

        let _profile = ctx.locks.lock(&ctx.lock_name("profile")).await;
        ctx.database.table::<Profile>().put(PROFILE_KEY, &profile).await?;
        Ok(json!({ "profile": profile }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schemas::ResultCode;
    use crate::db::{Capabilities, DatabaseKind, DatabaseRegistry};
    use crate::locks::LockRegistry;
    use crate::store::MemoryNetwork;

    struct Fixture {
        methods: MethodRegistry,
        database: Arc<crate::db::Database>,
        locks: LockRegistry,
    }

    impl Fixture {
        async fn new() -> Self {
            let registry = DatabaseRegistry::spawn(Arc::new(MemoryNetwork::new()));
            let database = registry
                .create(
                    DatabaseKind::PublicCommunity,
                    Some("club@a.example".into()),
                    Capabilities::none(),
                )
                .await
                .unwrap();
            let admin = Member {
                user: user("admin@a.example"),
                roles: vec![ADMIN_ROLE.into()],
                joined_at: now(),
            };
            database
                .table::<Member>()
                .put("admin@a.example", &admin)
                .await
                .unwrap();
            Self {
                methods: MethodRegistry::with_defaults(),
                database,
                locks: LockRegistry::new(),
            }
        }

        async fn call(&self, caller: &str, method: &str, args: Value) -> ResultCode {
            let ctx = MethodContext {
                database: Arc::clone(&self.database),
                caller: user(caller),
                call_url: format!("agora://{caller}/method-calls/1"),
                locks: self.locks.clone(),
            };
            self.methods.dispatch(method, &ctx, args).await.unwrap().code
        }

        async fn is_member(&self, user_id: &str) -> bool {
            self.database
                .table::<Member>()
                .get(user_id)
                .await
                .unwrap()
                .is_some()
        }
    }

    fn user(user_id: &str) -> UserRef {
        UserRef {
            user_id: user_id.to_string(),
            db_url: format!("agora://{}/", user_id.replace('@', "-")),
        }
    }

    #[tokio::test]
    async fn test_join_and_leave() {
        let f = Fixture::new().await;
        assert_eq!(f.call("bob@a.example", "community-join", json!({})).await, ResultCode::Success);
        assert!(f.is_member("bob@a.example").await);
        // Joining twice is fine
        assert_eq!(f.call("bob@a.example", "community-join", json!({})).await, ResultCode::Success);

        assert_eq!(f.call("bob@a.example", "community-leave", json!({})).await, ResultCode::Success);
        assert!(!f.is_member("bob@a.example").await);
    }

    #[tokio::test]
    async fn test_banned_user_cannot_join() {
        let f = Fixture::new().await;
        let code = f
            .call(
                "admin@a.example",
                "community-put-ban",
                json!({ "user": user("eve@b.example"), "reason": "spam" }),
            )
            .await;
        assert_eq!(code, ResultCode::Success);

        assert_eq!(
            f.call("eve@b.example", "community-join", json!({})).await,
            ResultCode::PermissionDenied
        );
        assert!(!f.is_member("eve@b.example").await);

        f.call("admin@a.example", "community-delete-ban", json!({ "userId": "eve@b.example" }))
            .await;
        assert_eq!(f.call("eve@b.example", "community-join", json!({})).await, ResultCode::Success);
    }

    #[tokio::test]
    async fn test_remove_member_with_ban() {
        let f = Fixture::new().await;
        f.call("bob@a.example", "community-join", json!({})).await;
        f.call("carl@a.example", "community-join", json!({})).await;

        // Plain members cannot remove others
        assert_eq!(
            f.call("carl@a.example", "community-remove-member", json!({ "memberId": "bob@a.example" }))
                .await,
            ResultCode::PermissionDenied
        );

        assert_eq!(
            f.call(
                "admin@a.example",
                "community-remove-member",
                json!({ "memberId": "bob@a.example", "ban": true, "banReason": "rude" })
            )
            .await,
            ResultCode::Success
        );
        assert!(!f.is_member("bob@a.example").await);
        let ban = f.database.table::<Ban>().get("bob@a.example").await.unwrap().unwrap();
        assert_eq!(ban.reason.as_deref(), Some("rude"));
        assert_eq!(ban.created_by, "admin@a.example");

        assert_eq!(
            f.call("admin@a.example", "community-remove-member", json!({ "memberId": "nobody@a.example" }))
                .await,
            ResultCode::NotFound
        );
    }

    #[tokio::test]
    async fn test_roles_grant_permissions() {
        let f = Fixture::new().await;
        f.call("mod@a.example", "community-join", json!({})).await;
        f.call("bob@a.example", "community-join", json!({})).await;

        assert_eq!(
            f.call(
                "admin@a.example",
                "community-put-role",
                json!({ "roleId": "moderator", "permissions": [permissions::REMOVE_MEMBER] })
            )
            .await,
            ResultCode::Success
        );
        assert_eq!(
            f.call(
                "admin@a.example",
                "community-set-member-roles",
                json!({ "memberId": "mod@a.example", "roles": ["moderator"] })
            )
            .await,
            ResultCode::Success
        );
        assert_eq!(
            f.call("mod@a.example", "community-remove-member", json!({ "memberId": "bob@a.example" }))
                .await,
            ResultCode::Success
        );

        // Moderators may not hand out admin
        assert_eq!(
            f.call(
                "mod@a.example",
                "community-set-member-roles",
                json!({ "memberId": "mod@a.example", "roles": ["admin"] })
            )
            .await,
            ResultCode::PermissionDenied
        );
    }

    #[tokio::test]
    async fn test_put_role_validation() {
        let f = Fixture::new().await;
        assert_eq!(
            f.call("admin@a.example", "community-put-role", json!({ "roleId": "admin" })).await,
            ResultCode::ValidationFailed
        );
        assert_eq!(
            f.call(
                "admin@a.example",
                "community-put-role",
                json!({ "roleId": "x", "permissions": ["community.fly"] })
            )
            .await,
            ResultCode::ValidationFailed
        );
        assert_eq!(
            f.call("admin@a.example", "community-set-member-roles", json!({ "memberId": "admin@a.example", "roles": ["admin", "ghost"] }))
                .await,
            ResultCode::ValidationFailed
        );
    }

    #[tokio::test]
    async fn test_update_profile() {
        let f = Fixture::new().await;
        assert_eq!(
            f.call(
                "admin@a.example",
                "community-update-profile",
                json!({ "displayName": "The Club" })
            )
            .await,
            ResultCode::Success
        );
        let profile = f.database.table::<Profile>().get(PROFILE_KEY).await.unwrap().unwrap();
        assert_eq!(profile.display_name, "The Club");

        assert_eq!(
            f.call("bob@a.example", "community-update-profile", json!({ "displayName": "Mine" }))
                .await,
            ResultCode::PermissionDenied
        );
    }
}
