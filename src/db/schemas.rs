//! Record schemas
//!
//! One struct per table. Table names double as schema identities; keys are
//! documented next to each record.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Record;
use crate::types::{AgoraError, Result};
use crate::util::{hash_key, validate_username, RecordUrl};

// =============================================================================
// Shared references
// =============================================================================

/// A user or community and its public database.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRef {
    pub user_id: String,
    pub db_url: String,
}

/// A record and the database it lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectRef {
    pub db_url: String,
    pub url: String,
}

impl SubjectRef {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        let parsed = RecordUrl::parse(&url)?;
        Ok(Self {
            db_url: parsed.db_url,
            url,
        })
    }

    fn validate(&self) -> Result<()> {
        let parsed = RecordUrl::parse(&self.url)?;
        if parsed.db_url != self.db_url {
            return Err(AgoraError::Validation(format!(
                "Subject {} is not in {}",
                self.url, self.db_url
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbRef {
    pub db_url: String,
}

fn non_empty(field: &str, value: &str, max: usize) -> Result<()> {
    let len = value.chars().count();
    if len == 0 || len > max {
        return Err(AgoraError::Validation(format!(
            "{field} must be 1-{max} characters"
        )));
    }
    Ok(())
}

// =============================================================================
// Content (public citizen databases)
// =============================================================================

/// Key [`PROFILE_KEY`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

pub const PROFILE_KEY: &str = "self";

impl Record for Profile {
    const TABLE: &'static str = "profile";

    fn validate(&self) -> Result<()> {
        non_empty("displayName", &self.display_name, 64)?;
        if let Some(description) = &self.description {
            if description.chars().count() > 256 {
                return Err(AgoraError::Validation(
                    "description must be at most 256 characters".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Key = followed user id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Follow {
    pub subject: UserRef,
    pub created_at: String,
}

impl Record for Follow {
    const TABLE: &'static str = "follows";
}

/// Key = community id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub community: UserRef,
    pub joined_at: String,
}

impl Record for Membership {
    const TABLE: &'static str = "memberships";
}

/// Time-ordered key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub community: Option<UserRef>,
    pub created_at: String,
}

impl Record for Post {
    const TABLE: &'static str = "posts";

    fn validate(&self) -> Result<()> {
        non_empty("text", &self.text, 1024)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyRef {
    pub root: SubjectRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<SubjectRef>,
}

/// Time-ordered key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub text: String,
    pub reply: ReplyRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub community: Option<UserRef>,
    pub created_at: String,
}

impl Record for Comment {
    const TABLE: &'static str = "comments";

    fn validate(&self) -> Result<()> {
        non_empty("text", &self.text, 1024)?;
        self.reply.root.validate()?;
        if let Some(parent) = &self.reply.parent {
            parent.validate()?;
        }
        Ok(())
    }
}

/// Key [`Vote::key_for`], one vote per subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vote {
    pub subject: SubjectRef,
    pub vote: i8,
    pub created_at: String,
}

impl Vote {
    pub fn key_for(subject_url: &str) -> String {
        hash_key(subject_url)
    }
}

impl Record for Vote {
    const TABLE: &'static str = "votes";

    fn validate(&self) -> Result<()> {
        self.subject.validate()?;
        if self.vote != 1 && self.vote != -1 {
            return Err(AgoraError::Validation(format!(
                "vote must be 1 or -1, got {}",
                self.vote
            )));
        }
        Ok(())
    }
}

/// Key [`Reaction::key_for`], one record per subject and reaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub subject: SubjectRef,
    pub reaction: String,
    pub created_at: String,
}

impl Reaction {
    pub fn key_for(subject_url: &str, reaction: &str) -> String {
        hash_key(&format!("{subject_url}\n{reaction}"))
    }
}

impl Record for Reaction {
    const TABLE: &'static str = "reactions";

    fn validate(&self) -> Result<()> {
        self.subject.validate()?;
        non_empty("reaction", &self.reaction, 32)
    }
}

// =============================================================================
// Method calls
// =============================================================================

/// Written by the caller in its own public database. Time-ordered key.
/// `database` is the target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodCall {
    pub database: UserRef,
    pub method: String,
    #[serde(default)]
    pub args: Value,
    pub created_at: String,
}

impl Record for MethodCall {
    const TABLE: &'static str = "method-calls";

    fn validate(&self) -> Result<()> {
        non_empty("method", &self.method, 64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResultCode {
    Success,
    ValidationFailed,
    PermissionDenied,
    NotFound,
    MethodNotFound,
    Error,
}

impl ResultCode {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Written once by the target, keyed by the call URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodResult {
    pub call: SubjectRef,
    pub code: ResultCode,
    #[serde(default)]
    pub details: Value,
    pub created_at: String,
}

impl Record for MethodResult {
    const TABLE: &'static str = "method-results";
}

// =============================================================================
// Communities
// =============================================================================

pub const ADMIN_ROLE: &str = "admin";

pub mod permissions {
    pub const BAN: &str = "community.ban";
    pub const REMOVE_MEMBER: &str = "community.remove-member";
    pub const MANAGE_ROLES: &str = "community.manage-roles";
    pub const UPDATE_PROFILE: &str = "community.update-profile";
    pub const MANAGE_ITEMS: &str = "community.manage-items";

    pub const ALL: [&str; 5] = [BAN, REMOVE_MEMBER, MANAGE_ROLES, UPDATE_PROFILE, MANAGE_ITEMS];
}

/// Key = member user id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub user: UserRef,
    #[serde(default)]
    pub roles: Vec<String>,
    pub joined_at: String,
}

impl Member {
    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|r| r == ADMIN_ROLE)
    }
}

impl Record for Member {
    const TABLE: &'static str = "members";
}

/// Key = banned user id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ban {
    pub user: UserRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub created_by: String,
    pub created_at: String,
}

impl Record for Ban {
    const TABLE: &'static str = "bans";
}

/// Key = role id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub role_id: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl Record for Role {
    const TABLE: &'static str = "roles";

    fn validate(&self) -> Result<()> {
        validate_username(&self.role_id)
            .map_err(|_| AgoraError::Validation(format!("Invalid role id: {}", self.role_id)))?;
        if let Some(unknown) = self
            .permissions
            .iter()
            .find(|p| !permissions::ALL.contains(&p.as_str()))
        {
            return Err(AgoraError::Validation(format!(
                "Unknown permission: {unknown}"
            )));
        }
        Ok(())
    }
}

/// Time-ordered key, or [`Item::split_key_for`] for the part split off by a
/// transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub owner: UserRef,
    pub class_id: String,
    pub qty: u64,
    pub created_at: String,
    /// Url of the call that last moved this item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transfer: Option<String>,
}

impl Item {
    pub fn split_key_for(call_url: &str) -> String {
        hash_key(call_url)
    }
}

impl Record for Item {
    const TABLE: &'static str = "items";

    fn validate(&self) -> Result<()> {
        non_empty("classId", &self.class_id, 64)?;
        if self.qty == 0 {
            return Err(AgoraError::Validation("qty must be positive".to_string()));
        }
        Ok(())
    }
}

// =============================================================================
// Server databases
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UserKind {
    Citizen,
    Community,
}

/// Public server `users` table. Key = username.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerUser {
    pub user_id: String,
    pub db_url: String,
    pub kind: UserKind,
}

impl Record for ServerUser {
    const TABLE: &'static str = "users";
}

/// Private server `accounts` table. Key = username.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub username: String,
    pub public_db_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_db_url: Option<String>,
    pub created_at: String,
}

impl Record for Account {
    const TABLE: &'static str = "accounts";

    fn validate(&self) -> Result<()> {
        validate_username(&self.username)
    }
}

// =============================================================================
// Index state and index tables
// =============================================================================

/// Per-indexer replay position. Key [`IndexState::key_for`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexState {
    pub indexer: String,
    pub subject: DbRef,
    pub last_indexed_seq: u64,
    pub updated_at: String,
}

impl IndexState {
    pub fn key_for(indexer: &str, source_url: &str) -> String {
        format!("{indexer}:{source_url}")
    }
}

impl Record for IndexState {
    const TABLE: &'static str = "index-state";
}

/// What an indexed record pointed at when it was applied, so a later
/// tombstone can be undone. Key `<indexer>:<hash of record url>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexRef {
    pub record_url: String,
    pub subject_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl IndexRef {
    pub fn key_for(indexer: &str, record_url: &str) -> String {
        format!("{indexer}:{}", hash_key(record_url))
    }
}

impl Record for IndexRef {
    const TABLE: &'static str = "index-refs";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationKind {
    Follow,
    Comment,
    Vote,
    Reaction,
}

/// Private citizen notification queue. Key = hash of the item url.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub item_url: String,
    pub author: String,
    pub kind: NotificationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_url: Option<String>,
    pub created_at: String,
}

impl Notification {
    pub fn key_for(item_url: &str) -> String {
        hash_key(item_url)
    }
}

impl Record for Notification {
    const TABLE: &'static str = "notifications-idx";
}

/// Votes on one subject. Key = hash of the subject url.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteTally {
    pub subject_url: String,
    #[serde(default)]
    pub upvotes: BTreeSet<String>,
    #[serde(default)]
    pub downvotes: BTreeSet<String>,
}

impl Record for VoteTally {
    const TABLE: &'static str = "vote-idx";
}

/// Reactions on one subject. Key = hash of the subject url.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionTally {
    pub subject_url: String,
    #[serde(default)]
    pub reactions: BTreeMap<String, BTreeSet<String>>,
}

impl Record for ReactionTally {
    const TABLE: &'static str = "reaction-idx";
}

/// Replies under one root. Key = hash of the root url.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadIndex {
    pub root_url: String,
    /// Reply url -> parent url.
    #[serde(default)]
    pub replies: BTreeMap<String, String>,
}

impl ThreadIndex {
    pub fn reply_count(&self) -> usize {
        self.replies.len()
    }
}

impl Record for ThreadIndex {
    const TABLE: &'static str = "thread-idx";
}

/// Followers of one user. Key = hash of the followed user id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowIndex {
    pub subject_id: String,
    #[serde(default)]
    pub followers: BTreeSet<String>,
}

impl Record for FollowIndex {
    const TABLE: &'static str = "follow-idx";
}
