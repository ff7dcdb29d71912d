//! Posts, comments, votes, reactions and notifications.

use serde::Serialize;
use tracing::info;

use crate::db::schemas::{
    Comment, Membership, Notification, Post, Profile, Reaction, ReplyRef, SubjectRef, UserRef, Vote,
    PROFILE_KEY,
};
use crate::db::{Database, Record};
use crate::node::Node;
use crate::store::ListOpts;
use crate::types::{AgoraError, Result};
use crate::util::{now, time_key};

/// Key and url of a written record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedRecord {
    pub key: String,
    pub url: String,
}

/// The community a post is tagged with, which the author must have joined.
async fn joined_community(public: &Database, community_id: Option<&str>) -> Result<Option<UserRef>> {
    let Some(community_id) = community_id else {
        return Ok(None);
    };
    public
        .table::<Membership>()
        .get(community_id)
        .await?
        .map(|m| Some(m.community))
        .ok_or_else(|| AgoraError::Validation(format!("Not a member of {community_id}")))
}

pub async fn update_profile(node: &Node, user_id: &str, profile: &Profile) -> Result<()> {
    let citizen = node.citizen(user_id)?;
    citizen.public.table::<Profile>().put(PROFILE_KEY, profile).await?;
    node.after_write(&citizen.public).await;
    Ok(())
}

pub async fn create_post(
    node: &Node,
    user_id: &str,
    text: &str,
    community_id: Option<&str>,
) -> Result<CreatedRecord> {
    let citizen = node.citizen(user_id)?;
    let community = joined_community(&citizen.public, community_id).await?;

    let key = time_key();
    let post = Post {
        text: text.to_string(),
        community,
        created_at: now(),
    };
    citizen.public.table::<Post>().put(&key, &post).await?;
    let url = citizen.public.record_url(Post::TABLE, &key);
    info!(user_id = %user_id, post = %url, "Post created");

    node.after_write(&citizen.public).await;
    Ok(CreatedRecord { key, url })
}

/// Reply to `root_url`, or to `parent_url` inside the root's thread.
pub async fn create_comment(
    node: &Node,
    user_id: &str,
    text: &str,
    root_url: &str,
    parent_url: Option<&str>,
    community_id: Option<&str>,
) -> Result<CreatedRecord> {
    let citizen = node.citizen(user_id)?;
    let community = joined_community(&citizen.public, community_id).await?;

    let key = time_key();
    let comment = Comment {
        text: text.to_string(),
        reply: ReplyRef {
            root: SubjectRef::new(root_url)?,
            parent: parent_url.map(SubjectRef::new).transpose()?,
        },
        community,
        created_at: now(),
    };
    citizen.public.table::<Comment>().put(&key, &comment).await?;
    let url = citizen.public.record_url(Comment::TABLE, &key);
    info!(user_id = %user_id, comment = %url, root = %root_url, "Comment created");

    node.after_write(&citizen.public).await;
    Ok(CreatedRecord { key, url })
}

/// Vote on a record; voting again replaces the previous vote.
pub async fn put_vote(node: &Node, user_id: &str, subject_url: &str, vote: i8) -> Result<CreatedRecord> {
    let citizen = node.citizen(user_id)?;
    let key = Vote::key_for(subject_url);
    let record = Vote {
        subject: SubjectRef::new(subject_url)?,
        vote,
        created_at: now(),
    };
    citizen.public.table::<Vote>().put(&key, &record).await?;
    node.after_write(&citizen.public).await;
    Ok(CreatedRecord {
        url: citizen.public.record_url(Vote::TABLE, &key),
        key,
    })
}

pub async fn del_vote(node: &Node, user_id: &str, subject_url: &str) -> Result<bool> {
    let citizen = node.citizen(user_id)?;
    let votes = citizen.public.table::<Vote>();
    let key = Vote::key_for(subject_url);
    if votes.get(&key).await?.is_none() {
        return Ok(false);
    }
    votes.del(&key).await?;
    node.after_write(&citizen.public).await;
    Ok(true)
}

pub async fn put_reaction(
    node: &Node,
    user_id: &str,
    subject_url: &str,
    reaction: &str,
) -> Result<CreatedRecord> {
    let citizen = node.citizen(user_id)?;
    let key = Reaction::key_for(subject_url, reaction);
    let record = Reaction {
        subject: SubjectRef::new(subject_url)?,
        reaction: reaction.to_string(),
        created_at: now(),
    };
    citizen.public.table::<Reaction>().put(&key, &record).await?;
    node.after_write(&citizen.public).await;
    Ok(CreatedRecord {
        url: citizen.public.record_url(Reaction::TABLE, &key),
        key,
    })
}

pub async fn del_reaction(node: &Node, user_id: &str, subject_url: &str, reaction: &str) -> Result<bool> {
    let citizen = node.citizen(user_id)?;
    let reactions = citizen.public.table::<Reaction>();
    let key = Reaction::key_for(subject_url, reaction);
    if reactions.get(&key).await?.is_none() {
        return Ok(false);
    }
    reactions.del(&key).await?;
    node.after_write(&citizen.public).await;
    Ok(true)
}

/// Newest notifications first.
pub async fn list_notifications(node: &Node, user_id: &str, limit: usize) -> Result<Vec<Notification>> {
    let citizen = node.citizen(user_id)?;
    let mut notifications: Vec<Notification> = citizen
        .private
        .table::<Notification>()
        .list(&ListOpts::new())
        .await?
        .into_iter()
        .map(|(_, n)| n)
        .collect();
    notifications.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.item_url.cmp(&a.item_url))
    });
    notifications.truncate(limit);
    Ok(notifications)
}
