//! Feed pages: merged posts decorated with what the server indexes know
//! about them.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::{FeedEntry, FeedMerge, FeedSource};
use crate::db::schemas::{Follow, Member, Post, ReactionTally, ThreadIndex, UserRef, VoteTally};
use crate::db::{Database, Record};
use crate::index::tallies::tally_key;
use crate::node::Node;
use crate::store::ListOpts;
use crate::types::{AgoraError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteSummary {
    pub upvotes: Vec<String>,
    pub downvotes: Vec<String>,
}

/// A post as shown in a feed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedPost {
    pub key: String,
    pub url: String,
    pub author: UserRef,
    pub value: Value,
    pub votes: VoteSummary,
    pub reactions: BTreeMap<String, Vec<String>>,
    pub reply_count: usize,
}

/// Decorate one merged entry from the server indexes. Never reorders.
async fn describe(server: &Database, entry: FeedEntry) -> Result<FeedPost> {
    let row = tally_key(&entry.url);
    let votes = server
        .table::<VoteTally>()
        .get(&row)
        .await?
        .map(|t| VoteSummary {
            upvotes: t.upvotes.into_iter().collect(),
            downvotes: t.downvotes.into_iter().collect(),
        })
        .unwrap_or_default();
    let reactions: BTreeMap<String, Vec<String>> = server
        .table::<ReactionTally>()
        .get(&row)
        .await?
        .map(|t| {
            t.reactions
                .into_iter()
                .map(|(reaction, urls)| (reaction, urls.into_iter().collect::<Vec<_>>()))
                .collect()
        })
        .unwrap_or_default();
    let reply_count = server
        .table::<ThreadIndex>()
        .get(&row)
        .await?
        .map(|t| t.reply_count())
        .unwrap_or(0);

    Ok(FeedPost {
        author: UserRef {
            user_id: entry.source.user_id().unwrap_or_default().to_string(),
            db_url: entry.source.url().to_string(),
        },
        key: entry.key,
        url: entry.url,
        value: entry.value,
        votes,
        reactions,
        reply_count,
    })
}

/// Merge the `posts` of `sources` and decorate the first `limit`.
pub async fn list_feed(
    node: &Node,
    sources: Vec<Arc<Database>>,
    lt: Option<String>,
    limit: usize,
) -> Result<Vec<FeedPost>> {
    let sources = sources
        .into_iter()
        .map(|db| FeedSource::new(db, Post::TABLE))
        .collect();
    let entries = FeedMerge::new(sources, lt).take(limit).await?;

    let mut posts = Vec::with_capacity(entries.len());
    for entry in entries {
        posts.push(describe(node.server_public(), entry).await?);
    }
    Ok(posts)
}

/// Posts by the citizen and everyone they follow whose database is loaded.
pub async fn home_feed(node: &Node, user_id: &str, lt: Option<String>, limit: usize) -> Result<Vec<FeedPost>> {
    let citizen = node.citizen(user_id)?;
    let mut sources = vec![Arc::clone(&citizen.public)];
    for (_, follow) in citizen.public.table::<Follow>().list(&ListOpts::new()).await? {
        match node.registry().get(&follow.subject.db_url) {
            Some(db) => sources.push(db),
            None => debug!(user_id = %user_id, subject = %follow.subject.user_id, "Followed database not loaded"),
        }
    }
    list_feed(node, sources, lt, limit).await
}

/// Posts of members tagged with the community, newest first.
pub async fn community_feed(
    node: &Node,
    community_id: &str,
    lt: Option<String>,
    limit: usize,
) -> Result<Vec<FeedPost>> {
    let community = node
        .registry()
        .public_db(community_id)
        .ok_or_else(|| AgoraError::NotFound(format!("Community {community_id} is not loaded")))?;

    let mut sources = Vec::new();
    for (_, member) in community.table::<Member>().list(&ListOpts::new()).await? {
        match node.registry().get(&member.user.db_url) {
            Some(db) => sources.push(FeedSource::new(db, Post::TABLE)),
            None => debug!(community = %community_id, member = %member.user.user_id, "Member database not loaded"),
        }
    }

    let mut merge = FeedMerge::new(sources, lt);
    let mut posts = Vec::new();
    while posts.len() < limit {
        let Some(entry) = merge.next().await? else {
            break;
        };
        let tagged = serde_json::from_value::<Post>(entry.value.clone())
            .ok()
            .and_then(|post| post.community)
            .map(|c| c.user_id == community_id)
            .unwrap_or(false);
        if tagged {
            posts.push(describe(node.server_public(), entry).await?);
        }
    }
    Ok(posts)
}
