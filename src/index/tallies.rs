//! Server-side tallies: votes, reactions, threads and followers.
//!
//! Each tally row aggregates records from many sources, so updates to one row
//! serialize on a resource lock (`<table>:<server db>:<row key>`) on top of the
//! per-source indexer lock. What each record contributed is remembered in
//! `index-refs` so a later tombstone or edit can take it back out.

use async_trait::async_trait;
use tracing::warn;

use super::{IndexRun, Indexer};
use crate::db::schemas::{
    Comment, Follow, FollowIndex, IndexRef, Reaction, ReactionTally, ThreadIndex, Vote, VoteTally,
};
use crate::db::table::decode_record;
use crate::db::Record;
use crate::store::Entry;
use crate::types::Result;
use crate::util::hash_key;

pub const VOTES_ID: &str = "votes";
pub const REACTIONS_ID: &str = "reactions";
pub const COMMENTS_ID: &str = "comments";
pub const FOLLOWS_ID: &str = "follows";

/// Row key of the tallies about `subject` (a record url or a user id).
pub fn tally_key(subject: &str) -> String {
    hash_key(subject)
}

/// Decode a source record, treating invalid ones as absent.
fn decode_source<R: Record>(run: &IndexRun, entry: &Entry) -> Option<R> {
    let value = entry.value.clone()?;
    match decode_record::<R>(value) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!(
                source = %run.source.url(),
                table = %entry.table,
                key = %entry.key,
                error = %e,
                "Ignoring invalid record"
            );
            None
        }
    }
}

fn row_lock(run: &IndexRun, table: &str, row_key: &str) -> String {
    format!("{table}:{}:{row_key}", run.target.url())
}

async fn previous_ref(run: &IndexRun, indexer: &str, record_url: &str) -> Result<Option<IndexRef>> {
    run.target
        .table::<IndexRef>()
        .get(&IndexRef::key_for(indexer, record_url))
        .await
}

async fn set_ref(run: &IndexRun, indexer: &str, index_ref: Option<IndexRef>, record_url: &str) -> Result<()> {
    let refs = run.target.table::<IndexRef>();
    let key = IndexRef::key_for(indexer, record_url);
    match index_ref {
        Some(index_ref) => refs.put(&key, &index_ref).await.map(|_| ()),
        None => {
            if refs.get(&key).await?.is_some() {
                refs.del(&key).await?;
            }
            Ok(())
        }
    }
}

// =============================================================================
// Votes
// =============================================================================

pub struct VotesIndexer;

impl VotesIndexer {
    async fn update(run: &IndexRun, subject_url: &str, record_url: &str, vote: Option<i8>) -> Result<()> {
        let row_key = tally_key(subject_url);
        let _lock = run.locks.lock(&row_lock(run, VoteTally::TABLE, &row_key)).await;

        let tallies = run.target.table::<VoteTally>();
        let mut tally = tallies.get(&row_key).await?.unwrap_or_else(|| VoteTally {
            subject_url: subject_url.to_string(),
            ..Default::default()
        });
        let before = tally.clone();
        tally.upvotes.remove(record_url);
        tally.downvotes.remove(record_url);
        match vote {
            Some(1) => {
                tally.upvotes.insert(record_url.to_string());
            }
            Some(_) => {
                tally.downvotes.insert(record_url.to_string());
            }
            None => {}
        }

        if tally == before {
            return Ok(());
        }
        if tally.upvotes.is_empty() && tally.downvotes.is_empty() {
            tallies.del(&row_key).await?;
        } else {
            tallies.put(&row_key, &tally).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Indexer for VotesIndexer {
    fn id(&self) -> &'static str {
        VOTES_ID
    }

    fn tables(&self) -> &'static [&'static str] {
        &[Vote::TABLE]
    }

    async fn apply(&self, run: &IndexRun, entry: &Entry) -> Result<()> {
        let record_url = run.source.record_url(Vote::TABLE, &entry.key);
        let vote = decode_source::<Vote>(run, entry);

        if let Some(previous) = previous_ref(run, VOTES_ID, &record_url).await? {
            let moved = vote
                .as_ref()
                .map(|v| v.subject.url != previous.subject_url)
                .unwrap_or(true);
            if moved {
                Self::update(run, &previous.subject_url, &record_url, None).await?;
            }
        }

        match vote {
            Some(vote) => {
                Self::update(run, &vote.subject.url, &record_url, Some(vote.vote)).await?;
                let index_ref = IndexRef {
                    record_url: record_url.clone(),
                    subject_url: vote.subject.url,
                    detail: None,
                };
                set_ref(run, VOTES_ID, Some(index_ref), &record_url).await
            }
            None => set_ref(run, VOTES_ID, None, &record_url).await,
        }
    }
}

// =============================================================================
// Reactions
// =============================================================================

pub struct ReactionsIndexer;

impl ReactionsIndexer {
    async fn update(
        run: &IndexRun,
        subject_url: &str,
        record_url: &str,
        reaction: Option<&str>,
    ) -> Result<()> {
        let row_key = tally_key(subject_url);
        let _lock = run.locks.lock(&row_lock(run, ReactionTally::TABLE, &row_key)).await;

        let tallies = run.target.table::<ReactionTally>();
        let mut tally = tallies.get(&row_key).await?.unwrap_or_else(|| ReactionTally {
            subject_url: subject_url.to_string(),
            ..Default::default()
        });
        let before = tally.clone();
        for reactors in tally.reactions.values_mut() {
            reactors.remove(record_url);
        }
        if let Some(reaction) = reaction {
            tally
                .reactions
                .entry(reaction.to_string())
                .or_default()
                .insert(record_url.to_string());
        }
        tally.reactions.retain(|_, reactors| !reactors.is_empty());

        if tally == before {
            return Ok(());
        }
        if tally.reactions.is_empty() {
            tallies.del(&row_key).await?;
        } else {
            tallies.put(&row_key, &tally).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Indexer for ReactionsIndexer {
    fn id(&self) -> &'static str {
        REACTIONS_ID
    }

    fn tables(&self) -> &'static [&'static str] {
        &[Reaction::TABLE]
    }

    async fn apply(&self, run: &IndexRun, entry: &Entry) -> Result<()> {
        let record_url = run.source.record_url(Reaction::TABLE, &entry.key);
        let reaction = decode_source::<Reaction>(run, entry);

        if let Some(previous) = previous_ref(run, REACTIONS_ID, &record_url).await? {
            let moved = reaction
                .as_ref()
                .map(|r| r.subject.url != previous.subject_url)
                .unwrap_or(true);
            if moved {
                Self::update(run, &previous.subject_url, &record_url, None).await?;
            }
        }

        match reaction {
            Some(reaction) => {
                Self::update(run, &reaction.subject.url, &record_url, Some(&reaction.reaction)).await?;
                let index_ref = IndexRef {
                    record_url: record_url.clone(),
                    subject_url: reaction.subject.url,
                    detail: Some(reaction.reaction),
                };
                set_ref(run, REACTIONS_ID, Some(index_ref), &record_url).await
            }
            None => set_ref(run, REACTIONS_ID, None, &record_url).await,
        }
    }
}

// =============================================================================
// Comment threads
// =============================================================================

pub struct CommentsIndexer;

impl CommentsIndexer {
    async fn update(run: &IndexRun, root_url: &str, record_url: &str, parent_url: Option<&str>) -> Result<()> {
        let row_key = tally_key(root_url);
        let _lock = run.locks.lock(&row_lock(run, ThreadIndex::TABLE, &row_key)).await;

        let threads = run.target.table::<ThreadIndex>();
        let mut thread = threads.get(&row_key).await?.unwrap_or_else(|| ThreadIndex {
            root_url: root_url.to_string(),
            ..Default::default()
        });
        let before = thread.clone();
        match parent_url {
            Some(parent) => {
                thread.replies.insert(record_url.to_string(), parent.to_string());
            }
            None => {
                thread.replies.remove(record_url);
            }
        }

        if thread == before {
            return Ok(());
        }
        if thread.replies.is_empty() {
            threads.del(&row_key).await?;
        } else {
            threads.put(&row_key, &thread).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Indexer for CommentsIndexer {
    fn id(&self) -> &'static str {
        COMMENTS_ID
    }

    fn tables(&self) -> &'static [&'static str] {
        &[Comment::TABLE]
    }

    async fn apply(&self, run: &IndexRun, entry: &Entry) -> Result<()> {
        let record_url = run.source.record_url(Comment::TABLE, &entry.key);
        let comment = decode_source::<Comment>(run, entry);

        if let Some(previous) = previous_ref(run, COMMENTS_ID, &record_url).await? {
            let moved = comment
                .as_ref()
                .map(|c| c.reply.root.url != previous.subject_url)
                .unwrap_or(true);
            if moved {
                Self::update(run, &previous.subject_url, &record_url, None).await?;
            }
        }

        match comment {
            Some(comment) => {
                let root_url = comment.reply.root.url;
                let parent_url = comment
                    .reply
                    .parent
                    .map(|p| p.url)
                    .unwrap_or_else(|| root_url.clone());
                Self::update(run, &root_url, &record_url, Some(&parent_url)).await?;
                let index_ref = IndexRef {
                    record_url: record_url.clone(),
                    subject_url: root_url,
                    detail: Some(parent_url),
                };
                set_ref(run, COMMENTS_ID, Some(index_ref), &record_url).await
            }
            None => set_ref(run, COMMENTS_ID, None, &record_url).await,
        }
    }
}

// =============================================================================
// Followers
// =============================================================================

pub struct FollowsIndexer;

impl FollowsIndexer {
    async fn update(run: &IndexRun, subject_id: &str, follower_id: &str, following: bool) -> Result<()> {
        let row_key = tally_key(subject_id);
        let _lock = run.locks.lock(&row_lock(run, FollowIndex::TABLE, &row_key)).await;

        let index = run.target.table::<FollowIndex>();
        let mut followers = index.get(&row_key).await?.unwrap_or_else(|| FollowIndex {
            subject_id: subject_id.to_string(),
            ..Default::default()
        });
        let changed = if following {
            followers.followers.insert(follower_id.to_string())
        } else {
            followers.followers.remove(follower_id)
        };

        if !changed {
            return Ok(());
        }
        if followers.followers.is_empty() {
            index.del(&row_key).await?;
        } else {
            index.put(&row_key, &followers).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Indexer for FollowsIndexer {
    fn id(&self) -> &'static str {
        FOLLOWS_ID
    }

    fn tables(&self) -> &'static [&'static str] {
        &[Follow::TABLE]
    }

    async fn apply(&self, run: &IndexRun, entry: &Entry) -> Result<()> {
        let Some(follower_id) = run.source.user_id() else {
            return Ok(());
        };
        let record_url = run.source.record_url(Follow::TABLE, &entry.key);
        let follow = decode_source::<Follow>(run, entry);

        if let Some(previous) = previous_ref(run, FOLLOWS_ID, &record_url).await? {
            let moved = follow
                .as_ref()
                .map(|f| f.subject.user_id != previous.subject_url)
                .unwrap_or(true);
            if moved {
                Self::update(run, &previous.subject_url, follower_id, false).await?;
            }
        }

        match follow {
            Some(follow) => {
                Self::update(run, &follow.subject.user_id, follower_id, true).await?;
                let index_ref = IndexRef {
                    record_url: record_url.clone(),
                    subject_url: follow.subject.user_id,
                    detail: None,
                };
                set_ref(run, FOLLOWS_ID, Some(index_ref), &record_url).await
            }
            None => set_ref(run, FOLLOWS_ID, None, &record_url).await,
        }
    }
}
