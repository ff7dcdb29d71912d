//! Notification queue of a citizen, kept in their private database.
//!
//! Sources are everything the citizen subscribes to. An entry becomes a
//! notification when someone else follows the citizen, replies to their
//! content, or votes or reacts on it. The key is derived from the item url,
//! so replay overwrites and a tombstone removes.

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{IndexRun, Indexer};
use crate::db::schemas::{Comment, Follow, Notification, NotificationKind, Reaction, Vote};
use crate::db::table::decode_record;
use crate::db::Record;
use crate::store::Entry;
use crate::types::{AgoraError, Result};

pub const ID: &str = "notifications";

pub struct NotificationsIndexer;

/// What an entry means to the owner, if anything.
fn classify(entry: &Entry, owner_id: &str, owner_db: &str) -> Result<Option<(NotificationKind, Option<String>, String)>> {
    let Some(value) = entry.value.clone() else {
        return Ok(None);
    };
    let found = match entry.table.as_str() {
        Follow::TABLE => {
            let follow: Follow = decode_record(value)?;
            (follow.subject.user_id == owner_id)
                .then_some((NotificationKind::Follow, None, follow.created_at))
        }
        Comment::TABLE => {
            let comment: Comment = decode_record(value)?;
            let replied = comment
                .reply
                .parent
                .as_ref()
                .filter(|p| p.db_url == owner_db)
                .or(Some(&comment.reply.root).filter(|r| r.db_url == owner_db))
                .map(|s| s.url.clone());
            replied.map(|url| (NotificationKind::Comment, Some(url), comment.created_at))
        }
        Vote::TABLE => {
            let vote: Vote = decode_record(value)?;
            (vote.subject.db_url == owner_db)
                .then_some((NotificationKind::Vote, Some(vote.subject.url), vote.created_at))
        }
        Reaction::TABLE => {
            let reaction: Reaction = decode_record(value)?;
            (reaction.subject.db_url == owner_db).then_some((
                NotificationKind::Reaction,
                Some(reaction.subject.url),
                reaction.created_at,
            ))
        }
        _ => None,
    };
    Ok(found)
}

#[async_trait]
impl Indexer for NotificationsIndexer {
    fn id(&self) -> &'static str {
        ID
    }

    fn tables(&self) -> &'static [&'static str] {
        &[Follow::TABLE, Comment::TABLE, Vote::TABLE, Reaction::TABLE]
    }

    async fn apply(&self, run: &IndexRun, entry: &Entry) -> Result<()> {
        let Some(owner_id) = run.target.user_id() else {
            return Ok(());
        };
        let Some(author) = run.source.user_id() else {
            return Ok(());
        };
        if author == owner_id {
            return Ok(());
        }
        let owner_db = run
            .registry
            .public_db(owner_id)
            .ok_or_else(|| AgoraError::NotFound(format!("Public database of {owner_id}")))?;

        let item_url = run.source.record_url(&entry.table, &entry.key);
        let notifications = run.target.table::<Notification>();
        let key = Notification::key_for(&item_url);

        let classified = match classify(entry, owner_id, owner_db.url()) {
            Ok(classified) => classified,
            Err(e) => {
                warn!(source = %run.source.url(), item = %item_url, error = %e, "Ignoring invalid record");
                None
            }
        };

        match classified {
            Some((kind, subject_url, created_at)) => {
                notifications
                    .put(
                        &key,
                        &Notification {
                            item_url: item_url.clone(),
                            author: author.to_string(),
                            kind,
                            subject_url,
                            created_at,
                        },
                    )
                    .await?;
                debug!(owner = %owner_id, author = %author, item = %item_url, "Notification added");
            }
            None => {
                if notifications.get(&key).await?.is_some() {
                    notifications.del(&key).await?;
                    debug!(owner = %owner_id, item = %item_url, "Notification removed");
                }
            }
        }
        Ok(())
    }
}
