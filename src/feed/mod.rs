//! Feed Cursor Merge
//!
//! Produces one newest-first sequence from many logs that are each paginated
//! on their own. Every source gets a cursor reading `batch` entries at a time
//! in reverse key order below a shared `lt` bound; the merge emits whichever
//! buffered head has the greatest key.
//!
//! ```text
//!   source A  [10, 7, 3]  ─┐
//!   source B  [ 9, 5]     ─┼─► 10, 9, 8, 7, 5, 3, 1
//!   source C  [ 8, 1]     ─┘
//! ```
//!
//! A cursor only goes back to its store when its buffer is empty, so a feed
//! page costs at most one extra read per source.

pub mod items;

pub use items::{community_feed, home_feed, list_feed, FeedPost, VoteSummary};

use std::collections::VecDeque;
use std::sync::Arc;

use futures::stream::{self, Stream};
use serde_json::Value;

use crate::db::Database;
use crate::store::{Entry, ListOpts};
use crate::types::{AgoraError, Result};

/// Entries read per store round trip.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// One table of one database.
#[derive(Debug, Clone)]
pub struct FeedSource {
    pub db: Arc<Database>,
    pub table: String,
}

impl FeedSource {
    pub fn new(db: Arc<Database>, table: impl Into<String>) -> Self {
        Self {
            db,
            table: table.into(),
        }
    }
}

/// A merged entry and where it came from.
#[derive(Debug, Clone)]
pub struct FeedEntry {
    pub source: Arc<Database>,
    pub key: String,
    pub url: String,
    pub value: Value,
}

struct Cursor {
    source: FeedSource,
    buffer: VecDeque<Entry>,
    /// Exclusive upper bound of the next read.
    next_lt: Option<String>,
    exhausted: bool,
}

impl Cursor {
    async fn fill(&mut self, batch: usize) -> Result<()> {
        if !self.buffer.is_empty() || self.exhausted {
            return Ok(());
        }
        let mut opts = ListOpts::new().reverse().limit(batch);
        if let Some(lt) = &self.next_lt {
            opts = opts.lt(lt.clone());
        }
        let entries = self.source.db.store().list(&self.source.table, &opts).await?;
        if entries.len() < batch {
            self.exhausted = true;
        }
        if let Some(last) = entries.last() {
            self.next_lt = Some(last.key.clone());
        }
        self.buffer.extend(entries);
        Ok(())
    }
}

pub struct FeedMerge {
    cursors: Vec<Cursor>,
    batch: usize,
}

impl FeedMerge {
    /// Merge `sources`, newest first, starting below `lt` when given.
    pub fn new(sources: Vec<FeedSource>, lt: Option<String>) -> Self {
        let cursors = sources
            .into_iter()
            .map(|source| Cursor {
                source,
                buffer: VecDeque::new(),
                next_lt: lt.clone(),
                exhausted: false,
            })
            .collect();
        Self {
            cursors,
            batch: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch: usize) -> Self {
        self.batch = batch.max(1);
        self
    }

    /// Next entry, `None` once every source is exhausted.
    pub async fn next(&mut self) -> Result<Option<FeedEntry>> {
        loop {
            for cursor in &mut self.cursors {
                cursor.fill(self.batch).await?;
            }

            let Some(index) = self.greatest_head() else {
                return Ok(None);
            };
            let cursor = &mut self.cursors[index];
            let Some(entry) = cursor.buffer.pop_front() else {
                return Ok(None);
            };
            // Tombstones carry nothing to show
            let Some(value) = entry.value else {
                continue;
            };
            return Ok(Some(FeedEntry {
                url: cursor.source.db.record_url(&cursor.source.table, &entry.key),
                source: Arc::clone(&cursor.source.db),
                key: entry.key,
                value,
            }));
        }
    }

    /// Cursor whose buffered head has the greatest key. Ties go to the
    /// earlier source.
    fn greatest_head(&self) -> Option<usize> {
        let mut best: Option<(usize, &str)> = None;
        for (i, cursor) in self.cursors.iter().enumerate() {
            let Some(head) = cursor.buffer.front() else {
                continue;
            };
            if best.map_or(true, |(_, key)| head.key.as_str() > key) {
                best = Some((i, head.key.as_str()));
            }
        }
        best.map(|(i, _)| i)
    }

    /// Up to `limit` entries.
    pub async fn take(&mut self, limit: usize) -> Result<Vec<FeedEntry>> {
        let mut out = Vec::with_capacity(limit.min(64));
        while out.len() < limit {
            match self.next().await? {
                Some(entry) => out.push(entry),
                None => break,
            }
        }
        Ok(out)
    }

    /// Consume the merge lazily as a stream.
    pub fn into_stream(self) -> impl Stream<Item = Result<FeedEntry>> {
        stream::try_unfold(self, |mut merge| async move {
            let next = merge.next().await?;
            Ok::<_, AgoraError>(next.map(|entry| (entry, merge)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Capabilities, DatabaseKind, DatabaseRegistry};
    use crate::store::MemoryNetwork;
    use futures::TryStreamExt;
    use serde_json::json;

    async fn source(registry: &DatabaseRegistry, name: &str, keys: &[u32]) -> FeedSource {
        let db = registry
            .create(
                DatabaseKind::PublicCitizen,
                Some(format!("{name}@a.example")),
                Capabilities::none(),
            )
            .await
            .unwrap();
        for key in keys {
            db.store()
                .put("posts", &format!("{key:03}"), json!({ "n": key }))
                .await
                .unwrap();
        }
        FeedSource::new(db, "posts")
    }

    async fn sources() -> Vec<FeedSource> {
        let registry = DatabaseRegistry::spawn(Arc::new(MemoryNetwork::new()));
        vec![
            source(&registry, "a", &[10, 7, 3]).await,
            source(&registry, "b", &[9, 5]).await,
            source(&registry, "c", &[8, 1]).await,
        ]
    }

    fn keys(entries: &[FeedEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.key.as_str()).collect()
    }

    #[tokio::test]
    async fn test_merge_is_newest_first() {
        let mut merge = FeedMerge::new(sources().await, None);
        let page = merge.take(4).await.unwrap();
        assert_eq!(keys(&page), vec!["010", "009", "008", "007"]);

        let rest = merge.take(10).await.unwrap();
        assert_eq!(keys(&rest), vec!["005", "003", "001"]);
        assert!(merge.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lt_bound_and_small_batches() {
        let mut merge = FeedMerge::new(sources().await, Some("008".into())).with_batch_size(1);
        let page = merge.take(10).await.unwrap();
        assert_eq!(keys(&page), vec!["007", "005", "003", "001"]);
    }

    #[tokio::test]
    async fn test_ties_go_to_earlier_source() {
        let registry = DatabaseRegistry::spawn(Arc::new(MemoryNetwork::new()));
        let first = source(&registry, "a", &[5]).await;
        let second = source(&registry, "b", &[5]).await;
        let first_url = first.db.url().to_string();

        let mut merge = FeedMerge::new(vec![first, second], None);
        let entry = merge.next().await.unwrap().unwrap();
        assert_eq!(entry.source.url(), first_url);
        assert_eq!(entry.url, format!("{first_url}posts/005"));
    }

    #[tokio::test]
    async fn test_stream_and_empty_sources() {
        let merge = FeedMerge::new(sources().await, None).with_batch_size(2);
        let all: Vec<FeedEntry> = merge.into_stream().try_collect().await.unwrap();
        assert_eq!(all.len(), 7);

        let mut empty = FeedMerge::new(Vec::new(), None);
        assert!(empty.next().await.unwrap().is_none());
    }
}
