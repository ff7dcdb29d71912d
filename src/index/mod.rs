//! Indexing
//!
//! Indexers derive secondary tables in a local database (the *indexing*
//! database) from the logs it subscribes to (the *sources*). Each indexer
//! keeps its own replay position per source in `index-state`, so replaying an
//! already indexed range is a no-op and a crash resumes where it stopped.
//!
//! ```text
//!   source log ──changes_since(lowest_start)──► engine ──► indexer.apply(entry)
//!                                                 │            under index:<id>:<target>:<source>
//!                                                 └──► index-state[<id>:<source>] = last seq
//! ```

pub mod dispatch;
pub mod engine;
pub mod notifications;
pub mod tallies;

pub use engine::{IndexRun, IndexingEngine};

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::db::{Capabilities, DatabaseKind, SubscriptionKind};
use crate::methods::MethodRegistry;
use crate::store::Entry;
use crate::types::Result;

#[async_trait]
pub trait Indexer: Send + Sync {
    /// Stable id, used in `index-state` keys and lock names.
    fn id(&self) -> &'static str;

    /// Source tables this indexer reads. Other entries only advance its
    /// position.
    fn tables(&self) -> &'static [&'static str];

    fn lock_key(&self, target_url: &str, source_url: &str) -> String {
        format!("index:{}:{}:{}", self.id(), target_url, source_url)
    }

    /// Apply one entry. Must be idempotent: replays after a failure re-apply
    /// entries whose effects may already be visible.
    async fn apply(&self, run: &IndexRun, entry: &Entry) -> Result<()>;
}

/// Indexers by id, plus which kinds of database run which.
pub struct IndexerRegistry {
    indexers: BTreeMap<&'static str, Arc<dyn Indexer>>,
}

impl IndexerRegistry {
    pub fn empty() -> Self {
        Self {
            indexers: BTreeMap::new(),
        }
    }

    pub fn with_defaults(methods: Arc<MethodRegistry>) -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(dispatch::MethodDispatchIndexer::new(methods)));
        registry.register(Arc::new(tallies::VotesIndexer));
        registry.register(Arc::new(tallies::ReactionsIndexer));
        registry.register(Arc::new(tallies::CommentsIndexer));
        registry.register(Arc::new(tallies::FollowsIndexer));
        registry.register(Arc::new(notifications::NotificationsIndexer));
        registry
    }

    pub fn register(&mut self, indexer: Arc<dyn Indexer>) {
        self.indexers.insert(indexer.id(), indexer);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Indexer>> {
        self.indexers.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<&'static str> {
        self.indexers.keys().copied().collect()
    }

    fn pick(&self, ids: &[&str]) -> Vec<Arc<dyn Indexer>> {
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    /// Capabilities granted to a newly created local database.
    pub fn capabilities_for(&self, kind: DatabaseKind) -> Capabilities {
        match kind {
            DatabaseKind::PublicCommunity => Capabilities {
                indexers: self.pick(&[dispatch::ID]),
                subscription: Some(SubscriptionKind::CommunityMembers),
            },
            DatabaseKind::PublicServer => Capabilities {
                indexers: self.pick(&[
                    dispatch::ID,
                    tallies::VOTES_ID,
                    tallies::REACTIONS_ID,
                    tallies::COMMENTS_ID,
                    tallies::FOLLOWS_ID,
                ]),
                subscription: Some(SubscriptionKind::ServerIndex),
            },
            DatabaseKind::PrivateCitizen => Capabilities {
                indexers: self.pick(&[notifications::ID]),
                subscription: Some(SubscriptionKind::CitizenIndex),
            },
            DatabaseKind::PublicCitizen | DatabaseKind::PrivateServer => Capabilities::none(),
        }
    }
}
