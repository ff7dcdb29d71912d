//! Databases
//!
//! A [`Database`] composes a log store with the capabilities its kind grants:
//! the indexers it runs and how its subscription set is derived. Databases
//! are owned by the [`DatabaseRegistry`], which serializes loading and
//! unloading through a single actor task.

pub mod registry;
pub mod schemas;
pub mod table;

pub use registry::DatabaseRegistry;
pub use table::{Record, Table};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::index::Indexer;
use crate::store::LogStore;
use crate::types::Result;

/// The five database kinds a node deals with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DatabaseKind {
    PublicCitizen,
    PrivateCitizen,
    PublicCommunity,
    PublicServer,
    PrivateServer,
}

impl DatabaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PublicCitizen => "public-citizen",
            Self::PrivateCitizen => "private-citizen",
            Self::PublicCommunity => "public-community",
            Self::PublicServer => "public-server",
            Self::PrivateServer => "private-server",
        }
    }

    pub fn is_public(&self) -> bool {
        matches!(
            self,
            Self::PublicCitizen | Self::PublicCommunity | Self::PublicServer
        )
    }
}

impl fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a database derives the set of sources it indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    /// Owner's follows, memberships and own public database.
    CitizenIndex,
    /// Every user registered on the server.
    ServerIndex,
    /// Every member of the community.
    CommunityMembers,
}

/// Capabilities attached to a database at creation.
#[derive(Clone, Default)]
pub struct Capabilities {
    pub indexers: Vec<Arc<dyn Indexer>>,
    pub subscription: Option<SubscriptionKind>,
}

impl Capabilities {
    pub fn none() -> Self {
        Self::default()
    }
}

/// A log store plus what this node does with it.
pub struct Database {
    kind: DatabaseKind,
    user_id: Option<String>,
    url: String,
    store: Arc<dyn LogStore>,
    capabilities: Capabilities,
}

impl Database {
    pub fn new(
        kind: DatabaseKind,
        user_id: Option<String>,
        store: Arc<dyn LogStore>,
        capabilities: Capabilities,
    ) -> Self {
        Self {
            kind,
            user_id,
            url: store.url(),
            store,
            capabilities,
        }
    }

    pub fn kind(&self) -> DatabaseKind {
        self.kind
    }

    /// Owning user or community id, `None` for server databases.
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn key(&self) -> &str {
        self.store.key()
    }

    pub fn store(&self) -> &Arc<dyn LogStore> {
        &self.store
    }

    pub fn writable(&self) -> bool {
        self.store.writable()
    }

    pub fn indexers(&self) -> &[Arc<dyn Indexer>] {
        &self.capabilities.indexers
    }

    pub fn subscription(&self) -> Option<SubscriptionKind> {
        self.capabilities.subscription
    }

    /// Hosted here and running at least one indexer.
    pub fn is_indexing(&self) -> bool {
        self.writable() && !self.capabilities.indexers.is_empty()
    }

    pub fn table<R: Record>(&self) -> Table<'_, R> {
        Table::new(self)
    }

    pub fn record_url(&self, table: &str, key: &str) -> String {
        format!("{}{}/{}", self.url, table, key)
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("kind", &self.kind)
            .field("user_id", &self.user_id)
            .field("url", &self.url)
            .field("writable", &self.writable())
            .field(
                "indexers",
                &self
                    .capabilities
                    .indexers
                    .iter()
                    .map(|i| i.id())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Opens log stores: fresh local ones and shadow copies of remote ones.
#[async_trait]
pub trait DatabaseLoader: Send + Sync {
    async fn create(&self, kind: DatabaseKind) -> Result<Arc<dyn LogStore>>;

    async fn open_remote(&self, db_url: &str) -> Result<Arc<dyn LogStore>>;
}
