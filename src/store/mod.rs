//! Log Store contract
//!
//! Every database is an append-only log addressed by a stable key. Writes to
//! a named table are appended at a new log position (`seq`, starting at 1);
//! deletions append a tombstone. History is never rewritten, so a position is
//! a resumable cursor for incremental indexing.
//!
//! The replicated log itself lives outside this crate. [`MemoryLogStore`] and
//! [`MemoryNetwork`] implement the contract in-process for development mode
//! and tests.

pub mod memory;

pub use memory::{MemoryLogStore, MemoryNetwork};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::types::Result;
use crate::util::db_url_for_key;

/// One log entry: `(table, key) -> value` at position `seq`.
///
/// `value` is `None` for tombstones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub seq: u64,
    pub table: String,
    pub key: String,
    pub value: Option<Value>,
}

impl Entry {
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Decode the value, `None` for tombstones.
    pub fn decode<R: DeserializeOwned>(&self) -> Result<Option<R>> {
        match &self.value {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }
}

/// Range options for [`LogStore::list`]. Bounds compare keys lexicographically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOpts {
    pub lt: Option<String>,
    pub lte: Option<String>,
    pub gt: Option<String>,
    pub gte: Option<String>,
    pub reverse: bool,
    pub limit: Option<usize>,
}

impl ListOpts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lt(mut self, key: impl Into<String>) -> Self {
        self.lt = Some(key.into());
        self
    }

    pub fn gt(mut self, key: impl Into<String>) -> Self {
        self.gt = Some(key.into());
        self
    }

    pub fn gte(mut self, key: impl Into<String>) -> Self {
        self.gte = Some(key.into());
        self
    }

    pub fn lte(mut self, key: impl Into<String>) -> Self {
        self.lte = Some(key.into());
        self
    }

    pub fn reverse(mut self) -> Self {
        self.reverse = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Contract of the replicated log store.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Stable hex key of this database.
    fn key(&self) -> &str;

    /// Key-derived URL, `agora://<key>/`.
    fn url(&self) -> String {
        db_url_for_key(self.key())
    }

    /// True only on the authoritative host.
    fn writable(&self) -> bool;

    /// Current value of a key, `None` if never written or deleted.
    async fn get(&self, table: &str, key: &str) -> Result<Option<Entry>>;

    /// Append a value, returning its position.
    async fn put(&self, table: &str, key: &str, value: Value) -> Result<u64>;

    /// Append a tombstone, returning its position.
    async fn del(&self, table: &str, key: &str) -> Result<u64>;

    /// Live entries of a table ordered by key.
    async fn list(&self, table: &str, opts: &ListOpts) -> Result<Vec<Entry>>;

    /// Every entry appended after `seq`, in ascending position order.
    async fn changes_since(&self, seq: u64) -> Result<Vec<Entry>>;

    /// Position of the last appended entry (0 when empty).
    async fn current_seq(&self) -> Result<u64>;

    /// Resolves once no replication work is known to be outstanding.
    async fn wait_synced(&self) -> Result<()>;

    /// Broadcast of newly appended positions, if the backend supports it.
    fn watch(&self) -> Option<broadcast::Receiver<u64>>;

    /// Release local resources. Further calls fail.
    async fn close(&self) -> Result<()>;
}
