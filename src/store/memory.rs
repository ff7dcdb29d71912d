//! In-memory log store
//!
//! `MemoryLogStore` keeps the full log plus a per-table view of live entries.
//! `MemoryNetwork` plays the part of peer replication inside one process:
//! every store created through it can be opened elsewhere as a read-only
//! replica that shares the authoritative log.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use super::{Entry, ListOpts, LogStore};
use crate::db::{DatabaseKind, DatabaseLoader};
use crate::types::{AgoraError, Result};
use crate::util::random_db_key;

const WATCH_CAPACITY: usize = 256;

#[derive(Default)]
struct LogState {
    log: Vec<Entry>,
    tables: HashMap<String, BTreeMap<String, Entry>>,
}

/// In-memory append-only log.
#[derive(Clone)]
pub struct MemoryLogStore {
    key: String,
    writable: bool,
    state: Arc<RwLock<LogState>>,
    changes: broadcast::Sender<u64>,
    closed: Arc<AtomicBool>,
}

impl MemoryLogStore {
    /// New writable store with a random key.
    pub fn new() -> Self {
        Self::with_key(random_db_key())
    }

    /// New writable store with a fixed key.
    pub fn with_key(key: impl Into<String>) -> Self {
        let (changes, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            key: key.into(),
            writable: true,
            state: Arc::new(RwLock::new(LogState::default())),
            changes,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Read-only view sharing this store's log.
    pub fn replica(&self) -> Self {
        Self {
            key: self.key.clone(),
            writable: false,
            state: Arc::clone(&self.state),
            changes: self.changes.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, LogState>> {
        self.check_open()?;
        self.state
            .read()
            .map_err(|_| AgoraError::Internal("log state lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, LogState>> {
        self.check_open()?;
        if !self.writable {
            return Err(AgoraError::Permissions(format!(
                "database {} is a read-only replica",
                self.url()
            )));
        }
        self.state
            .write()
            .map_err(|_| AgoraError::Internal("log state lock poisoned".to_string()))
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(AgoraError::Io(format!("database {} is closed", self.url())))
        } else {
            Ok(())
        }
    }

    fn append(&self, table: &str, key: &str, value: Option<Value>) -> Result<u64> {
        let seq = {
            let mut state = self.write()?;
            let seq = state.log.len() as u64 + 1;
            let entry = Entry {
                seq,
                table: table.to_string(),
                key: key.to_string(),
                value,
            };
            state.log.push(entry.clone());
            let live = state.tables.entry(table.to_string()).or_default();
            if entry.is_tombstone() {
                live.remove(key);
            } else {
                live.insert(key.to_string(), entry);
            }
            seq
        };
        // No receivers is fine
        let _ = self.changes.send(seq);
        Ok(seq)
    }
}

impl Default for MemoryLogStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Translate list options into a BTreeMap range, `None` if the range is empty.
fn range_bounds(opts: &ListOpts) -> Option<(Bound<&str>, Bound<&str>)> {
    let lower = match (&opts.gt, &opts.gte) {
        (Some(gt), _) => Bound::Excluded(gt.as_str()),
        (None, Some(gte)) => Bound::Included(gte.as_str()),
        (None, None) => Bound::Unbounded,
    };
    let upper = match (&opts.lt, &opts.lte) {
        (Some(lt), _) => Bound::Excluded(lt.as_str()),
        (None, Some(lte)) => Bound::Included(lte.as_str()),
        (None, None) => Bound::Unbounded,
    };

    let endpoints = |b: &Bound<&str>| match b {
        Bound::Included(k) | Bound::Excluded(k) => Some(k.to_string()),
        Bound::Unbounded => None,
    };
    if let (Some(lo), Some(hi)) = (endpoints(&lower), endpoints(&upper)) {
        let both_included = matches!(lower, Bound::Included(_)) && matches!(upper, Bound::Included(_));
        if lo > hi || (lo == hi && !both_included) {
            return None;
        }
    }
    Some((lower, upper))
}

#[async_trait]
impl LogStore for MemoryLogStore {
    fn key(&self) -> &str {
        &self.key
    }

    fn writable(&self) -> bool {
        self.writable
    }

    async fn get(&self, table: &str, key: &str) -> Result<Option<Entry>> {
        let state = self.read()?;
        Ok(state.tables.get(table).and_then(|t| t.get(key)).cloned())
    }

    async fn put(&self, table: &str, key: &str, value: Value) -> Result<u64> {
        self.append(table, key, Some(value))
    }

    async fn del(&self, table: &str, key: &str) -> Result<u64> {
        self.append(table, key, None)
    }

    async fn list(&self, table: &str, opts: &ListOpts) -> Result<Vec<Entry>> {
        let state = self.read()?;
        let Some(entries) = state.tables.get(table) else {
            return Ok(Vec::new());
        };
        let Some(bounds) = range_bounds(opts) else {
            return Ok(Vec::new());
        };
        let limit = opts.limit.unwrap_or(usize::MAX);
        let iter = entries.range::<str, _>(bounds).map(|(_, entry)| entry.clone());
        let listed = if opts.reverse {
            iter.rev().take(limit).collect()
        } else {
            iter.take(limit).collect()
        };
        Ok(listed)
    }

    async fn changes_since(&self, seq: u64) -> Result<Vec<Entry>> {
        let state = self.read()?;
        let start = usize::try_from(seq).unwrap_or(usize::MAX);
        Ok(state.log.get(start..).map(<[Entry]>::to_vec).unwrap_or_default())
    }

    async fn current_seq(&self) -> Result<u64> {
        Ok(self.read()?.log.len() as u64)
    }

    async fn wait_synced(&self) -> Result<()> {
        // Replicas share the authoritative log, nothing is ever outstanding
        self.check_open()
    }

    fn watch(&self) -> Option<broadcast::Receiver<u64>> {
        if self.closed.load(Ordering::Acquire) {
            None
        } else {
            Some(self.changes.subscribe())
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

// =============================================================================
// Memory Network
// =============================================================================

/// Process-local stand-in for log replication between nodes.
///
/// Stores are registered by URL when created; any node sharing the network
/// can open them as read-only replicas.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    stores: Arc<DashMap<String, MemoryLogStore>>,
    unreachable: Arc<DashSet<String>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a new writable store.
    pub fn create_store(&self) -> MemoryLogStore {
        let store = MemoryLogStore::new();
        self.stores.insert(store.url(), store.clone());
        debug!(db = %store.url(), "Created in-memory database");
        store
    }

    /// Open a read-only replica of a registered store.
    pub fn replica(&self, db_url: &str) -> Result<MemoryLogStore> {
        if self.unreachable.contains(db_url) {
            return Err(AgoraError::Network(format!("{db_url} is unreachable")));
        }
        self.stores
            .get(db_url)
            .map(|store| store.replica())
            .ok_or_else(|| AgoraError::NotFound(format!("No peers hosting {db_url}")))
    }

    /// Simulate a host going offline (or coming back).
    pub fn set_reachable(&self, db_url: &str, reachable: bool) {
        if reachable {
            self.unreachable.remove(db_url);
        } else {
            self.unreachable.insert(db_url.to_string());
        }
    }

    pub fn contains(&self, db_url: &str) -> bool {
        self.stores.contains_key(db_url)
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}

#[async_trait]
impl DatabaseLoader for MemoryNetwork {
    async fn create(&self, kind: DatabaseKind) -> Result<Arc<dyn LogStore>> {
        let store = self.create_store();
        debug!(db = %store.url(), kind = %kind, "Opened new local database");
        Ok(Arc::new(store))
    }

    async fn open_remote(&self, db_url: &str) -> Result<Arc<dyn LogStore>> {
        Ok(Arc::new(self.replica(db_url)?))
    }
}
