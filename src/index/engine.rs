//! Indexing Engine
//!
//! Drives every indexer of every local indexing database over the sources it
//! subscribes to. Work is triggered three ways:
//!
//! - `on_change` after a source grows (watchers, local writes, remote-handle)
//! - `catch_up` at startup and after subscriptions change
//! - issue recovery, which re-runs `catch_up` for one failed pair
//!
//! Concurrent triggers for the same (indexer, target, source) serialize on the
//! indexer's named lock; the position is re-read under the lock so a second
//! run only sees what the first left over.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::Indexer;
use crate::db::schemas::{DbRef, IndexState};
use crate::db::{Database, DatabaseRegistry};
use crate::issues::{Issue, IssueTracker};
use crate::locks::LockRegistry;
use crate::store::Entry;
use crate::subscriptions::compute_subscribed_urls;
use crate::types::{AgoraError, Result};
use crate::util::now;

/// Everything an indexer sees while applying entries from one source.
pub struct IndexRun {
    /// The local database being written.
    pub target: Arc<Database>,
    /// The log being read.
    pub source: Arc<Database>,
    pub registry: Arc<DatabaseRegistry>,
    pub locks: LockRegistry,
    /// Where the shared change list starts.
    pub lowest_start: u64,
}

pub fn failure_issue_id(indexer_id: &str, target_url: &str, source_url: &str) -> String {
    format!("index-failed:{indexer_id}:{target_url}:{source_url}")
}

/// Apply `changes` through one indexer under its lock. Returns the number of
/// entries applied.
///
/// Entries at or below the indexer's recorded position are skipped. On error
/// the position of the last entry that succeeded is still persisted.
pub async fn run_indexer(indexer: &dyn Indexer, run: &IndexRun, changes: &[Entry]) -> Result<usize> {
    let _guard = run
        .locks
        .lock(&indexer.lock_key(run.target.url(), run.source.url()))
        .await;

    let states = run.target.table::<IndexState>();
    let state_key = IndexState::key_for(indexer.id(), run.source.url());
    let last = states
        .get(&state_key)
        .await?
        .map(|s| s.last_indexed_seq)
        .unwrap_or(0);

    let mut position = last;
    let mut applied = 0;
    let mut outcome = Ok(());
    for entry in changes.iter().filter(|e| e.seq > last) {
        if indexer.tables().contains(&entry.table.as_str()) {
            if let Err(e) = indexer.apply(run, entry).await {
                outcome = Err(e);
                break;
            }
            applied += 1;
        }
        position = entry.seq;
    }

    if position > last {
        states
            .put(
                &state_key,
                &IndexState {
                    indexer: indexer.id().to_string(),
                    subject: DbRef {
                        db_url: run.source.url().to_string(),
                    },
                    last_indexed_seq: position,
                    updated_at: now(),
                },
            )
            .await?;
    }

    outcome.map(|_| applied)
}

pub struct IndexingEngine {
    registry: Arc<DatabaseRegistry>,
    locks: LockRegistry,
    issues: Arc<IssueTracker>,
    watchers: DashMap<String, JoinHandle<()>>,
}

impl IndexingEngine {
    pub fn new(registry: Arc<DatabaseRegistry>, locks: LockRegistry, issues: Arc<IssueTracker>) -> Self {
        Self {
            registry,
            locks,
            issues,
            watchers: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<DatabaseRegistry> {
        &self.registry
    }

    pub fn locks(&self) -> &LockRegistry {
        &self.locks
    }

    pub fn issues(&self) -> &Arc<IssueTracker> {
        &self.issues
    }

    /// Indexing databases whose subscription set contains `source_url`.
    pub async fn subscribers_of(&self, source_url: &str) -> Vec<Arc<Database>> {
        let mut subscribers = Vec::new();
        for db in self.registry.indexing_databases() {
            match compute_subscribed_urls(&self.registry, &db).await {
                Ok(urls) if urls.iter().any(|u| u == source_url) => subscribers.push(db),
                Ok(_) => {}
                Err(e) => warn!(db = %db.url(), error = %e, "Failed to compute subscriptions"),
            }
        }
        subscribers
    }

    /// Index new entries of `source_url` into its subscribers, or into exactly
    /// the `only` databases when given. Failures become issues.
    pub async fn on_change(self: &Arc<Self>, source_url: &str, only: Option<&[String]>) {
        let Some(source) = self.registry.get(source_url) else {
            debug!(source = %source_url, "Change on a database that is not loaded");
            return;
        };

        let targets: Vec<Arc<Database>> = match only {
            Some(urls) => urls
                .iter()
                .filter_map(|url| self.registry.get(url))
                .filter(|db| db.is_indexing())
                .collect(),
            None => self.subscribers_of(source_url).await,
        };

        join_all(targets.iter().map(|target| self.index_source(target, &source))).await;
    }

    /// Replay everything each subscribed source (or each of `sources`) has
    /// appended since the target last saw it.
    pub async fn catch_up(self: &Arc<Self>, target: &Arc<Database>, sources: Option<Vec<String>>) -> Result<()> {
        if !target.is_indexing() {
            return Ok(());
        }
        let explicit = sources.is_some();
        let urls = match sources {
            Some(urls) => urls,
            None => compute_subscribed_urls(&self.registry, target).await?,
        };

        let mut first_error = None;
        for url in urls {
            let Some(source) = self.registry.get(&url) else {
                if explicit {
                    first_error.get_or_insert(AgoraError::NotFound(format!("Database {url} is not loaded")));
                } else {
                    debug!(db = %target.url(), source = %url, "Subscribed database not loaded yet");
                }
                continue;
            };
            if let Err(e) = source.store().wait_synced().await {
                first_error.get_or_insert(e);
                continue;
            }
            if let Err(e) = self.index_source(target, &source).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// `catch_up` for every indexing database.
    pub async fn catch_up_all(self: &Arc<Self>) -> Result<()> {
        let mut first_error = None;
        for db in self.registry.indexing_databases() {
            if let Err(e) = self.catch_up(&db, None).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Minimum recorded position over the target's indexers (0 if any has
    /// never run).
    pub async fn lowest_start(&self, target: &Database, source_url: &str) -> Result<u64> {
        let states = target.table::<IndexState>();
        let mut lowest: Option<u64> = None;
        for indexer in target.indexers() {
            let seq = states
                .get(&IndexState::key_for(indexer.id(), source_url))
                .await?
                .map(|s| s.last_indexed_seq)
                .unwrap_or(0);
            lowest = Some(lowest.map_or(seq, |l| l.min(seq)));
        }
        Ok(lowest.unwrap_or(0))
    }

    pub async fn index_state(
        &self,
        target: &Database,
        indexer_id: &str,
        source_url: &str,
    ) -> Result<Option<IndexState>> {
        target
            .table::<IndexState>()
            .get(&IndexState::key_for(indexer_id, source_url))
            .await
    }

    async fn index_source(self: &Arc<Self>, target: &Arc<Database>, source: &Arc<Database>) -> Result<()> {
        let lowest_start = match self.lowest_start(target, source.url()).await {
            Ok(seq) => seq,
            Err(e) => {
                self.report_failure("all", target.url(), source.url(), &e);
                return Err(e);
            }
        };
        let changes = match source.store().changes_since(lowest_start).await {
            Ok(changes) => changes,
            Err(e) => {
                self.report_failure("all", target.url(), source.url(), &e);
                return Err(e);
            }
        };
        if changes.is_empty() {
            return Ok(());
        }

        let run = IndexRun {
            target: Arc::clone(target),
            source: Arc::clone(source),
            registry: Arc::clone(&self.registry),
            locks: self.locks.clone(),
            lowest_start,
        };

        let mut first_error = None;
        for indexer in target.indexers() {
            match run_indexer(indexer.as_ref(), &run, &changes).await {
                Ok(applied) => {
                    if applied > 0 {
                        debug!(
                            indexer = indexer.id(),
                            db = %target.url(),
                            source = %source.url(),
                            applied,
                            "Indexed entries"
                        );
                    }
                    self.issues
                        .clear(&failure_issue_id(indexer.id(), target.url(), source.url()));
                }
                Err(e) => {
                    self.report_failure(indexer.id(), target.url(), source.url(), &e);
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn report_failure(self: &Arc<Self>, indexer_id: &str, target_url: &str, source_url: &str, err: &AgoraError) {
        error!(
            indexer = indexer_id,
            db = %target_url,
            source = %source_url,
            error = %err,
            "Indexer failed"
        );

        let engine: Weak<Self> = Arc::downgrade(self);
        let target = target_url.to_string();
        let source = source_url.to_string();
        let issue = Issue::new(
            failure_issue_id(indexer_id, target_url, source_url),
            format!("Indexer {indexer_id} stopped while reading {source_url}"),
            format!("Indexing {source_url} into {target_url}"),
            err,
        )
        .with_recover(move || {
            let engine = engine.clone();
            let target = target.clone();
            let source = source.clone();
            async move {
                let engine = engine
                    .upgrade()
                    .ok_or_else(|| AgoraError::Internal("indexing engine stopped".to_string()))?;
                let target = engine
                    .registry
                    .get(&target)
                    .ok_or_else(|| AgoraError::NotFound(format!("Database {target}")))?;
                engine.catch_up(&target, Some(vec![source])).await
            }
        });
        self.issues.add(issue);
    }

    // =========================================================================
    // Watchers
    // =========================================================================

    /// Run `on_change` whenever `db` grows. Replaces an existing watcher.
    pub fn watch(self: &Arc<Self>, db: &Database) {
        let Some(mut changes) = db.store().watch() else {
            debug!(db = %db.url(), "Store does not support change notifications");
            return;
        };
        let engine = Arc::downgrade(self);
        let url = db.url().to_string();
        let task_url = url.clone();

        let handle = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
                // One pass covers every position that arrived meanwhile
                loop {
                    match changes.try_recv() {
                        Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                        Err(_) => break,
                    }
                }
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.on_change(&task_url, None).await;
            }
            debug!(db = %task_url, "Watcher stopped");
        });

        if let Some(previous) = self.watchers.insert(url.clone(), handle) {
            previous.abort();
        }
        debug!(db = %url, "Watching database");
    }

    pub fn unwatch(&self, db_url: &str) {
        if let Some((_, handle)) = self.watchers.remove(db_url) {
            handle.abort();
        }
    }

    pub fn is_watching(&self, db_url: &str) -> bool {
        self.watchers.contains_key(db_url)
    }

    pub fn shutdown(&self) {
        let count = self.watchers.len();
        self.watchers.iter().for_each(|w| w.value().abort());
        self.watchers.clear();
        info!(watchers = count, "Indexing engine stopped");
    }
}
