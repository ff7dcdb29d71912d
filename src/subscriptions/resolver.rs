//! External database lifecycle
//!
//! Keeps the set of loaded shadow copies equal to what local indexing
//! databases subscribe to: missing ones are resolved and loaded, unneeded
//! ones are unloaded.
//!
//! Loads talk to the directory and replicate logs, so they run concurrently
//! and outside any named lock. A user already being loaded by another pass
//! is skipped; the registry actor serializes the actual Load/Unload. Only
//! the unload step, which touches local state alone, takes the reconcile
//! lock.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use dashmap::DashSet;
use futures::future::join_all;
use tracing::{debug, info, warn};

use super::compute_subscriptions;
use crate::db::{Database, DatabaseRegistry};
use crate::directory::Directory;
use crate::index::IndexingEngine;
use crate::issues::{Issue, IssueTracker};
use crate::types::{AgoraError, Result};

const RECONCILE_LOCK: &str = "subscriptions:reconcile";

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub loaded: Vec<String>,
    pub unloaded: Vec<String>,
    pub failed: Vec<String>,
}

pub fn load_issue_id(user_id: &str) -> String {
    format!("external-db-load:{user_id}")
}

/// Marks a user id as being loaded until dropped.
struct LoadClaim<'a> {
    loading: &'a DashSet<String>,
    user_id: String,
}

impl<'a> LoadClaim<'a> {
    fn take(loading: &'a DashSet<String>, user_id: &str) -> Option<Self> {
        loading.insert(user_id.to_string()).then(|| Self {
            loading,
            user_id: user_id.to_string(),
        })
    }
}

impl Drop for LoadClaim<'_> {
    fn drop(&mut self) {
        self.loading.remove(&self.user_id);
    }
}

pub struct SubscriptionResolver {
    registry: Arc<DatabaseRegistry>,
    engine: Arc<IndexingEngine>,
    directory: Arc<dyn Directory>,
    issues: Arc<IssueTracker>,
    watch_external: bool,
    loading: DashSet<String>,
}

impl SubscriptionResolver {
    pub fn new(
        registry: Arc<DatabaseRegistry>,
        engine: Arc<IndexingEngine>,
        directory: Arc<dyn Directory>,
        issues: Arc<IssueTracker>,
        watch_external: bool,
    ) -> Self {
        Self {
            registry,
            engine,
            directory,
            issues,
            watch_external,
            loading: DashSet::new(),
        }
    }

    /// User ids whose public databases local indexers need but this node
    /// does not host.
    pub async fn required_external_users(&self) -> Result<BTreeSet<String>> {
        let mut required = BTreeSet::new();
        for db in self.registry.indexing_databases() {
            for sub in compute_subscriptions(&self.registry, &db).await? {
                if !self.registry.is_local(&sub.db_url) {
                    required.insert(sub.user_id);
                }
            }
        }
        Ok(required)
    }

    /// Load missing shadow copies and unload unneeded ones. A failed load is
    /// reported as an issue and does not stop the pass.
    pub async fn reconcile_external_databases(self: &Arc<Self>) -> Result<ReconcileReport> {
        let required = self.required_external_users().await?;
        let mut report = ReconcileReport::default();

        let claims: Vec<LoadClaim<'_>> = required
            .iter()
            .filter(|user_id| !self.is_loaded_external(user_id))
            .filter_map(|user_id| LoadClaim::take(&self.loading, user_id))
            .collect();
        let results = join_all(claims.iter().map(|claim| async move {
            (claim.user_id.as_str(), self.load_external(&claim.user_id).await)
        }))
        .await;
        for (user_id, result) in results {
            match result {
                Ok(_) => report.loaded.push(user_id.to_string()),
                Err(e) => {
                    self.report_load_failure(user_id, &e);
                    report.failed.push(user_id.to_string());
                }
            }
        }
        drop(claims);

        {
            let _guard = self.engine.locks().lock(RECONCILE_LOCK).await;
            // Relationships may have changed while loading
            let required = self.required_external_users().await?;
            for db in self.registry.external_databases() {
                let keep = db
                    .user_id()
                    .map(|u| required.contains(u) || self.loading.contains(u))
                    .unwrap_or(false);
                if keep {
                    continue;
                }
                self.engine.unwatch(db.url());
                match self.registry.unload(db.url()).await {
                    Ok(true) => report.unloaded.push(db.url().to_string()),
                    Ok(false) => {}
                    Err(e) => warn!(db = %db.url(), error = %e, "Failed to unload external database"),
                }
            }
        }

        if !report.loaded.is_empty() || !report.unloaded.is_empty() || !report.failed.is_empty() {
            info!(
                loaded = report.loaded.len(),
                unloaded = report.unloaded.len(),
                failed = report.failed.len(),
                "Reconciled external databases"
            );
        }
        Ok(report)
    }

    fn is_loaded_external(&self, user_id: &str) -> bool {
        self.registry
            .public_db(user_id)
            .map(|db| !db.writable())
            .unwrap_or(false)
    }

    /// Resolve, load, watch and catch every subscriber up on one remote user.
    pub async fn load_external(&self, user_id: &str) -> Result<Arc<Database>> {
        let resolved = self.directory.resolve_user_id(user_id).await?;
        let db = self.registry.load_external(&resolved).await?;
        if db.writable() {
            return Ok(db);
        }
        if self.watch_external {
            self.engine.watch(&db);
        }

        for subscriber in self.engine.subscribers_of(db.url()).await {
            if let Err(e) = self
                .engine
                .catch_up(&subscriber, Some(vec![db.url().to_string()]))
                .await
            {
                // Already reported by the engine
                debug!(db = %subscriber.url(), source = %db.url(), error = %e, "Catch-up failed");
            }
        }
        self.issues.clear(&load_issue_id(user_id));
        Ok(db)
    }

    fn report_load_failure(self: &Arc<Self>, user_id: &str, err: &AgoraError) {
        let resolver: Weak<Self> = Arc::downgrade(self);
        let uid = user_id.to_string();
        let issue = Issue::new(
            load_issue_id(user_id),
            format!("Failed to load the database of {user_id}"),
            "Loading subscribed external database",
            err,
        )
        .with_recover(move || {
            let resolver = resolver.clone();
            let uid = uid.clone();
            async move {
                let resolver = resolver
                    .upgrade()
                    .ok_or_else(|| AgoraError::Internal("subscription resolver stopped".to_string()))?;
                resolver.load_external(&uid).await.map(|_| ())
            }
        });
        self.issues.add(issue);
    }
}
