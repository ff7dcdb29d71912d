//! Database Registry
//!
//! Holds every database this node has open: its own (writable) databases and
//! shadow copies of remote ones.
//!
//! ```text
//!   lookups ──────────────► DashMap (lock-free reads)
//!                               ▲
//!   create / load / unload ─► mpsc ─► registry actor ─┘
//! ```
//!
//! Lifecycle changes go through one actor task so two concurrent loads of the
//! same user cannot both open a store, and an unload never races a load.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::schemas::UserKind;
use super::{Capabilities, Database, DatabaseKind, DatabaseLoader};
use crate::directory::ResolvedUser;
use crate::types::{AgoraError, Result};

const COMMAND_BUFFER: usize = 64;

enum RegistryCommand {
    Create {
        kind: DatabaseKind,
        user_id: Option<String>,
        capabilities: Capabilities,
        reply: oneshot::Sender<Result<Arc<Database>>>,
    },
    LoadExternal {
        user: ResolvedUser,
        reply: oneshot::Sender<Result<Arc<Database>>>,
    },
    Unload {
        db_url: String,
        reply: oneshot::Sender<Result<bool>>,
    },
}

#[derive(Default)]
struct RegistryMaps {
    by_url: DashMap<String, Arc<Database>>,
    by_user: DashMap<(String, DatabaseKind), String>,
}

impl RegistryMaps {
    fn insert(&self, db: Arc<Database>) {
        if let Some(user_id) = db.user_id() {
            self.by_user
                .insert((user_id.to_string(), db.kind()), db.url().to_string());
        }
        self.by_url.insert(db.url().to_string(), db);
    }
}

pub struct DatabaseRegistry {
    maps: Arc<RegistryMaps>,
    commands: mpsc::Sender<RegistryCommand>,
}

impl DatabaseRegistry {
    /// Start the registry actor. Must be called inside a Tokio runtime.
    pub fn spawn(loader: Arc<dyn DatabaseLoader>) -> Self {
        let maps = Arc::new(RegistryMaps::default());
        let (commands, rx) = mpsc::channel(COMMAND_BUFFER);
        tokio::spawn(run_actor(Arc::clone(&maps), loader, rx));
        Self { maps, commands }
    }

    async fn send<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> RegistryCommand,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| AgoraError::Internal("database registry stopped".to_string()))?;
        rx.await
            .map_err(|_| AgoraError::Internal("database registry dropped request".to_string()))?
    }

    /// Create a new local database.
    pub async fn create(
        &self,
        kind: DatabaseKind,
        user_id: Option<String>,
        capabilities: Capabilities,
    ) -> Result<Arc<Database>> {
        self.send(|reply| RegistryCommand::Create {
            kind,
            user_id,
            capabilities,
            reply,
        })
        .await
    }

    /// Open a shadow copy of a remote user's public database. Returns the
    /// already loaded database if there is one.
    pub async fn load_external(&self, user: &ResolvedUser) -> Result<Arc<Database>> {
        if let Some(db) = self.get(&user.db_url) {
            return Ok(db);
        }
        self.send(|reply| RegistryCommand::LoadExternal {
            user: user.clone(),
            reply,
        })
        .await
    }

    /// Close and forget a shadow copy. Local databases cannot be unloaded.
    pub async fn unload(&self, db_url: &str) -> Result<bool> {
        self.send(|reply| RegistryCommand::Unload {
            db_url: db_url.to_string(),
            reply,
        })
        .await
    }

    pub fn get(&self, db_url: &str) -> Option<Arc<Database>> {
        self.maps.by_url.get(db_url).map(|db| Arc::clone(db.value()))
    }

    pub fn get_by_user(&self, user_id: &str, kind: DatabaseKind) -> Option<Arc<Database>> {
        let url = self
            .maps
            .by_user
            .get(&(user_id.to_string(), kind))
            .map(|u| u.clone())?;
        self.get(&url)
    }

    /// Public database of a citizen or community.
    pub fn public_db(&self, user_id: &str) -> Option<Arc<Database>> {
        self.get_by_user(user_id, DatabaseKind::PublicCitizen)
            .or_else(|| self.get_by_user(user_id, DatabaseKind::PublicCommunity))
    }

    pub fn private_db(&self, user_id: &str) -> Option<Arc<Database>> {
        self.get_by_user(user_id, DatabaseKind::PrivateCitizen)
    }

    /// Loaded and writable here.
    pub fn is_local(&self, db_url: &str) -> bool {
        self.get(db_url).map(|db| db.writable()).unwrap_or(false)
    }

    pub fn is_loaded(&self, db_url: &str) -> bool {
        self.maps.by_url.contains_key(db_url)
    }

    /// Local databases that run indexers.
    pub fn indexing_databases(&self) -> Vec<Arc<Database>> {
        self.filtered(|db| db.is_indexing())
    }

    /// Shadow copies of remote databases.
    pub fn external_databases(&self) -> Vec<Arc<Database>> {
        self.filtered(|db| !db.writable())
    }

    pub fn all(&self) -> Vec<Arc<Database>> {
        self.filtered(|_| true)
    }

    pub fn len(&self) -> usize {
        self.maps.by_url.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.by_url.is_empty()
    }

    fn filtered(&self, keep: impl Fn(&Database) -> bool) -> Vec<Arc<Database>> {
        let mut dbs: Vec<Arc<Database>> = self
            .maps
            .by_url
            .iter()
            .filter(|db| keep(db.value()))
            .map(|db| Arc::clone(db.value()))
            .collect();
        dbs.sort_by(|a, b| a.url().cmp(b.url()));
        dbs
    }
}

// =============================================================================
// Actor
// =============================================================================

async fn run_actor(
    maps: Arc<RegistryMaps>,
    loader: Arc<dyn DatabaseLoader>,
    mut commands: mpsc::Receiver<RegistryCommand>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            RegistryCommand::Create {
                kind,
                user_id,
                capabilities,
                reply,
            } => {
                let result = create(&maps, loader.as_ref(), kind, user_id, capabilities).await;
                let _ = reply.send(result);
            }
            RegistryCommand::LoadExternal { user, reply } => {
                let result = load_external(&maps, loader.as_ref(), user).await;
                let _ = reply.send(result);
            }
            RegistryCommand::Unload { db_url, reply } => {
                let result = unload(&maps, &db_url).await;
                let _ = reply.send(result);
            }
        }
    }
    debug!("Database registry actor stopped");
}

async fn create(
    maps: &RegistryMaps,
    loader: &dyn DatabaseLoader,
    kind: DatabaseKind,
    user_id: Option<String>,
    capabilities: Capabilities,
) -> Result<Arc<Database>> {
    if let Some(user_id) = &user_id {
        if maps.by_user.contains_key(&(user_id.clone(), kind)) {
            return Err(AgoraError::Validation(format!(
                "{user_id} already has a {kind} database"
            )));
        }
    }
    let store = loader.create(kind).await?;
    let db = Arc::new(Database::new(kind, user_id, store, capabilities));
    maps.insert(Arc::clone(&db));
    info!(
        db = %db.url(),
        kind = %kind,
        user_id = db.user_id().unwrap_or("-"),
        "Created local database"
    );
    Ok(db)
}

async fn load_external(
    maps: &RegistryMaps,
    loader: &dyn DatabaseLoader,
    user: ResolvedUser,
) -> Result<Arc<Database>> {
    // A queued duplicate request finds the first load's result here
    if let Some(db) = maps.by_url.get(&user.db_url) {
        return Ok(Arc::clone(db.value()));
    }

    let store = loader.open_remote(&user.db_url).await?;
    if store.url() != user.db_url {
        return Err(AgoraError::Internal(format!(
            "Loader returned {} for {}",
            store.url(),
            user.db_url
        )));
    }
    let kind = match user.kind {
        UserKind::Citizen => DatabaseKind::PublicCitizen,
        UserKind::Community => DatabaseKind::PublicCommunity,
    };
    let db = Arc::new(Database::new(
        kind,
        Some(user.user_id.clone()),
        store,
        Capabilities::none(),
    ));
    maps.insert(Arc::clone(&db));
    info!(db = %db.url(), user_id = %user.user_id, "Loaded external database");
    Ok(db)
}

async fn unload(maps: &RegistryMaps, db_url: &str) -> Result<bool> {
    let Some(db) = maps.by_url.get(db_url).map(|db| Arc::clone(db.value())) else {
        return Ok(false);
    };
    if db.writable() {
        return Err(AgoraError::Permissions(format!(
            "{db_url} is hosted here and cannot be unloaded"
        )));
    }

    maps.by_url.remove(db_url);
    if let Some(user_id) = db.user_id() {
        maps.by_user
            .remove_if(&(user_id.to_string(), db.kind()), |_, url| url == db_url);
    }
    if let Err(e) = db.store().close().await {
        warn!(db = %db_url, error = %e, "Failed to close external database");
    }
    info!(db = %db_url, "Unloaded external database");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LogStore, MemoryNetwork};

    fn resolved(user_id: &str, db_url: &str) -> ResolvedUser {
        ResolvedUser {
            user_id: user_id.to_string(),
            db_url: db_url.to_string(),
            kind: UserKind::Citizen,
        }
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let registry = DatabaseRegistry::spawn(Arc::new(MemoryNetwork::new()));
        let db = registry
            .create(
                DatabaseKind::PublicCitizen,
                Some("alice@a.example".into()),
                Capabilities::none(),
            )
            .await
            .unwrap();

        assert!(registry.is_local(db.url()));
        assert_eq!(
            registry.public_db("alice@a.example").unwrap().url(),
            db.url()
        );
        assert!(registry.private_db("alice@a.example").is_none());

        let duplicate = registry
            .create(
                DatabaseKind::PublicCitizen,
                Some("alice@a.example".into()),
                Capabilities::none(),
            )
            .await;
        assert!(duplicate.is_err());
    }

    #[tokio::test]
    async fn test_load_and_unload_external() {
        let network = MemoryNetwork::new();
        let remote = network.create_store();

        let registry = DatabaseRegistry::spawn(Arc::new(network));
        let user = resolved("bob@b.example", &remote.url());
        let db = registry.load_external(&user).await.unwrap();
        assert!(!db.writable());
        assert_eq!(registry.external_databases().len(), 1);

        // Second load is a no-op
        let again = registry.load_external(&user).await.unwrap();
        assert!(Arc::ptr_eq(&db, &again));

        assert!(registry.unload(&remote.url()).await.unwrap());
        assert!(!registry.is_loaded(&remote.url()));
        assert!(registry.public_db("bob@b.example").is_none());
        assert!(!registry.unload(&remote.url()).await.unwrap());
    }

    #[tokio::test]
    async fn test_local_databases_cannot_be_unloaded() {
        let registry = DatabaseRegistry::spawn(Arc::new(MemoryNetwork::new()));
        let db = registry
            .create(DatabaseKind::PublicServer, None, Capabilities::none())
            .await
            .unwrap();
        assert!(matches!(
            registry.unload(db.url()).await,
            Err(AgoraError::Permissions(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_loads_open_one_store() {
        let network = MemoryNetwork::new();
        let remote = network.create_store();
        let registry = Arc::new(DatabaseRegistry::spawn(Arc::new(network)));
        let user = resolved("bob@b.example", &remote.url());

        let loads = (0..8).map(|_| {
            let registry = Arc::clone(&registry);
            let user = user.clone();
            tokio::spawn(async move { registry.load_external(&user).await.unwrap() })
        });
        let dbs = futures::future::join_all(loads).await;
        let first = dbs[0].as_ref().unwrap();
        for db in &dbs {
            assert!(Arc::ptr_eq(first, db.as_ref().unwrap()));
        }
        assert_eq!(registry.len(), 1);
    }
}
