//! Node wiring
//!
//! A [`Node`] owns everything one domain runs: the database registry, the
//! indexing engine, the directory, the method protocol and the subscription
//! resolver. Startup creates the server databases, catches every indexing
//! database up and loads the external databases they subscribe to.
//!
//! ```text
//!   Node::start
//!     ├─ registry actor            (DatabaseRegistry::spawn)
//!     ├─ server public + private   (users, accounts, tallies, method-dispatch)
//!     ├─ engine.catch_up_all()
//!     └─ resolver.reconcile_external_databases()
//! ```

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::db::schemas::{
    Account, Member, Membership, Profile, ServerUser, UserKind, UserRef, ADMIN_ROLE, PROFILE_KEY,
};
use crate::db::{Database, DatabaseKind, DatabaseLoader, DatabaseRegistry};
use crate::directory::{Directory, NodeDirectory, ResolvedUser};
use crate::index::{IndexerRegistry, IndexingEngine};
use crate::issues::IssueTracker;
use crate::locks::LockRegistry;
use crate::methods::{MethodProtocol, MethodRegistry, RemoteHandleRequest, RemoteNotifier};
use crate::subscriptions::{ReconcileReport, SubscriptionResolver};
use crate::types::{AgoraError, Result};
use crate::util::{now, validate_username};

/// The databases of a citizen hosted here.
#[derive(Debug, Clone)]
pub struct Citizen {
    pub user_id: String,
    pub public: Arc<Database>,
    pub private: Arc<Database>,
}

impl Citizen {
    pub fn user_ref(&self) -> UserRef {
        UserRef {
            user_id: self.user_id.clone(),
            db_url: self.public.url().to_string(),
        }
    }
}

/// Counters for the health endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStats {
    pub loaded_databases: usize,
    pub external_databases: usize,
    pub watchers: usize,
    pub issues: usize,
}

pub struct Node {
    config: NodeConfig,
    registry: Arc<DatabaseRegistry>,
    locks: LockRegistry,
    issues: Arc<IssueTracker>,
    indexers: IndexerRegistry,
    engine: Arc<IndexingEngine>,
    directory: Arc<NodeDirectory>,
    protocol: MethodProtocol,
    resolver: Arc<SubscriptionResolver>,
    server_public: Arc<Database>,
    server_private: Arc<Database>,
}

impl Node {
    /// Create the server databases and bring every index up to date.
    ///
    /// `remote_directory` answers users of other domains; `notifier` carries
    /// remote-handle requests to their nodes.
    pub async fn start(
        config: NodeConfig,
        loader: Arc<dyn DatabaseLoader>,
        remote_directory: Arc<dyn Directory>,
        notifier: Arc<dyn RemoteNotifier>,
    ) -> Result<Arc<Self>> {
        let registry = Arc::new(DatabaseRegistry::spawn(loader));
        let locks = LockRegistry::new();
        let issues = Arc::new(IssueTracker::new());
        let methods = Arc::new(MethodRegistry::with_defaults());
        let indexers = IndexerRegistry::with_defaults(methods);

        let server_public = registry
            .create(
                DatabaseKind::PublicServer,
                None,
                indexers.capabilities_for(DatabaseKind::PublicServer),
            )
            .await?;
        let server_private = registry
            .create(
                DatabaseKind::PrivateServer,
                None,
                indexers.capabilities_for(DatabaseKind::PrivateServer),
            )
            .await?;

        let engine = Arc::new(IndexingEngine::new(
            Arc::clone(&registry),
            locks.clone(),
            Arc::clone(&issues),
        ));
        let directory = Arc::new(NodeDirectory::new(
            config.domain.clone(),
            Arc::clone(&server_public),
            Arc::clone(&registry),
            remote_directory,
        ));
        let protocol = MethodProtocol::new(
            config.method.clone(),
            Arc::clone(&registry),
            Arc::clone(&engine),
            directory.clone(),
            notifier,
        );
        let resolver = Arc::new(SubscriptionResolver::new(
            Arc::clone(&registry),
            Arc::clone(&engine),
            directory.clone(),
            Arc::clone(&issues),
            config.watch_changes,
        ));

        let node = Arc::new(Self {
            config,
            registry,
            locks,
            issues,
            indexers,
            engine,
            directory,
            protocol,
            resolver,
            server_public,
            server_private,
        });

        node.watch(&node.server_public);
        if let Err(e) = node.engine.catch_up_all().await {
            warn!(error = %e, "Initial catch-up incomplete, see issues");
        }
        node.reconcile().await?;

        info!(
            node_id = %node.config.node_id,
            domain = %node.config.domain,
            server_db = %node.server_public.url(),
            "Node started"
        );
        Ok(node)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn domain(&self) -> &str {
        &self.config.domain
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

    pub fn engine(&self) -> &Arc<IndexingEngine> {
        &self.engine
    }

    pub fn directory(&self) -> &Arc<NodeDirectory> {
        &self.directory
    }

    pub fn protocol(&self) -> &MethodProtocol {
        &self.protocol
    }

    pub fn resolver(&self) -> &Arc<SubscriptionResolver> {
        &self.resolver
    }

    pub fn server_public(&self) -> &Arc<Database> {
        &self.server_public
    }

    pub fn server_private(&self) -> &Arc<Database> {
        &self.server_private
    }

    pub fn user_id_for(&self, username: &str) -> String {
        format!("{username}@{}", self.config.domain)
    }

    pub fn stats(&self) -> NodeStats {
        let all = self.registry.all();
        NodeStats {
            loaded_databases: all.len(),
            external_databases: all.iter().filter(|db| !db.writable()).count(),
            watchers: all.iter().filter(|db| self.engine.is_watching(db.url())).count(),
            issues: self.issues.len(),
        }
    }

    /// A citizen hosted here, by user id.
    pub fn citizen(&self, user_id: &str) -> Result<Citizen> {
        let public = self
            .registry
            .get_by_user(user_id, DatabaseKind::PublicCitizen)
            .filter(|db| db.writable())
            .ok_or_else(|| AgoraError::Session(format!("{user_id} is not a citizen of this node")))?;
        let private = self
            .registry
            .private_db(user_id)
            .ok_or_else(|| AgoraError::NotFound(format!("Private database of {user_id}")))?;
        Ok(Citizen {
            user_id: user_id.to_string(),
            public,
            private,
        })
    }

    /// A community hosted here, by id.
    pub fn community(&self, community_id: &str) -> Result<Arc<Database>> {
        self.registry
            .get_by_user(community_id, DatabaseKind::PublicCommunity)
            .filter(|db| db.writable())
            .ok_or_else(|| AgoraError::NotFound(format!("Community {community_id} is not hosted here")))
    }

    // =========================================================================
    // Users
    // =========================================================================

    /// Register a citizen: public and private databases, profile, server
    /// user and account records.
    pub async fn create_citizen(&self, username: &str, display_name: Option<&str>) -> Result<Citizen> {
        validate_username(username)?;
        let user_id = self.user_id_for(username);
        let _users = self
            .locks
            .lock(&format!("users:{}", self.server_public.url()))
            .await;
        self.ensure_username_free(username).await?;

        let public = self
            .registry
            .create(
                DatabaseKind::PublicCitizen,
                Some(user_id.clone()),
                self.indexers.capabilities_for(DatabaseKind::PublicCitizen),
            )
            .await?;
        let private = self
            .registry
            .create(
                DatabaseKind::PrivateCitizen,
                Some(user_id.clone()),
                self.indexers.capabilities_for(DatabaseKind::PrivateCitizen),
            )
            .await?;

        public
            .table::<Profile>()
            .put(
                PROFILE_KEY,
                &Profile {
                    display_name: display_name.unwrap_or(username).to_string(),
                    description: None,
                },
            )
            .await?;
        self.server_public
            .table::<ServerUser>()
            .put(
                username,
                &ServerUser {
                    user_id: user_id.clone(),
                    db_url: public.url().to_string(),
                    kind: UserKind::Citizen,
                },
            )
            .await?;
        self.server_private
            .table::<Account>()
            .put(
                username,
                &Account {
                    username: username.to_string(),
                    public_db_url: public.url().to_string(),
                    private_db_url: Some(private.url().to_string()),
                    created_at: now(),
                },
            )
            .await?;

        self.watch(&public);
        self.watch(&private);
        self.engine.catch_up(&private, None).await?;
        self.engine.catch_up(&self.server_public, None).await?;

        info!(user_id = %user_id, public_db = %public.url(), "Citizen created");
        Ok(Citizen {
            user_id,
            public,
            private,
        })
    }

    /// Create a community hosted here. The creator becomes its first admin
    /// and records the membership in their own public database.
    pub async fn create_community(
        &self,
        creator_id: &str,
        name: &str,
        display_name: &str,
    ) -> Result<Arc<Database>> {
        validate_username(name)?;
        let creator = self.citizen(creator_id)?;
        let community_id = self.user_id_for(name);
        let _users = self
            .locks
            .lock(&format!("users:{}", self.server_public.url()))
            .await;
        self.ensure_username_free(name).await?;

        let community = self
            .registry
            .create(
                DatabaseKind::PublicCommunity,
                Some(community_id.clone()),
                self.indexers.capabilities_for(DatabaseKind::PublicCommunity),
            )
            .await?;
        community
            .table::<Profile>()
            .put(
                PROFILE_KEY,
                &Profile {
                    display_name: display_name.to_string(),
                    description: None,
                },
            )
            .await?;
        community
            .table::<Member>()
            .put(
                creator_id,
                &Member {
                    user: creator.user_ref(),
                    roles: vec![ADMIN_ROLE.to_string()],
                    joined_at: now(),
                },
            )
            .await?;
        self.server_public
            .table::<ServerUser>()
            .put(
                name,
                &ServerUser {
                    user_id: community_id.clone(),
                    db_url: community.url().to_string(),
                    kind: UserKind::Community,
                },
            )
            .await?;

        let community_ref = UserRef {
            user_id: community_id.clone(),
            db_url: community.url().to_string(),
        };
        creator
            .public
            .table::<Membership>()
            .put(
                &community_id,
                &Membership {
                    community: community_ref,
                    joined_at: now(),
                },
            )
            .await?;

        self.watch(&community);
        self.engine.catch_up(&community, None).await?;
        self.engine.catch_up(&creator.private, None).await?;
        self.engine.catch_up(&self.server_public, None).await?;

        info!(
            community = %community_id,
            creator = %creator_id,
            db = %community.url(),
            "Community created"
        );
        Ok(community)
    }

    async fn ensure_username_free(&self, username: &str) -> Result<()> {
        if self
            .server_public
            .table::<ServerUser>()
            .get(username)
            .await?
            .is_some()
        {
            return Err(AgoraError::Validation(format!(
                "Username {username} is already taken"
            )));
        }
        Ok(())
    }

    /// Well-known answer for a local user.
    pub async fn resolve_local(&self, username: &str) -> Result<ResolvedUser> {
        self.directory
            .local_user(username)
            .await?
            .ok_or_else(|| AgoraError::NotFound(format!("User {}", self.user_id_for(username))))
    }

    // =========================================================================
    // Indexing triggers
    // =========================================================================

    /// Index a local write right away instead of waiting for the watcher.
    pub async fn after_write(&self, db: &Database) {
        self.engine.on_change(db.url(), None).await;
    }

    /// Bring the set of loaded external databases in line with what local
    /// indexers subscribe to.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        self.resolver.reconcile_external_databases().await
    }

    /// Serve a remote-handle request, then pick up the caller as a source if
    /// the call made them a subscriber (e.g. a join).
    pub async fn handle_remote(&self, request: &RemoteHandleRequest, origin: &str) -> Result<()> {
        self.protocol.handle_remote(request, origin).await?;
        if let Err(e) = self.reconcile().await {
            debug!(error = %e, "Reconcile after remote call failed");
        }
        Ok(())
    }

    fn watch(&self, db: &Database) {
        if self.config.watch_changes {
            self.engine.watch(db);
        }
    }

    /// Stop background watchers.
    pub fn shutdown(&self) {
        self.engine.shutdown();
        info!(domain = %self.config.domain, "Node stopped");
    }
}
