//! In-process federation
//!
//! Several [`Node`]s sharing one [`MemoryNetwork`] can talk to each other
//! without HTTP: [`MemoryFederation`] answers directory lookups for every
//! registered domain and delivers remote-handle requests by calling the
//! target node directly, with the sender's domain as origin. Used by the
//! integration tests and by `--dev-mode`.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tracing::debug;

use crate::config::NodeConfig;
use crate::directory::{Directory, ResolvedUser};
use crate::methods::{RemoteHandleRequest, RemoteNotifier};
use crate::node::Node;
use crate::store::MemoryNetwork;
use crate::types::{AgoraError, Result};
use crate::util::domain_of;

#[derive(Default)]
pub struct MemoryFederation {
    network: MemoryNetwork,
    nodes: DashMap<String, Weak<Node>>,
    offline: DashSet<String>,
    held: DashSet<String>,
}

impl MemoryFederation {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    /// Start a node for `config.domain` on the shared network.
    pub async fn start_node(self: &Arc<Self>, config: NodeConfig) -> Result<Arc<Node>> {
        if self.nodes.contains_key(&config.domain) {
            return Err(AgoraError::Configuration(format!(
                "Domain {} already has a node",
                config.domain
            )));
        }
        let domain = config.domain.clone();
        let node = Node::start(
            config,
            Arc::new(self.network.clone()),
            self.clone(),
            Arc::new(FederationNotifier {
                federation: Arc::downgrade(self),
                origin: domain.clone(),
            }),
        )
        .await?;
        self.nodes.insert(domain, Arc::downgrade(&node));
        Ok(node)
    }

    /// Take a domain off the network (or bring it back). Its databases can no
    /// longer be opened elsewhere and its node stops answering.
    pub async fn set_online(&self, domain: &str, online: bool) {
        if online {
            self.offline.remove(domain);
        } else {
            self.offline.insert(domain.to_string());
        }
        if let Some(node) = self.nodes.get(domain).and_then(|n| n.upgrade()) {
            for db in node.registry().all() {
                if db.writable() {
                    self.network.set_reachable(db.url(), online);
                }
            }
        }
    }

    /// Drop remote-handle requests addressed to `domain` (or deliver them
    /// again). The node stays reachable for lookups and replication, as if
    /// only its notification endpoint were failing.
    pub fn hold_deliveries(&self, domain: &str, held: bool) {
        if held {
            self.held.insert(domain.to_string());
        } else {
            self.held.remove(domain);
        }
    }

    fn node(&self, domain: &str) -> Result<Arc<Node>> {
        if self.offline.contains(domain) {
            return Err(AgoraError::Network(format!("{domain} is offline")));
        }
        self.nodes
            .get(domain)
            .and_then(|n| n.upgrade())
            .ok_or_else(|| AgoraError::NotFound(format!("No node serves {domain}")))
    }
}

#[async_trait]
impl Directory for MemoryFederation {
    async fn resolve_user_id(&self, user_id: &str) -> Result<ResolvedUser> {
        let node = self.node(domain_of(user_id)?)?;
        node.directory().resolve_user_id(user_id).await
    }

    async fn resolve_db_url(&self, db_url: &str) -> Result<String> {
        let nodes: Vec<Arc<Node>> = self.nodes.iter().filter_map(|n| n.value().upgrade()).collect();
        for node in nodes {
            if let Some(db) = node.registry().get(db_url).filter(|db| db.writable()) {
                if let Some(user_id) = db.user_id() {
                    return Ok(user_id.to_string());
                }
            }
        }
        Err(AgoraError::NotFound(format!("No user owns {db_url}")))
    }
}

/// Delivers remote-handle requests of one node.
struct FederationNotifier {
    federation: Weak<MemoryFederation>,
    origin: String,
}

#[async_trait]
impl RemoteNotifier for FederationNotifier {
    async fn notify(&self, target_domain: &str, request: &RemoteHandleRequest) -> Result<()> {
        let federation = self
            .federation
            .upgrade()
            .ok_or_else(|| AgoraError::Network("federation stopped".to_string()))?;
        if federation.held.contains(target_domain) {
            return Err(AgoraError::Network(format!(
                "deliveries to {target_domain} are held"
            )));
        }
        let node = federation.node(target_domain)?;
        debug!(from = %self.origin, to = %target_domain, call = %request.call_url, "Delivering remote-handle");
        node.handle_remote(request, &self.origin).await
    }
}
