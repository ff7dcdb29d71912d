//! Shared fixtures for integration tests: nodes on one in-memory federation.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use agora::config::NodeConfig;
use agora::methods::MethodConfig;
use agora::node::Citizen;
use agora::sim::MemoryFederation;
use agora::Node;

pub const A: &str = "a.example";
pub const B: &str = "b.example";

/// Fast polling so paused-clock tests advance in small steps.
pub fn config(domain: &str) -> NodeConfig {
    NodeConfig {
        method: MethodConfig {
            poll_interval: Duration::from_millis(50),
            timeout_min: Duration::from_secs(1),
            timeout_max: Duration::from_secs(10),
        },
        ..NodeConfig::for_domain(domain)
    }
}

pub async fn single_node() -> (Arc<MemoryFederation>, Arc<Node>) {
    let federation = MemoryFederation::new();
    let node = federation.start_node(config(A)).await.unwrap();
    (federation, node)
}

pub async fn two_nodes() -> (Arc<MemoryFederation>, Arc<Node>, Arc<Node>) {
    let federation = MemoryFederation::new();
    let a = federation.start_node(config(A)).await.unwrap();
    let b = federation.start_node(config(B)).await.unwrap();
    (federation, a, b)
}

pub async fn citizen(node: &Node, username: &str) -> Citizen {
    node.create_citizen(username, None).await.unwrap()
}
