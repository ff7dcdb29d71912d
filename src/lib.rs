//! Agora - federated social index node
//!
//! Every user owns replicated append-only databases. A node hosts the
//! databases of its own users, loads read-only copies of the remote ones
//! its indexers subscribe to, and keeps derived state (tallies, threads,
//! notifications, method results) up to date incrementally.
//!
//! ## Services
//!
//! - **Store**: log store contract and in-memory network
//! - **Databases**: kinds, capabilities and the registry actor
//! - **Indexing**: per-(target, source) positions and incremental indexers
//! - **Subscriptions**: loads and unloads external databases
//! - **Methods**: privileged mutations across databases and nodes
//! - **Feed**: newest-first merge over many logs
//! - **Federation**: well-known directory and remote-handle over HTTP

pub mod config;
pub mod db;
pub mod directory;
pub mod feed;
pub mod index;
pub mod issues;
pub mod locks;
pub mod methods;
pub mod node;
pub mod routes;
pub mod server;
pub mod sim;
pub mod social;
pub mod store;
pub mod subscriptions;
pub mod types;
pub mod util;

pub use config::{Args, NodeConfig};
pub use node::Node;
pub use server::{run, AppState};
pub use types::{AgoraError, Result};
