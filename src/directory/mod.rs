//! Directory lookup
//!
//! Maps user ids (`name@domain`) to public database urls and back. Local
//! users are answered from the server's `users` table ([`NodeDirectory`]);
//! other domains are asked over HTTP ([`WellKnownDirectory`]).

pub mod node;
pub mod well_known;

pub use node::NodeDirectory;
pub use well_known::{WellKnownConfig, WellKnownDirectory};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::db::schemas::{UserKind, UserRef};
use crate::types::Result;

/// A user id resolved to its public database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedUser {
    pub user_id: String,
    pub db_url: String,
    pub kind: UserKind,
}

impl ResolvedUser {
    pub fn user_ref(&self) -> UserRef {
        UserRef {
            user_id: self.user_id.clone(),
            db_url: self.db_url.clone(),
        }
    }
}

#[async_trait]
pub trait Directory: Send + Sync {
    async fn resolve_user_id(&self, user_id: &str) -> Result<ResolvedUser>;

    /// Reverse lookup, db url to user id.
    async fn resolve_db_url(&self, db_url: &str) -> Result<String>;
}
