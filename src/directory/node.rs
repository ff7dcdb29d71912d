//! Directory answering local users from the server `users` table.

use std::sync::Arc;

use async_trait::async_trait;

use super::{Directory, ResolvedUser};
use crate::db::schemas::ServerUser;
use crate::db::{Database, DatabaseRegistry};
use crate::types::{AgoraError, Result};
use crate::util::split_user_id;

pub struct NodeDirectory {
    domain: String,
    server: Arc<Database>,
    registry: Arc<DatabaseRegistry>,
    remote: Arc<dyn Directory>,
}

impl NodeDirectory {
    pub fn new(
        domain: impl Into<String>,
        server: Arc<Database>,
        registry: Arc<DatabaseRegistry>,
        remote: Arc<dyn Directory>,
    ) -> Self {
        Self {
            domain: domain.into(),
            server,
            registry,
            remote,
        }
    }

    /// A local user by bare username.
    pub async fn local_user(&self, username: &str) -> Result<Option<ResolvedUser>> {
        Ok(self
            .server
            .table::<ServerUser>()
            .get(username)
            .await?
            .map(|u| ResolvedUser {
                user_id: u.user_id,
                db_url: u.db_url,
                kind: u.kind,
            }))
    }
}

#[async_trait]
impl Directory for NodeDirectory {
    async fn resolve_user_id(&self, user_id: &str) -> Result<ResolvedUser> {
        let (name, domain) = split_user_id(user_id)?;
        if domain.eq_ignore_ascii_case(&self.domain) {
            return self
                .local_user(name)
                .await?
                .ok_or_else(|| AgoraError::NotFound(format!("User {user_id}")));
        }
        self.remote.resolve_user_id(user_id).await
    }

    async fn resolve_db_url(&self, db_url: &str) -> Result<String> {
        if let Some(user_id) = self
            .registry
            .get(db_url)
            .and_then(|db| db.user_id().map(str::to_string))
        {
            return Ok(user_id);
        }
        self.remote.resolve_db_url(db_url).await
    }
}
