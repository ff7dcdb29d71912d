//! Well-known user resolution
//!
//! Resolves `name@domain` by fetching
//! `https://<domain>/.well-known/agora/users/<name>`, which every node serves
//! from its `users` table. Results are cached with a TTL.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::{Directory, ResolvedUser};
use crate::types::{AgoraError, Result};
use crate::util::split_user_id;

/// Path prefix of the well-known user documents.
pub const WELL_KNOWN_USERS_PATH: &str = "/.well-known/agora/users/";

#[derive(Debug, Clone)]
pub struct WellKnownConfig {
    /// Cache TTL for resolved users (default: 5 minutes)
    pub cache_ttl: Duration,
    /// Timeout for HTTP requests (default: 5 seconds)
    pub request_timeout: Duration,
    /// Maximum cache entries (default: 1000)
    pub max_cache_entries: usize,
    /// `http` for local federation testing
    pub scheme: &'static str,
}

impl Default for WellKnownConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
            request_timeout: Duration::from_secs(5),
            max_cache_entries: 1000,
            scheme: "https",
        }
    }
}

struct CachedUser {
    user: ResolvedUser,
    expires_at: Instant,
}

pub struct WellKnownDirectory {
    config: WellKnownConfig,
    cache: RwLock<HashMap<String, CachedUser>>,
    http_client: reqwest::Client,
}

impl WellKnownDirectory {
    pub fn new() -> Self {
        Self::with_config(WellKnownConfig::default())
    }

    pub fn with_config(config: WellKnownConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("agora/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();

        Self {
            config,
            cache: RwLock::new(HashMap::new()),
            http_client,
        }
    }

    pub fn user_url(&self, user_id: &str) -> Result<String> {
        let (name, domain) = split_user_id(user_id)?;
        Ok(format!(
            "{}://{}{}{}",
            self.config.scheme, domain, WELL_KNOWN_USERS_PATH, name
        ))
    }

    async fn get_cached(&self, user_id: &str) -> Option<ResolvedUser> {
        let cache = self.cache.read().await;
        cache.get(user_id).and_then(|cached| {
            if cached.expires_at > Instant::now() {
                Some(cached.user.clone())
            } else {
                None
            }
        })
    }

    async fn cache_user(&self, user: ResolvedUser) {
        let mut cache = self.cache.write().await;

        if cache.len() >= self.config.max_cache_entries {
            cache.retain(|_, v| v.expires_at > Instant::now());
            if cache.len() >= self.config.max_cache_entries {
                let to_remove: Vec<_> = cache.keys().take(cache.len() / 2).cloned().collect();
                for key in to_remove {
                    cache.remove(&key);
                }
            }
        }

        cache.insert(
            user.user_id.clone(),
            CachedUser {
                user,
                expires_at: Instant::now() + self.config.cache_ttl,
            },
        );
    }

    async fn fetch(&self, user_id: &str) -> Result<ResolvedUser> {
        let url = self.user_url(user_id)?;
        debug!(user_id = %user_id, url = %url, "Resolving user via well-known");

        let response = self
            .http_client
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(AgoraError::NotFound(format!("User {user_id}")));
        }
        if !response.status().is_success() {
            return Err(AgoraError::Network(format!(
                "HTTP {} from {}",
                response.status(),
                url
            )));
        }

        let user: ResolvedUser = response.json().await?;
        if user.user_id != user_id {
            return Err(AgoraError::Validation(format!(
                "{url} describes {} instead of {user_id}",
                user.user_id
            )));
        }
        Ok(user)
    }
}

impl Default for WellKnownDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Directory for WellKnownDirectory {
    async fn resolve_user_id(&self, user_id: &str) -> Result<ResolvedUser> {
        if let Some(user) = self.get_cached(user_id).await {
            debug!(user_id = %user_id, "User resolved from cache");
            return Ok(user);
        }
        let user = self.fetch(user_id).await?;
        self.cache_user(user.clone()).await;
        Ok(user)
    }

    /// Only answers for users resolved earlier.
    async fn resolve_db_url(&self, db_url: &str) -> Result<String> {
        let cache = self.cache.read().await;
        cache
            .values()
            .find(|c| c.user.db_url == db_url)
            .map(|c| c.user.user_id.clone())
            .ok_or_else(|| AgoraError::NotFound(format!("No known user owns {db_url}")))
    }
}
