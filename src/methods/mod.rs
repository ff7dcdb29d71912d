//! Method-Invocation Protocol
//!
//! One database asks another to perform a privileged mutation:
//!
//! ```text
//!   caller node                                   target node
//!   ───────────                                   ───────────
//!   call()
//!     ├─ write method-calls/<key> (caller db)
//!     ├─ local target:  on_change(caller, only=[target])
//!     └─ remote target: POST /_api/method/remote-handle ──► handle_remote()
//!                                                             ├─ origin == caller domain?
//!                                                             ├─ load caller db (shadow copy)
//!                                                             └─ on_change(caller, only=[target])
//!                                                                  └─ method-dispatch indexer
//!                                                                       └─ write method-results/<call url>
//!   get_result(wait)
//!     └─ poll target's method-results every tick,
//!        re-sending remote-handle until the clamped timeout
//! ```
//!
//! Results are durable records in the target's log, so a lost notification
//! only delays the result until the next tick or the target's own watcher.

pub mod community;
pub mod handlers;
pub mod items;
pub mod notifier;

pub use handlers::{MethodContext, MethodHandler, MethodOutcome, MethodRegistry};
pub use notifier::{HttpNotifier, RemoteHandleRequest, RemoteNotifier};

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::db::schemas::{MethodCall, MethodResult, UserRef};
use crate::db::{Database, DatabaseRegistry, Record};
use crate::directory::{Directory, ResolvedUser};
use crate::index::IndexingEngine;
use crate::types::{AgoraError, Result};
use crate::util::{domain_of, now, time_key, RecordUrl};

#[derive(Debug, Clone)]
pub struct MethodConfig {
    /// Delay between result polls (default: 5 seconds)
    pub poll_interval: Duration,
    /// Lower bound of a result wait (default: 5 seconds)
    pub timeout_min: Duration,
    /// Upper bound of a result wait (default: 60 seconds)
    pub timeout_max: Duration,
}

impl Default for MethodConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            timeout_min: Duration::from_secs(5),
            timeout_max: Duration::from_secs(60),
        }
    }
}

impl MethodConfig {
    /// Requested timeout clamped to `[timeout_min, timeout_max]`, the minimum
    /// when absent.
    pub fn clamp_timeout(&self, requested: Option<Duration>) -> Duration {
        requested
            .unwrap_or(self.timeout_min)
            .clamp(self.timeout_min, self.timeout_max)
    }
}

#[derive(Debug, Clone, Default)]
pub struct GetResultOpts {
    pub wait: bool,
    pub timeout: Option<Duration>,
}

impl GetResultOpts {
    pub fn wait() -> Self {
        Self {
            wait: true,
            timeout: None,
        }
    }

    pub fn no_wait() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A call that has been written.
#[derive(Debug, Clone)]
pub struct CallHandle {
    pub key: String,
    pub call_url: String,
    pub target: ResolvedUser,
}

/// Host part of an `Origin` or `Host` header value.
pub fn origin_host(origin: &str) -> &str {
    let without_scheme = origin
        .strip_prefix("https://")
        .or_else(|| origin.strip_prefix("http://"))
        .unwrap_or(origin);
    without_scheme
        .split('/')
        .next()
        .unwrap_or(without_scheme)
}

pub struct MethodProtocol {
    config: MethodConfig,
    registry: Arc<DatabaseRegistry>,
    engine: Arc<IndexingEngine>,
    directory: Arc<dyn Directory>,
    notifier: Arc<dyn RemoteNotifier>,
}

impl MethodProtocol {
    pub fn new(
        config: MethodConfig,
        registry: Arc<DatabaseRegistry>,
        engine: Arc<IndexingEngine>,
        directory: Arc<dyn Directory>,
        notifier: Arc<dyn RemoteNotifier>,
    ) -> Self {
        Self {
            config,
            registry,
            engine,
            directory,
            notifier,
        }
    }

    pub fn config(&self) -> &MethodConfig {
        &self.config
    }

    pub fn clamp_timeout(&self, requested: Option<Duration>) -> Duration {
        self.config.clamp_timeout(requested)
    }

    /// Record a call in `caller` addressed to `target_user_id` and get it
    /// processed.
    pub async fn call(
        &self,
        caller: &Database,
        target_user_id: &str,
        method: &str,
        args: Value,
    ) -> Result<CallHandle> {
        let caller_id = caller
            .user_id()
            .ok_or_else(|| AgoraError::Session(format!("{} has no owner", caller.url())))?;
        if !caller.writable() || !caller.kind().is_public() {
            return Err(AgoraError::Session(format!(
                "Calls must be written to a public database hosted here, not {}",
                caller.url()
            )));
        }

        let target = self.directory.resolve_user_id(target_user_id).await?;
        let key = time_key();
        let call = MethodCall {
            database: target.user_ref(),
            method: method.to_string(),
            args,
            created_at: now(),
        };
        caller.table::<MethodCall>().put(&key, &call).await?;
        let call_url = caller.record_url(MethodCall::TABLE, &key);
        info!(
            caller = %caller_id,
            target = %target.user_id,
            method = %method,
            call = %call_url,
            "Method called"
        );

        if self.registry.is_local(&target.db_url) {
            let only = [target.db_url.clone()];
            self.engine.on_change(caller.url(), Some(&only[..])).await;
        } else {
            self.spawn_notify(RemoteHandleRequest {
                target: target.user_ref(),
                caller: UserRef {
                    user_id: caller_id.to_string(),
                    db_url: caller.url().to_string(),
                },
                call_url: call_url.clone(),
            });
        }

        Ok(CallHandle {
            key,
            call_url,
            target,
        })
    }

    /// Look up a call's result, optionally polling until the clamped timeout.
    /// `Ok(None)` means no result (yet).
    pub async fn get_result(
        &self,
        caller: &Database,
        target_user_id: &str,
        call_url: &str,
        opts: GetResultOpts,
    ) -> Result<Option<MethodResult>> {
        let target = self.directory.resolve_user_id(target_user_id).await?;
        let remote = !self.registry.is_local(&target.db_url);
        let timeout = self.clamp_timeout(opts.timeout);
        let deadline = Instant::now() + timeout;

        loop {
            match self.lookup_result(&target, call_url).await {
                Ok(Some(result)) => return Ok(Some(result)),
                Ok(None) => {}
                Err(e) if !opts.wait => return Err(e),
                Err(e) => debug!(call = %call_url, error = %e, "Result lookup failed, will retry"),
            }
            if !opts.wait {
                return Ok(None);
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(call = %call_url, timeout_ms = timeout.as_millis() as u64, "Timed out waiting for result");
                return Ok(None);
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;

            if remote {
                if let Some(caller_id) = caller.user_id() {
                    self.spawn_notify(RemoteHandleRequest {
                        target: target.user_ref(),
                        caller: UserRef {
                            user_id: caller_id.to_string(),
                            db_url: caller.url().to_string(),
                        },
                        call_url: call_url.to_string(),
                    });
                }
            }
        }
    }

    /// `call` followed by a waiting `get_result`. A timeout is a
    /// `Network` error.
    pub async fn call_and_wait(
        &self,
        caller: &Database,
        target_user_id: &str,
        method: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> Result<MethodResult> {
        let handle = self.call(caller, target_user_id, method, args).await?;
        let opts = GetResultOpts {
            wait: true,
            timeout,
        };
        self.get_result(caller, target_user_id, &handle.call_url, opts)
            .await?
            .ok_or_else(|| {
                AgoraError::Network(format!(
                    "{} did not answer {} in time",
                    target_user_id, handle.call_url
                ))
            })
    }

    /// Serve a remote-handle request that arrived from `origin`.
    pub async fn handle_remote(&self, request: &RemoteHandleRequest, origin: &str) -> Result<()> {
        let caller_domain = domain_of(&request.caller.user_id)?;
        let origin = origin_host(origin);
        if !caller_domain.eq_ignore_ascii_case(origin) {
            return Err(AgoraError::Configuration(format!(
                "{} cannot be served by origin {origin}",
                request.caller.user_id
            )));
        }

        let target = self
            .registry
            .get(&request.target.db_url)
            .filter(|db| db.writable() && db.user_id() == Some(request.target.user_id.as_str()))
            .ok_or_else(|| {
                AgoraError::NotFound(format!("{} is not hosted here", request.target.user_id))
            })?;

        let caller = self.directory.resolve_user_id(&request.caller.user_id).await?;
        if caller.db_url != request.caller.db_url {
            return Err(AgoraError::Configuration(format!(
                "{} does not own {}",
                request.caller.user_id, request.caller.db_url
            )));
        }

        let call = RecordUrl::parse(&request.call_url)?;
        if call.db_url != caller.db_url || call.table != MethodCall::TABLE {
            return Err(AgoraError::Validation(format!(
                "{} is not a call of {}",
                request.call_url, caller.user_id
            )));
        }

        self.registry.load_external(&caller).await?;
        debug!(
            caller = %caller.user_id,
            target = %request.target.user_id,
            call = %request.call_url,
            "Handling remote call"
        );
        let only = [target.url().to_string()];
        self.engine.on_change(&caller.db_url, Some(&only[..])).await;
        Ok(())
    }

    async fn lookup_result(&self, target: &ResolvedUser, call_url: &str) -> Result<Option<MethodResult>> {
        let db = match self.registry.get(&target.db_url) {
            Some(db) => db,
            None => self.registry.load_external(target).await?,
        };
        db.table::<MethodResult>().get(call_url).await
    }

    fn spawn_notify(&self, request: RemoteHandleRequest) {
        let domain = match domain_of(&request.target.user_id) {
            Ok(domain) => domain.to_string(),
            Err(e) => {
                debug!(error = %e, "Cannot notify target");
                return;
            }
        };
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(&domain, &request).await {
                debug!(domain = %domain, call = %request.call_url, error = %e, "Remote-handle notification failed");
            }
        });
    }
}
