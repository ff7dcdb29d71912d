//! Method handler registry
//!
//! Handlers run inside the `method-dispatch` indexer of the target database.
//! A handler returns result details on success; validation, permission and
//! lookup failures are turned into result codes rather than indexer errors.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{community, items};
use crate::db::schemas::{Member, ResultCode, Role, UserRef};
use crate::db::Database;
use crate::locks::LockRegistry;
use crate::types::{AgoraError, Result};

/// What a handler knows about the call it is serving.
pub struct MethodContext {
    /// The target database (a community or server public database).
    pub database: Arc<Database>,
    pub caller: UserRef,
    pub call_url: String,
    pub locks: LockRegistry,
}

impl MethodContext {
    /// Lock name for a resource of the target database.
    pub fn lock_name(&self, resource: &str) -> String {
        format!("{resource}:{}", self.database.url())
    }

    /// Fail unless the caller holds `permission` (admins hold all).
    pub async fn require_permission(&self, permission: &str) -> Result<Member> {
        let member = self
            .database
            .table::<Member>()
            .get(&self.caller.user_id)
            .await?
            .ok_or_else(|| {
                AgoraError::Permissions(format!("{} is not a member", self.caller.user_id))
            })?;
        if member.is_admin() {
            return Ok(member);
        }

        let roles = self.database.table::<Role>();
        for role_id in &member.roles {
            if let Some(role) = roles.get(role_id).await? {
                if role.permissions.iter().any(|p| p == permission) {
                    return Ok(member);
                }
            }
        }
        Err(AgoraError::Permissions(format!(
            "{} lacks {permission}",
            self.caller.user_id
        )))
    }
}

#[async_trait]
pub trait MethodHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, ctx: &MethodContext, args: Value) -> Result<Value>;
}

/// Result code and details recorded for a call.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodOutcome {
    pub code: ResultCode,
    pub details: Value,
}

impl MethodOutcome {
    fn failed(code: ResultCode, err: &AgoraError) -> Self {
        Self {
            code,
            details: json!({ "message": err.to_string() }),
        }
    }
}

pub struct MethodRegistry {
    handlers: HashMap<&'static str, Arc<dyn MethodHandler>>,
}

impl MethodRegistry {
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(Ping));
        community::register(&mut registry);
        items::register(&mut registry);
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn MethodHandler>) {
        self.handlers.insert(handler.name(), handler);
    }

    pub fn get(&self, method: &str) -> Option<Arc<dyn MethodHandler>> {
        self.handlers.get(method).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Run a handler and classify its outcome.
    ///
    /// I/O and network errors propagate so the dispatch indexer stops and the
    /// call is retried on the next pass.
    pub async fn dispatch(&self, method: &str, ctx: &MethodContext, args: Value) -> Result<MethodOutcome> {
        let Some(handler) = self.get(method) else {
            debug!(method, "Unknown method");
            return Ok(MethodOutcome {
                code: ResultCode::MethodNotFound,
                details: json!({ "message": format!("Method not found: {method}") }),
            });
        };

        match handler.handle(ctx, args).await {
            Ok(details) => Ok(MethodOutcome {
                code: ResultCode::Success,
                details,
            }),
            Err(e @ (AgoraError::Io(_) | AgoraError::Network(_))) => Err(e),
            Err(e) => {
                let code = match &e {
                    AgoraError::Validation(_) => ResultCode::ValidationFailed,
                    AgoraError::Permissions(_) | AgoraError::Session(_) => ResultCode::PermissionDenied,
                    AgoraError::NotFound(_) => ResultCode::NotFound,
                    _ => {
                        warn!(method, call = %ctx.call_url, error = %e, "Method handler failed");
                        ResultCode::Error
                    }
                };
                Ok(MethodOutcome::failed(code, &e))
            }
        }
    }
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Liveness check; echoes its arguments.
struct Ping;

#[async_trait]
impl MethodHandler for Ping {
    fn name(&self) -> &'static str {
        "ping"
    }

    async fn handle(&self, ctx: &MethodContext, args: Value) -> Result<Value> {
        Ok(json!({ "pong": ctx.caller.user_id, "args": args }))
    }
}
