//! Method dispatch indexer
//!
//! Reads `method-calls` from the logs a community (or server) subscribes to
//! and executes those addressed to it. The result is keyed by the call URL
//! and written once, so replaying a call is a no-op.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{IndexRun, Indexer};
use crate::db::schemas::{MethodCall, MethodResult, SubjectRef, UserRef};
use crate::db::Record;
use crate::methods::{MethodContext, MethodRegistry};
use crate::store::Entry;
use crate::types::Result;
use crate::util::now;

pub const ID: &str = "method-dispatch";

pub struct MethodDispatchIndexer {
    methods: Arc<MethodRegistry>,
}

impl MethodDispatchIndexer {
    pub fn new(methods: Arc<MethodRegistry>) -> Self {
        Self { methods }
    }
}

#[async_trait]
impl Indexer for MethodDispatchIndexer {
    fn id(&self) -> &'static str {
        ID
    }

    fn tables(&self) -> &'static [&'static str] {
        &[MethodCall::TABLE]
    }

    async fn apply(&self, run: &IndexRun, entry: &Entry) -> Result<()> {
        let call: MethodCall = match entry.decode() {
            Ok(Some(call)) => call,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!(source = %run.source.url(), key = %entry.key, error = %e, "Skipping malformed method call");
                return Ok(());
            }
        };
        if call.database.db_url != run.target.url() {
            return Ok(());
        }
        let Some(caller_id) = run.source.user_id() else {
            debug!(source = %run.source.url(), "Ignoring call from a database without owner");
            return Ok(());
        };

        let call_url = run.source.record_url(MethodCall::TABLE, &entry.key);
        let results = run.target.table::<MethodResult>();
        if results.get(&call_url).await?.is_some() {
            return Ok(());
        }

        let ctx = MethodContext {
            database: Arc::clone(&run.target),
            caller: UserRef {
                user_id: caller_id.to_string(),
                db_url: run.source.url().to_string(),
            },
            call_url: call_url.clone(),
            locks: run.locks.clone(),
        };
        let outcome = self.methods.dispatch(&call.method, &ctx, call.args).await?;

        results
            .put(
                &call_url,
                &MethodResult {
                    call: SubjectRef {
                        db_url: run.source.url().to_string(),
                        url: call_url.clone(),
                    },
                    code: outcome.code,
                    details: outcome.details,
                    created_at: now(),
                },
            )
            .await?;
        info!(
            db = %run.target.url(),
            caller = %caller_id,
            method = %call.method,
            code = ?outcome.code,
            "Method call handled"
        );
        Ok(())
    }
}
