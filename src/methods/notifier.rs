//! Remote-handle notifications
//!
//! After writing a call addressed to a database hosted elsewhere, the caller
//! nudges the target's node so it reads the new call without waiting for its
//! own replication to notice. Delivery is best effort; the result poll loop
//! re-sends the nudge on every tick.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::db::schemas::UserRef;
use crate::types::{AgoraError, Result};

/// Path of the remote-handle endpoint.
pub const REMOTE_HANDLE_PATH: &str = "/_api/method/remote-handle";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteHandleRequest {
    pub target: UserRef,
    pub caller: UserRef,
    pub call_url: String,
}

#[async_trait]
pub trait RemoteNotifier: Send + Sync {
    /// Ask the node serving `target_domain` to process a call.
    async fn notify(&self, target_domain: &str, request: &RemoteHandleRequest) -> Result<()>;
}

/// Posts remote-handle requests over HTTP.
pub struct HttpNotifier {
    origin: String,
    scheme: &'static str,
    http_client: reqwest::Client,
}

impl HttpNotifier {
    /// `origin_domain` is this node's domain, sent as the `Origin` header.
    pub fn new(origin_domain: &str, scheme: &'static str, request_timeout: Duration) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("agora/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();

        Self {
            origin: format!("{scheme}://{origin_domain}"),
            scheme,
            http_client,
        }
    }

    pub fn endpoint(&self, target_domain: &str) -> String {
        format!("{}://{}{}", self.scheme, target_domain, REMOTE_HANDLE_PATH)
    }
}

#[async_trait]
impl RemoteNotifier for HttpNotifier {
    async fn notify(&self, target_domain: &str, request: &RemoteHandleRequest) -> Result<()> {
        let url = self.endpoint(target_domain);
        debug!(url = %url, call = %request.call_url, "Sending remote-handle");

        let response = self
            .http_client
            .post(&url)
            .header("Origin", &self.origin)
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AgoraError::Network(format!(
                "HTTP {status} from {url}: {body}"
            )));
        }
        Ok(())
    }
}
