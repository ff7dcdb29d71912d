//! Health check endpoints
//!
//! - /health, /healthz - Liveness probe plus node counters
//! - /version - Build information

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Serialize;

use super::json_response;
use crate::node::NodeStats;
use crate::server::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Overall health status (true if service is running)
    pub healthy: bool,
    /// Service version
    pub version: &'static str,
    pub domain: String,
    pub node_id: String,
    /// Seconds since the server started
    pub uptime: u64,
    /// Operating mode
    pub mode: &'static str,
    #[serde(flatten)]
    pub stats: NodeStats,
    pub timestamp: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionResponse {
    pub version: &'static str,
    pub git_commit: &'static str,
    pub build_time: &'static str,
}

fn build_health_response(state: &AppState) -> HealthResponse {
    HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION"),
        domain: state.node.domain().to_string(),
        node_id: state.args.node_id.to_string(),
        uptime: state.started_at.elapsed().as_secs(),
        mode: if state.args.dev_mode {
            "development"
        } else {
            "production"
        },
        stats: state.node.stats(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    }
}

/// Handle liveness probe (/health, /healthz)
///
/// Always 200 while the process serves requests. Open issues are reported,
/// not treated as unhealthy.
pub fn health_check(state: Arc<AppState>) -> Response<Full<Bytes>> {
    json_response(StatusCode::OK, &build_health_response(&state))
}

pub fn version_info() -> Response<Full<Bytes>> {
    json_response(
        StatusCode::OK,
        &VersionResponse {
            version: env!("CARGO_PKG_VERSION"),
            git_commit: env!("GIT_COMMIT_SHORT"),
            build_time: env!("BUILD_TIMESTAMP"),
        },
    )
}
