//! Federation endpoints
//!
//! - `GET /.well-known/agora/users/<name>` answers directory lookups from
//!   other nodes with the local user's public database.
//! - `POST /_api/method/remote-handle` lets a caller's node nudge this node
//!   to process a method call addressed to one of its databases. The caller's
//!   domain must match the request origin.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use tracing::{debug, warn};

use super::{error_response, json_response};
use crate::methods::RemoteHandleRequest;
use crate::node::Node;
use crate::types::AgoraError;

/// Well-known user document for `username`.
pub async fn handle_well_known_user(node: &Node, username: &str) -> Response<Full<Bytes>> {
    let username = match urlencoding::decode(username) {
        Ok(name) => name.into_owned(),
        Err(_) => {
            return error_response(AgoraError::Validation(format!(
                "Invalid username encoding: {username}"
            )))
        }
    };
    match node.resolve_local(&username).await {
        Ok(user) => json_response(StatusCode::OK, &user),
        Err(e) => {
            debug!(username = %username, error = %e, "Well-known lookup failed");
            error_response(e)
        }
    }
}

/// Serve a remote-handle request. `origin` is the sender's Origin header
/// (or Host when absent).
pub async fn handle_remote_handle(node: &Node, origin: Option<&str>, body: &Bytes) -> Response<Full<Bytes>> {
    let Some(origin) = origin.filter(|o| !o.is_empty()) else {
        return error_response(AgoraError::Validation(
            "Remote-handle requests need an Origin".to_string(),
        ));
    };
    let request: RemoteHandleRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(e) => return error_response(e.into()),
    };

    match node.handle_remote(&request, origin).await {
        Ok(()) => json_response(StatusCode::OK, &serde_json::json!({ "success": true })),
        Err(e) => {
            warn!(
                origin = %origin,
                caller = %request.caller.user_id,
                call = %request.call_url,
                error = %e,
                "Remote-handle rejected"
            );
            error_response(e)
        }
    }
}
