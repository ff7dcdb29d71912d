//! Issue endpoints
//!
//! - `GET  /_api/issues` lists open issues
//! - `POST /_api/issues/<id>/recover` runs an issue's recovery action
//! - `POST /_api/issues/<id>/dismiss[?ignore_future=true]` drops an issue
//!
//! Issue ids contain `:` and `/`, so they travel percent-encoded.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Method, Response, StatusCode};
use serde::Deserialize;

use super::{error_response, json_response, not_found_response};
use crate::issues::IssueTracker;
use crate::types::AgoraError;

pub const ISSUES_PATH: &str = "/_api/issues";

#[derive(Debug, Default, Deserialize)]
struct DismissQuery {
    #[serde(default)]
    ignore_future: bool,
}

/// Route any request under [`ISSUES_PATH`].
pub async fn handle_issues_request(
    issues: &IssueTracker,
    method: &Method,
    path: &str,
    query: Option<&str>,
) -> Response<Full<Bytes>> {
    let rest = path.strip_prefix(ISSUES_PATH).unwrap_or_default();

    if rest.is_empty() || rest == "/" {
        return match *method {
            Method::GET => json_response(StatusCode::OK, &issues.list()),
            _ => not_found_response(path),
        };
    }
    if *method != Method::POST {
        return not_found_response(path);
    }

    let Some((encoded_id, action)) = rest.trim_start_matches('/').rsplit_once('/') else {
        return not_found_response(path);
    };
    let id = match urlencoding::decode(encoded_id) {
        Ok(id) => id.into_owned(),
        Err(_) => {
            return error_response(AgoraError::Validation(format!(
                "Invalid issue id encoding: {encoded_id}"
            )))
        }
    };

    let result = match action {
        "recover" => issues.recover(&id).await,
        "dismiss" => {
            let query: DismissQuery = match serde_urlencoded::from_str(query.unwrap_or_default()) {
                Ok(q) => q,
                Err(e) => {
                    return error_response(AgoraError::Validation(format!("Invalid query: {e}")))
                }
            };
            issues.dismiss(&id, query.ignore_future)
        }
        _ => return not_found_response(path),
    };

    match result {
        Ok(()) => json_response(StatusCode::OK, &serde_json::json!({ "success": true, "id": id })),
        Err(e) => error_response(e),
    }
}
