//! HTTP server implementation
//!
//! Serves the federation surface of a node: health, well-known user
//! documents, remote-handle nudges and the issue endpoints.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::config::Args;
use crate::directory::well_known::WELL_KNOWN_USERS_PATH;
use crate::methods::notifier::REMOTE_HANDLE_PATH;
use crate::node::Node;
use crate::routes::{self, ISSUES_PATH};
use crate::types::{AgoraError, Result};

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Shared application state
pub struct AppState {
    pub args: Args,
    pub node: Arc<Node>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(args: Args, node: Arc<Node>) -> Self {
        Self {
            args,
            node,
            started_at: Instant::now(),
        }
    }
}

/// Run the HTTP server
pub async fn run(state: Arc<AppState>) -> Result<()> {
    let listener = TcpListener::bind(state.args.listen).await?;

    info!(
        "Agora listening on {} as node {} ({})",
        state.args.listen,
        state.args.node_id,
        state.node.domain()
    );

    if state.args.insecure_federation {
        warn!("Insecure federation enabled - other nodes are reached over plain http");
    }

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new()
                        .preserve_header_case(true)
                        .title_case_headers(true)
                        .serve_connection(io, service)
                        .await
                    {
                        error!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

/// Route incoming requests
async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> std::result::Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);

    debug!("[{}] {} {}", addr, method, path);

    if method == Method::OPTIONS {
        return Ok(to_boxed(preflight_response()));
    }

    // Issue endpoints carry encoded ids in the path
    if path == ISSUES_PATH || path.starts_with(&format!("{ISSUES_PATH}/")) {
        let response =
            routes::handle_issues_request(state.node.issues(), &method, &path, query.as_deref())
                .await;
        return Ok(to_boxed(with_cors(response)));
    }

    if method == Method::GET {
        if let Some(username) = path.strip_prefix(WELL_KNOWN_USERS_PATH) {
            if !username.is_empty() && !username.contains('/') {
                let response = routes::handle_well_known_user(&state.node, username).await;
                return Ok(to_boxed(with_cors(response)));
            }
        }
    }

    let response = match (method, path.as_str()) {
        (Method::GET, "/health") | (Method::GET, "/healthz") => {
            with_cors(routes::health_check(Arc::clone(&state)))
        }
        (Method::GET, "/version") => with_cors(routes::version_info()),

        (Method::POST, REMOTE_HANDLE_PATH) => {
            let origin = request_origin(&req);
            let body = match req.into_body().collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    return Ok(to_boxed(routes::error_response(AgoraError::Validation(
                        format!("Failed to read body: {e}"),
                    ))))
                }
            };
            routes::handle_remote_handle(&state.node, origin.as_deref(), &body).await
        }

        _ => routes::not_found_response(&path),
    };

    Ok(to_boxed(response))
}

/// Origin of a federation request: the Origin header, or Host when absent.
///
/// This is the trust boundary of remote-handle. Both headers are supplied by
/// the client, so a forged value only passes the caller-domain check; the
/// call itself must still exist in the caller's replicated log. Nodes that
/// need more must sit behind a proxy that authenticates peers (mutual TLS)
/// and overwrites `Origin` with the verified host.
fn request_origin<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get("origin")
        .or_else(|| req.headers().get("host"))
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
}

/// Convert Full<Bytes> response to BoxBody response
fn to_boxed(response: Response<Full<Bytes>>) -> Response<BoxBody> {
    response.map(|body| body.map_err(|never| match never {}).boxed())
}

fn with_cors(mut response: Response<Full<Bytes>>) -> Response<Full<Bytes>> {
    response
        .headers_mut()
        .insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}

/// CORS preflight response
fn preflight_response() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        "Access-Control-Allow-Headers",
        HeaderValue::from_static("*"),
    );
    headers.insert(
        "Access-Control-Allow-Methods",
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_origin_prefers_origin_header() {
        let req = Request::builder()
            .header("host", "b.example")
            .header("origin", "https://a.example")
            .body(())
            .unwrap();
        assert_eq!(request_origin(&req).as_deref(), Some("https://a.example"));

        let req = Request::builder().header("host", "a.example").body(()).unwrap();
        assert_eq!(request_origin(&req).as_deref(), Some("a.example"));

        let req = Request::builder().body(()).unwrap();
        assert_eq!(request_origin(&req), None);
    }

    #[test]
    fn test_preflight_allows_any_origin() {
        let response = preflight_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    }
}
