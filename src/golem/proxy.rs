//! Reverse proxy onto golem debug ports.
//!
//! Rewrites `/golem/v1/proxy/{wsid}/{rest}` to
//! `http://localhost:<port>/{rest}` where the port is the golem's mapped
//! remote-debugging port, looked up per request.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::golem;
use crate::server::HerderState;

/// Cap on proxied request bodies; the debug protocol exchanges small JSON.
const MAX_PROXY_BODY: usize = 4 * 1024 * 1024;

/// `ANY /golem/v1/proxy/{wsid}/{*rest}`.
pub async fn proxy_handler(
    State(state): State<Arc<HerderState>>,
    Path((wsid, rest)): Path<(String, String)>,
    req: Request,
) -> Response {
    let port = match golem::port_of(&state.docker, &state.config, &wsid, golem::DEBUG_PORT).await {
        Ok(port) => port,
        Err(e) => {
            tracing::warn!(webstrate = %wsid, error = %e, "Could not find golem to proxy");
            return (StatusCode::NOT_FOUND, "No golem for webstrate").into_response();
        }
    };

    let query = req
        .uri()
        .query()
        .map(|q| format!("?{q}"))
        .unwrap_or_default();
    let target = format!("http://localhost:{port}/{rest}{query}");

    let method = match reqwest::Method::from_bytes(req.method().as_str().as_bytes()) {
        Ok(method) => method,
        Err(_) => {
            return (StatusCode::BAD_REQUEST, "Unsupported method").into_response();
        }
    };

    let body = match axum::body::to_bytes(req.into_body(), MAX_PROXY_BODY).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(error = %e, "Error reading proxy request body");
            return (StatusCode::BAD_REQUEST, "Bad request body").into_response();
        }
    };

    let upstream = state.http.request(method, &target).body(body).send().await;
    match upstream {
        Ok(resp) => {
            let status =
                StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            let content_type = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            match resp.bytes().await {
                Ok(bytes) => {
                    let mut response = Response::builder().status(status);
                    if let Some(ct) = content_type {
                        response = response.header(axum::http::header::CONTENT_TYPE, ct);
                    }
                    response
                        .body(Body::from(bytes))
                        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
                }
                Err(e) => {
                    tracing::warn!(error = %e, target = %target, "Error reading upstream body");
                    StatusCode::BAD_GATEWAY.into_response()
                }
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, target = %target, "Proxy request failed");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    /// The rewrite rule: prefix + wsid + rest map to localhost:port + rest.
    #[test]
    fn test_target_url_shape() {
        let port = 32768u16;
        let rest = "json/list";
        let query = "?t=1";
        let target = format!("http://localhost:{port}/{rest}{query}");
        assert_eq!(target, "http://localhost:32768/json/list?t=1");
    }
}
