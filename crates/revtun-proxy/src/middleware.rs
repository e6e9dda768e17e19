//! Layers shared by both proxy flavours

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use http::header::{CACHE_CONTROL, CONTENT_TYPE, EXPIRES, PRAGMA};
use http::{HeaderName, HeaderValue, StatusCode};
use revtun_proto::{is_permitted, AccessList, PROXY_HEADER};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

/// Small HTML page used for every error the proxy produces itself
pub fn html_error(status: StatusCode, message: &str) -> Response {
    let text = format!(
        "[{}] Revtun tunnel proxy: {}",
        status.as_u16(),
        escape(message)
    );
    let body = format!(
        "<!DOCTYPE html>\n<html><head><title>{text}</title></head><body><p>{text}</p></body></html>\n"
    );
    (
        status,
        [(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"))],
        Body::from(body),
    )
        .into_response()
}

fn escape(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    for c in message.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

pub(crate) async fn check_acl(
    State(acl): State<Arc<Option<AccessList>>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    if !is_permitted(acl.as_ref().as_ref(), &peer) {
        debug!(%peer, uri = %req.uri(), "Proxy request rejected by ACL");
        return html_error(StatusCode::FORBIDDEN, "Access rejected by ACL");
    }
    next.run(req).await
}

pub(crate) async fn proxy_header(
    State(addr): State<HeaderValue>,
    req: Request,
    next: Next,
) -> Response {
    let mut response = next.run(req).await;
    response
        .headers_mut()
        .insert(HeaderName::from_static(PROXY_HEADER), addr);
    response
}

pub(crate) async fn no_cache(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(EXPIRES, HeaderValue::from_static("0"));
    response
}
