//! HTTP(S) reverse proxy toward the tunnel's local endpoint

use crate::cert::backend_client_config;
use crate::error::ProxyError;
use crate::middleware::html_error;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::response::{IntoResponse, Response};
use axum::Router;
use base64::Engine;
use http::header::{AUTHORIZATION, CONTENT_TYPE, HOST, WWW_AUTHENTICATE};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri, Version};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, error};

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Headers that only apply to a single connection
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("connect failed: {0}")]
    Connect(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid request: {0}")]
    Request(String),
}

/// Where and how requests are forwarded
#[derive(Clone)]
pub struct HttpBackend {
    host: String,
    port: u16,
    tls: Option<TlsConnector>,
    host_header: Option<HeaderValue>,
    basic_auth: Option<(String, String)>,
}

impl fmt::Debug for HttpBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpBackend")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("https", &self.tls.is_some())
            .field("host_header", &self.host_header)
            .field("basic_auth", &self.basic_auth.as_ref().map(|(user, _)| user))
            .finish()
    }
}

impl HttpBackend {
    pub fn new(host: impl Into<String>, port: u16, https: bool) -> Result<Self, ProxyError> {
        let tls = match https {
            true => Some(TlsConnector::from(backend_client_config()?)),
            false => None,
        };
        Ok(Self {
            host: host.into(),
            port,
            tls,
            host_header: None,
            basic_auth: None,
        })
    }

    /// Replace the `Host` header of every forwarded request
    pub fn with_host_header(mut self, host: &str) -> Result<Self, ProxyError> {
        let value = HeaderValue::from_str(host)
            .map_err(|_| ProxyError::config(format!("invalid host header '{}'", host)))?;
        self.host_header = Some(value);
        Ok(self)
    }

    /// Require callers to present these credentials
    pub fn with_basic_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.basic_auth = Some((user.into(), password.into()));
        self
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some((user, password)) = &self.basic_auth else {
            return true;
        };
        match basic_credentials(headers) {
            Some((given_user, given_password)) => &given_user == user && &given_password == password,
            None => false,
        }
    }

    async fn forward(&self, peer: SocketAddr, mut req: Request) -> Result<Response, BackendError> {
        prepare_request(&mut req, peer, self.host_header.as_ref())?;

        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        let mut response = match &self.tls {
            Some(connector) => {
                let server_name = ServerName::try_from(self.host.clone())
                    .map_err(|e| BackendError::Request(e.to_string()))?;
                let stream = connector.connect(server_name, stream).await?;
                round_trip(stream, req).await?
            }
            None => round_trip(stream, req).await?,
        };

        strip_hop_by_hop(response.headers_mut());
        Ok(response.map(Body::new))
    }
}

pub(crate) fn router(backend: HttpBackend) -> Router {
    Router::new()
        .fallback(handle)
        .with_state(Arc::new(backend))
}

async fn handle(
    State(backend): State<Arc<HttpBackend>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    if !backend.authorized(req.headers()) {
        debug!(%peer, "Proxy request without valid credentials");
        return unauthorized();
    }

    match backend.forward(peer, req).await {
        Ok(response) => response,
        Err(e) => {
            error!(
                backend = %format!("{}:{}", backend.host, backend.port),
                %peer,
                "Tunnel proxy backend error: {}", e
            );
            html_error(StatusCode::BAD_GATEWAY, &e.to_string())
        }
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [
            (
                WWW_AUTHENTICATE,
                HeaderValue::from_static(r#"Basic realm="restricted", charset="UTF-8""#),
            ),
            (CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8")),
        ],
        "Unauthorized\n",
    )
        .into_response()
}

/// Decode `Authorization: Basic <base64(user:password)>`
fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Turn the incoming request into an origin-form HTTP/1.1 request for the backend
fn prepare_request(
    req: &mut Request,
    peer: SocketAddr,
    host_header: Option<&HeaderValue>,
) -> Result<(), BackendError> {
    // h2 requests carry the host in the URI only
    let host = match host_header {
        Some(host) => Some(host.clone()),
        None => req.headers().get(HOST).cloned().or_else(|| {
            req.uri()
                .authority()
                .and_then(|authority| HeaderValue::from_str(authority.as_str()).ok())
        }),
    };

    let path = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    let uri: Uri = path
        .parse()
        .map_err(|e: http::uri::InvalidUri| BackendError::Request(e.to_string()))?;
    *req.uri_mut() = uri;
    *req.version_mut() = Version::HTTP_11;

    let headers = req.headers_mut();
    strip_hop_by_hop(headers);
    if let Some(host) = host {
        headers.insert(HOST, host);
    }

    let forwarded = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{}, {}", prior, peer.ip()),
        None => peer.ip().to_string(),
    };
    let forwarded =
        HeaderValue::from_str(&forwarded).map_err(|e| BackendError::Request(e.to_string()))?;
    headers.insert(X_FORWARDED_FOR.clone(), forwarded);
    Ok(())
}

async fn round_trip<S>(stream: S, req: Request) -> Result<http::Response<Incoming>, BackendError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Backend connection ended: {}", e);
        }
    });
    Ok(sender.send_request(req).await?)
}
