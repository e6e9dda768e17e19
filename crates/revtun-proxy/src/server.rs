//! TLS front end of a tunnel

use crate::cert::{server_config, CertificateProvider};
use crate::config::TunnelProxyConfig;
use crate::error::ProxyError;
use crate::http_proxy::{self, HttpBackend};
use crate::middleware::{check_acl, proxy_header};
use crate::vnc::{self, VncBackend};
use axum::extract::ConnectInfo;
use axum::middleware::from_fn_with_state;
use axum::Router;
use http::{HeaderValue, Method};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use revtun_proto::{join_host_port, AccessList};
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::ServiceExt;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, error, info, warn};

/// Longest wait for in-flight requests on stop
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

const READ_HEADER_TIMEOUT: Duration = Duration::from_secs(5);
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Pause before accepting again after an accept error
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// What the proxy speaks toward the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Http,
    Https,
    Vnc,
}

impl ProxyKind {
    /// Map a forwarding spec scheme; no scheme means plain HTTP
    pub fn from_scheme(scheme: Option<&str>) -> Result<Self, ProxyError> {
        match scheme.map(str::to_ascii_lowercase).as_deref() {
            None | Some("") | Some("http") => Ok(ProxyKind::Http),
            Some("https") => Ok(ProxyKind::Https),
            Some("vnc") => Ok(ProxyKind::Vnc),
            Some(other) => Err(ProxyError::config(format!(
                "scheme '{}' cannot be served by a tunnel proxy",
                other
            ))),
        }
    }
}

/// Public side and tunnel side of one proxy
#[derive(Debug, Clone)]
pub struct ProxyTarget {
    pub bind_host: String,
    pub bind_port: u16,
    pub backend_host: String,
    pub backend_port: u16,
    pub kind: ProxyKind,
    pub acl: Option<AccessList>,
    pub host_header: Option<String>,
    pub basic_auth: Option<(String, String)>,
}

#[derive(Debug, Clone)]
struct Running {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    abort: CancellationToken,
    tasks: TaskTracker,
}

#[derive(Debug)]
pub struct TunnelProxy {
    target: ProxyTarget,
    config: Arc<TunnelProxyConfig>,
    certs: Arc<dyn CertificateProvider>,
    running: OnceLock<Running>,
}

impl TunnelProxy {
    pub fn new(
        target: ProxyTarget,
        config: Arc<TunnelProxyConfig>,
        certs: Arc<dyn CertificateProvider>,
    ) -> Self {
        Self {
            target,
            config,
            certs,
            running: OnceLock::new(),
        }
    }

    /// Bind, then serve in the background until [`TunnelProxy::stop`]
    pub async fn start(&self) -> Result<SocketAddr, ProxyError> {
        if self.running.get().is_some() {
            return Err(ProxyError::AlreadyStarted);
        }

        let tls = server_config(self.certs.as_ref(), self.config.tls_min()?)?;
        let acceptor = TlsAcceptor::from(tls);

        let host = self.target.bind_host.as_str();
        let port = self.target.bind_port;
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|e| ProxyError::BindError {
                address: host.to_string(),
                port,
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr()?;

        let running = Running {
            local_addr,
            shutdown: CancellationToken::new(),
            abort: CancellationToken::new(),
            tasks: TaskTracker::new(),
        };
        let router = self.router(local_addr.port(), running.shutdown.clone())?;
        self.running
            .set(running.clone())
            .map_err(|_| ProxyError::AlreadyStarted)?;

        info!(
            proxy = %local_addr,
            backend = %join_host_port(&self.target.backend_host, self.target.backend_port),
            kind = ?self.target.kind,
            "Tunnel proxy started"
        );
        running
            .tasks
            .spawn(accept_loop(listener, acceptor, router, running.clone()));
        Ok(local_addr)
    }

    /// Stop accepting and let in-flight requests finish, up to [`STOP_TIMEOUT`]
    pub async fn stop(&self) {
        let Some(running) = self.running.get() else {
            return;
        };
        if running.shutdown.is_cancelled() {
            return;
        }

        running.shutdown.cancel();
        running.tasks.close();
        if tokio::time::timeout(STOP_TIMEOUT, running.tasks.wait())
            .await
            .is_err()
        {
            warn!(proxy = %running.local_addr, "Tunnel proxy connections still open after {:?}, closing them", STOP_TIMEOUT);
            running.abort.cancel();
            running.tasks.wait().await;
        }
        info!(proxy = %running.local_addr, "Tunnel proxy stopped");
    }

    pub fn target(&self) -> &ProxyTarget {
        &self.target
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.get().map(|running| running.local_addr)
    }

    fn port(&self) -> u16 {
        self.local_addr()
            .map(|addr| addr.port())
            .unwrap_or(self.target.bind_port)
    }

    /// `host:port` the proxy listens on
    pub fn addr(&self) -> String {
        join_host_port(&self.target.bind_host, self.port())
    }

    pub fn public_url(&self) -> String {
        let host = self
            .config
            .host
            .as_deref()
            .unwrap_or(&self.target.bind_host);
        format!("https://{}", join_host_port(host, self.port()))
    }

    fn router(&self, port: u16, shutdown: CancellationToken) -> Result<Router, ProxyError> {
        let target = &self.target;
        let router = match target.kind {
            ProxyKind::Http | ProxyKind::Https => {
                let mut backend = HttpBackend::new(
                    target.backend_host.clone(),
                    target.backend_port,
                    target.kind == ProxyKind::Https,
                )?;
                if let Some(host) = &target.host_header {
                    backend = backend.with_host_header(host)?;
                }
                if let Some((user, password)) = &target.basic_auth {
                    backend = backend.with_basic_auth(user, password);
                }
                http_proxy::router(backend)
            }
            ProxyKind::Vnc => vnc::router(
                VncBackend {
                    addr: join_host_port(&target.backend_host, target.backend_port),
                    shutdown,
                },
                self.config.novnc_root.clone(),
            ),
        };

        let header = HeaderValue::from_str(&join_host_port(&target.bind_host, port))
            .map_err(|e| ProxyError::config(e.to_string()))?;
        let mut router = router
            .layer(from_fn_with_state(Arc::new(target.acl.clone()), check_acl))
            .layer(from_fn_with_state(header, proxy_header));

        if !self.config.cors.is_empty() {
            let origins = self
                .config
                .cors
                .iter()
                .map(|origin| HeaderValue::from_str(origin))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| ProxyError::config(e.to_string()))?;
            router = router.layer(
                CorsLayer::new()
                    .allow_origin(AllowOrigin::list(origins))
                    .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
                    .allow_headers(Any),
            );
        }

        Ok(router)
    }
}

/// Wait out [`ACCEPT_ERROR_BACKOFF`]; false if shutdown came first
async fn accept_backoff(shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => true,
    }
}

async fn accept_loop(listener: TcpListener, acceptor: TlsAcceptor, router: Router, running: Running) {
    loop {
        let accepted = tokio::select! {
            _ = running.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(proxy = %running.local_addr, "Failed to accept proxy connection: {}", e);
                if !accept_backoff(&running.shutdown).await {
                    break;
                }
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let router = router.clone();
        let shutdown = running.shutdown.clone();
        let abort = running.abort.clone();
        running.tasks.spawn(async move {
            let handshake = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream));
            let tls = tokio::select! {
                _ = shutdown.cancelled() => return,
                handshake = handshake => match handshake {
                    Ok(Ok(tls)) => tls,
                    Ok(Err(e)) => {
                        debug!(%peer, "TLS handshake failed: {}", e);
                        return;
                    }
                    Err(_) => {
                        debug!(%peer, "TLS handshake timed out");
                        return;
                    }
                },
            };
            serve_connection(tls, peer, router, shutdown, abort).await;
        });
    }
    debug!(proxy = %running.local_addr, "Proxy accept loop stopped");
}

async fn serve_connection(
    tls: TlsStream<TcpStream>,
    peer: SocketAddr,
    router: Router,
    shutdown: CancellationToken,
    abort: CancellationToken,
) {
    let service = hyper::service::service_fn(move |mut req: http::Request<Incoming>| {
        req.extensions_mut().insert(ConnectInfo(peer));
        router.clone().oneshot(req)
    });

    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(READ_HEADER_TIMEOUT);

    let conn = builder.serve_connection_with_upgrades(TokioIo::new(tls), service);
    tokio::pin!(conn);

    tokio::select! {
        served = conn.as_mut() => {
            if let Err(e) = served {
                debug!(%peer, "Proxy connection ended: {}", e);
            }
            return;
        }
        _ = shutdown.cancelled() => {}
    }

    conn.as_mut().graceful_shutdown();
    tokio::select! {
        _ = conn.as_mut() => {}
        _ = abort.cancelled() => {}
    }
}
