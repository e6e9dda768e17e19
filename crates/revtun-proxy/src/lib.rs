//! TLS tunnel proxies
//!
//! A [`TunnelProxy`] terminates TLS on a public address and forwards to the
//! loopback endpoint of a tunnel, either as an HTTP(S) reverse proxy or as a
//! websockify bridge for VNC.

pub mod cert;
pub mod config;
pub mod error;
pub mod http_proxy;
pub mod middleware;
pub mod server;
pub mod vnc;

pub use cert::{
    provider_from_config, server_config, CertificateProvider, CertifiedKey,
    FileCertificateProvider, SelfSignedCertificateProvider,
};
pub use config::{TlsMin, TunnelProxyConfig};
pub use error::ProxyError;
pub use http_proxy::{BackendError, HttpBackend};
pub use server::{ProxyKind, ProxyTarget, TunnelProxy, STOP_TIMEOUT};
pub use vnc::VNC_MAGIC;
