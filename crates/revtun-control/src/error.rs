use crate::persistence::PersistenceError;
use crate::route::RouteError;
use revtun_proto::{AclError, VersionError};
use revtun_proxy::ProxyError;
use revtun_transport::TransportError;
use revtun_tunnel::{PortError, TunnelError};
use thiserror::Error;

/// Coarse classification reported back to agents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Conflict,
    InvalidInput,
    ResourceExhausted,
    TransportFailure,
    Internal,
}

impl ErrorKind {
    /// HTTP-like status code carried in rejections
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::Conflict => 409,
            ErrorKind::InvalidInput => 400,
            ErrorKind::ResourceExhausted => 503,
            ErrorKind::TransportFailure => 502,
            ErrorKind::Internal => 500,
        }
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("client is already connected: {0}")]
    AlreadyConnected(String),

    #[error("client auth ID is already in use: {0:?}")]
    AuthIdInUse(String),

    #[error("Client is active, should be disconnected")]
    StillConnected(String),

    #[error("client is not connected: {0}")]
    NotConnected(String),

    #[error("client not found: {0}")]
    SessionNotFound(String),

    #[error("tunnel {tunnel_id} not found for client {agent_id}")]
    TunnelNotFound { agent_id: String, tunnel_id: String },

    #[error("Local port {0} is not among allowed ports")]
    PortNotAllowed(u16),

    #[error("Local port {0} already in use")]
    PortInUse(u16),

    #[error("failed to determine client version: {0}")]
    Version(#[from] VersionError),

    #[error("Invalid ACL: {0}")]
    Acl(#[from] AclError),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error("can't create tunnel: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("tunnel proxy: {0}")]
    Proxy(#[from] ProxyError),

    #[error("failed to filter tunnels: {0}")]
    Policy(#[from] TransportError),

    #[error("downstream route: {0}")]
    Route(#[from] RouteError),

    #[error("persistence: {0}")]
    Persistence(#[from] PersistenceError),
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::AlreadyConnected(_)
            | ServiceError::AuthIdInUse(_)
            | ServiceError::StillConnected(_)
            | ServiceError::NotConnected(_)
            | ServiceError::PortInUse(_) => ErrorKind::Conflict,
            ServiceError::SessionNotFound(_)
            | ServiceError::TunnelNotFound { .. }
            | ServiceError::PortNotAllowed(_)
            | ServiceError::Version(_)
            | ServiceError::Acl(_) => ErrorKind::InvalidInput,
            ServiceError::Port(PortError::NoPortsAvailable) => ErrorKind::ResourceExhausted,
            ServiceError::Port(PortError::InvalidRange(_)) => ErrorKind::InvalidInput,
            ServiceError::Tunnel(e) => match e {
                TunnelError::Acl(_) | TunnelError::UnresolvedLocal(_) => ErrorKind::InvalidInput,
                TunnelError::ActiveConnections(_) | TunnelError::AlreadyStarted => {
                    ErrorKind::Conflict
                }
                _ => ErrorKind::TransportFailure,
            },
            ServiceError::Proxy(e) => match e {
                ProxyError::Config(_) => ErrorKind::InvalidInput,
                ProxyError::BindError { .. } | ProxyError::Io(_) => ErrorKind::TransportFailure,
                _ => ErrorKind::Internal,
            },
            ServiceError::Policy(_) | ServiceError::Route(_) => ErrorKind::TransportFailure,
            ServiceError::Persistence(_) => ErrorKind::Internal,
        }
    }

    pub fn status_code(&self) -> u16 {
        self.kind().status_code()
    }
}
