use revtun_proto::AclError;
use revtun_transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Failed to bind to {address}:{port}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("tunnel has {0} active connection(s)")]
    ActiveConnections(usize),

    #[error("Tunnel already started")]
    AlreadyStarted,

    #[error("Local address of {0} is not resolved")]
    UnresolvedLocal(String),

    #[error("Invalid ACL: {0}")]
    Acl(#[from] AclError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    Multiple(Vec<TunnelError>),
}

impl TunnelError {
    pub(crate) fn bind(address: &str, port: u16, err: &std::io::Error) -> Self {
        TunnelError::BindError {
            address: address.to_string(),
            port,
            reason: err.to_string(),
        }
    }
}
