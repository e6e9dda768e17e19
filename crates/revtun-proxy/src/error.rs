use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid tunnel proxy config: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Failed to bind tunnel proxy to {address}:{port}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("tunnel proxy already started")]
    AlreadyStarted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        ProxyError::Config(msg.into())
    }
}
