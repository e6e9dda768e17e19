//! QUIC transport for agent connections, built on quinn
//!
//! The server accepts agents with [`QuicListener`]; every accepted
//! [`QuicConnection`] starts with a hello exchange and afterwards implements
//! [`revtun_transport::AgentTransport`], one bidirectional stream per channel
//! or request. Agents use [`QuicConnector`].

// Initialize rustls crypto provider once globally
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

pub(crate) fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

pub mod agent;
pub mod config;
pub mod connection;
pub mod listener;

pub use agent::{AgentConnection, QuicConnector, RequestHandler};
pub use config::{QuicConfig, ServerIdentity, ALPN_REVTUN};
pub use connection::{HelloReplier, QuicChannel, QuicConnection};
pub use listener::QuicListener;
