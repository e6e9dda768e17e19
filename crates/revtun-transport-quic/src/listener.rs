//! QUIC listener for agent connections

use quinn::Endpoint;
use revtun_transport::{TransportError, TransportResult};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::config::QuicConfig;
use crate::connection::QuicConnection;

/// Accepts incoming agent connections
#[derive(Debug)]
pub struct QuicListener {
    endpoint: Endpoint,
}

impl QuicListener {
    pub fn new(bind_addr: SocketAddr, config: Arc<QuicConfig>) -> TransportResult<Self> {
        crate::ensure_crypto_provider();
        config.validate()?;

        let server_config = config.build_server_config()?;
        let endpoint =
            Endpoint::server(server_config, bind_addr).map_err(TransportError::IoError)?;

        let local_addr = endpoint.local_addr().map_err(TransportError::IoError)?;
        info!("QUIC listener bound to {}", local_addr);

        Ok(Self { endpoint })
    }

    /// Next established connection. Failed handshakes are logged and skipped.
    pub async fn accept(&self) -> TransportResult<QuicConnection> {
        loop {
            let Some(incoming) = self.endpoint.accept().await else {
                return Err(TransportError::ConnectionError(
                    "QUIC endpoint closed".to_string(),
                ));
            };

            let remote = incoming.remote_address();
            debug!("Incoming QUIC connection from {}", remote);

            match incoming.await {
                Ok(connection) => {
                    info!("QUIC connection established from {}", remote);
                    return Ok(QuicConnection::new(connection));
                }
                Err(e) => {
                    error!("Failed to establish QUIC connection from {}: {}", remote, e);
                    continue;
                }
            }
        }
    }

    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.endpoint.local_addr().map_err(TransportError::IoError)
    }

    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"Listener closed");
        info!("QUIC listener closed");
    }
}
