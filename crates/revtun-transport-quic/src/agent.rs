//! Agent side of the QUIC transport
//!
//! Agents connect, introduce themselves with a hello and then serve the
//! streams the server opens: channel-opens are dialed locally, requests
//! are answered by a callback.

use quinn::{Connection, Endpoint, RecvStream, SendStream};
use revtun_proto::{read_message, write_message, AgentHello, ControlMessage, HelloResponse};
use revtun_transport::dialer::dial;
use revtun_transport::{RequestReply, TransportError, TransportResult};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::QuicConfig;
use crate::connection::QuicChannel;

/// Request handler of a connected agent
pub type RequestHandler = Arc<dyn Fn(&str, &[u8]) -> RequestReply + Send + Sync>;

/// Establishes outgoing agent connections
#[derive(Debug)]
pub struct QuicConnector {
    endpoint: Endpoint,
}

impl QuicConnector {
    pub fn new(config: Arc<QuicConfig>) -> TransportResult<Self> {
        crate::ensure_crypto_provider();
        config.validate()?;

        let client_config = config.build_client_config()?;
        let bind: SocketAddr = SocketAddr::from(([0, 0, 0, 0], 0));
        let mut endpoint = Endpoint::client(bind).map_err(TransportError::IoError)?;
        endpoint.set_default_client_config(client_config);

        debug!("QUIC connector created");
        Ok(Self { endpoint })
    }

    /// Connect and send `hello`; returns the server's verdict
    pub async fn connect(
        &self,
        addr: SocketAddr,
        server_name: &str,
        hello: AgentHello,
    ) -> TransportResult<(AgentConnection, HelloResponse)> {
        debug!("Connecting to QUIC server: {} ({})", server_name, addr);

        let connection = self
            .endpoint
            .connect(addr, server_name)
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        let (mut send, mut recv) = connection
            .open_bi()
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;
        write_message(&mut send, &ControlMessage::Hello(hello)).await?;

        let response = match read_message(&mut recv).await? {
            Some(ControlMessage::HelloResult(response)) => response,
            Some(other) => {
                return Err(TransportError::ProtocolError(format!(
                    "Expected hello result, got {:?}",
                    other
                )))
            }
            None => return Err(TransportError::ConnectionClosed),
        };

        info!("Connected to {} ({})", server_name, addr);
        Ok((AgentConnection { inner: connection }, response))
    }
}

/// An agent's live connection to the server
#[derive(Debug, Clone)]
pub struct AgentConnection {
    inner: Connection,
}

impl AgentConnection {
    /// Serve server-opened streams until the connection ends
    pub async fn serve(&self, on_request: RequestHandler) {
        loop {
            let (send, recv) = match self.inner.accept_bi().await {
                Ok(streams) => streams,
                Err(e) => {
                    debug!("Agent connection ended: {}", e);
                    return;
                }
            };

            let on_request = on_request.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_stream(send, recv, on_request).await {
                    debug!("Agent stream failed: {}", e);
                }
            });
        }
    }

    pub fn close(&self) {
        self.inner.close(0u32.into(), b"agent closed");
    }
}

async fn handle_stream(
    mut send: SendStream,
    mut recv: RecvStream,
    on_request: RequestHandler,
) -> TransportResult<()> {
    match read_message(&mut recv).await? {
        Some(ControlMessage::ChannelOpen { payload, .. }) => {
            let payload = String::from_utf8_lossy(&payload).into_owned();
            match dial(&payload).await {
                Ok(target) => {
                    write_message(&mut send, &ControlMessage::ChannelAccepted).await?;
                    target.relay(QuicChannel::new(send, recv)).await?;
                }
                Err(e) => {
                    warn!("Agent failed to dial {}: {}", payload, e);
                    write_message(
                        &mut send,
                        &ControlMessage::ChannelRejected {
                            reason: e.to_string(),
                        },
                    )
                    .await?;
                    let _ = send.finish();
                }
            }
        }
        Some(ControlMessage::Request { kind, payload }) => {
            let reply = on_request(&kind, &payload);
            write_message(
                &mut send,
                &ControlMessage::Reply {
                    ok: reply.ok,
                    payload: reply.payload,
                },
            )
            .await?;
            let _ = send.finish();
        }
        Some(other) => {
            return Err(TransportError::ProtocolError(format!(
                "Unexpected stream opener: {:?}",
                other
            )))
        }
        None => {}
    }
    Ok(())
}
