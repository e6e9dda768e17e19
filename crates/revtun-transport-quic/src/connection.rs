//! Server side of an agent connection

use async_trait::async_trait;
use quinn::{Connection, RecvStream, SendStream};
use revtun_proto::{read_message, write_message, AgentHello, ControlMessage, HelloResponse};
use revtun_transport::{AgentTransport, Channel, RequestReply, TransportError, TransportResult};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, trace};

/// How long the agent has to answer a channel-open (it dials first)
pub const CHANNEL_OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a new connection may take to introduce itself
pub const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// A bidirectional QUIC stream used as a byte channel
#[derive(Debug)]
pub struct QuicChannel {
    send: SendStream,
    recv: RecvStream,
}

impl QuicChannel {
    pub fn new(send: SendStream, recv: RecvStream) -> Self {
        Self { send, recv }
    }
}

impl AsyncRead for QuicChannel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        AsyncRead::poll_read(Pin::new(&mut self.recv), cx, buf)
    }
}

impl AsyncWrite for QuicChannel {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.send), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.send), cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.send), cx)
    }
}

/// Sends the answer to an agent's hello
#[derive(Debug)]
pub struct HelloReplier {
    send: SendStream,
}

impl HelloReplier {
    pub async fn respond(mut self, response: HelloResponse) -> TransportResult<()> {
        write_message(&mut self.send, &ControlMessage::HelloResult(response)).await?;
        let _ = self.send.finish();
        Ok(())
    }
}

/// QUIC connection to one agent, as seen by the server
#[derive(Debug, Clone)]
pub struct QuicConnection {
    inner: Connection,
    connection_id: String,
}

impl QuicConnection {
    pub fn new(connection: Connection) -> Self {
        let connection_id = format!("quic-{}", connection.stable_id());
        Self {
            inner: connection,
            connection_id,
        }
    }

    /// Get the underlying quinn connection
    pub fn inner(&self) -> &Connection {
        &self.inner
    }

    /// Wait for the agent's hello on the first stream it opens
    pub async fn accept_hello(&self) -> TransportResult<(AgentHello, HelloReplier)> {
        tokio::time::timeout(HELLO_TIMEOUT, self.read_hello())
            .await
            .map_err(|_| TransportError::Timeout)?
    }

    async fn read_hello(&self) -> TransportResult<(AgentHello, HelloReplier)> {
        let (send, mut recv) = self
            .inner
            .accept_bi()
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        match read_message(&mut recv).await? {
            Some(ControlMessage::Hello(hello)) => Ok((hello, HelloReplier { send })),
            Some(other) => Err(TransportError::ProtocolError(format!(
                "Expected hello, got {:?}",
                other
            ))),
            None => Err(TransportError::ConnectionClosed),
        }
    }

    async fn open_stream(&self) -> TransportResult<(SendStream, RecvStream)> {
        let (send, recv) = self.inner.open_bi().await.map_err(|e| match e {
            quinn::ConnectionError::LocallyClosed
            | quinn::ConnectionError::ApplicationClosed(_)
            | quinn::ConnectionError::ConnectionClosed(_) => TransportError::ConnectionClosed,
            other => TransportError::ConnectionError(other.to_string()),
        })?;
        trace!("Opened bidirectional stream: {}", send.id().index());
        Ok((send, recv))
    }
}

#[async_trait]
impl AgentTransport for QuicConnection {
    async fn open_channel(&self, channel_type: &str, payload: &[u8]) -> TransportResult<Channel> {
        let (mut send, mut recv) = self.open_stream().await?;

        write_message(
            &mut send,
            &ControlMessage::ChannelOpen {
                channel_type: channel_type.to_string(),
                payload: payload.to_vec(),
            },
        )
        .await?;

        let answer = tokio::time::timeout(CHANNEL_OPEN_TIMEOUT, read_message(&mut recv))
            .await
            .map_err(|_| TransportError::Timeout)??;

        match answer {
            Some(ControlMessage::ChannelAccepted) => Ok(Box::new(QuicChannel::new(send, recv))),
            Some(ControlMessage::ChannelRejected { reason }) => {
                Err(TransportError::ChannelRejected(reason))
            }
            Some(other) => Err(TransportError::ProtocolError(format!(
                "Unexpected channel answer: {:?}",
                other
            ))),
            None => Err(TransportError::ConnectionClosed),
        }
    }

    async fn request(&self, kind: &str, payload: &[u8]) -> TransportResult<RequestReply> {
        let (mut send, mut recv) = self.open_stream().await?;

        write_message(
            &mut send,
            &ControlMessage::Request {
                kind: kind.to_string(),
                payload: payload.to_vec(),
            },
        )
        .await?;
        let _ = send.finish();

        match read_message(&mut recv).await? {
            Some(ControlMessage::Reply { ok, payload }) => Ok(RequestReply { ok, payload }),
            Some(other) => Err(TransportError::ProtocolError(format!(
                "Unexpected reply: {:?}",
                other
            ))),
            None => Err(TransportError::RequestFailed(
                "stream closed before reply".to_string(),
            )),
        }
    }

    async fn close(&self, reason: &str) {
        self.inner.close(quinn::VarInt::from_u32(0), reason.as_bytes());
        debug!("QUIC connection {} closed: {}", self.connection_id, reason);
    }

    async fn closed(&self) {
        let reason = self.inner.closed().await;
        debug!("QUIC connection {} ended: {}", self.connection_id, reason);
    }

    fn is_closed(&self) -> bool {
        self.inner.close_reason().is_some()
    }

    fn remote_address(&self) -> SocketAddr {
        self.inner.remote_address()
    }

    fn connection_id(&self) -> String {
        self.connection_id.clone()
    }
}
