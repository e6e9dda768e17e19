//! In-process transport
//!
//! [`memory_pair`] returns a server-side [`MemoryTransport`] and the matching
//! agent-side [`MemoryAgent`]. Channels are backed by `tokio::io::duplex`.

use crate::{AgentTransport, Channel, RequestReply, TransportError, TransportResult};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const CHANNEL_BUFFER: usize = 64 * 1024;

/// Something the server asked the agent to do
#[derive(Debug)]
pub enum AgentEvent {
    Channel(IncomingChannel),
    Request(IncomingRequest),
}

/// Channel-open request as seen by the agent
#[derive(Debug)]
pub struct IncomingChannel {
    pub channel_type: String,
    pub payload: Vec<u8>,
    stream: DuplexStream,
    respond: oneshot::Sender<Result<(), String>>,
}

impl IncomingChannel {
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    pub fn accept(self) -> DuplexStream {
        let _ = self.respond.send(Ok(()));
        self.stream
    }

    pub fn reject(self, reason: &str) {
        let _ = self.respond.send(Err(reason.to_string()));
    }
}

/// Out-of-band request as seen by the agent
#[derive(Debug)]
pub struct IncomingRequest {
    pub kind: String,
    pub payload: Vec<u8>,
    respond: oneshot::Sender<RequestReply>,
}

impl IncomingRequest {
    pub fn reply(self, reply: RequestReply) {
        let _ = self.respond.send(reply);
    }
}

/// Server half of an in-process connection
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    connection_id: String,
    remote: SocketAddr,
    events: mpsc::Sender<AgentEvent>,
    closed: CancellationToken,
}

/// Agent half of an in-process connection
#[derive(Debug)]
pub struct MemoryAgent {
    events: mpsc::Receiver<AgentEvent>,
    closed: CancellationToken,
}

/// Create a connected server/agent pair. `remote` is reported as the agent address.
pub fn memory_pair(remote: SocketAddr) -> (MemoryTransport, MemoryAgent) {
    let (tx, rx) = mpsc::channel(64);
    let closed = CancellationToken::new();

    let transport = MemoryTransport {
        connection_id: format!("memory-{}", uuid::Uuid::new_v4()),
        remote,
        events: tx,
        closed: closed.clone(),
    };
    let agent = MemoryAgent { events: rx, closed };
    (transport, agent)
}

impl MemoryAgent {
    /// Next request from the server, or `None` once the connection is closed
    pub async fn next_event(&mut self) -> Option<AgentEvent> {
        tokio::select! {
            _ = self.closed.cancelled() => None,
            event = self.events.recv() => event,
        }
    }

    /// Close the connection from the agent side
    pub fn disconnect(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Drop for MemoryAgent {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

#[async_trait]
impl AgentTransport for MemoryTransport {
    async fn open_channel(&self, channel_type: &str, payload: &[u8]) -> TransportResult<Channel> {
        if self.closed.is_cancelled() {
            return Err(TransportError::ConnectionClosed);
        }

        let (server_end, agent_end) = tokio::io::duplex(CHANNEL_BUFFER);
        let (respond, response) = oneshot::channel();
        let event = AgentEvent::Channel(IncomingChannel {
            channel_type: channel_type.to_string(),
            payload: payload.to_vec(),
            stream: agent_end,
            respond,
        });

        self.events
            .send(event)
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;

        let answer = tokio::select! {
            _ = self.closed.cancelled() => return Err(TransportError::ConnectionClosed),
            answer = response => answer.map_err(|_| TransportError::ConnectionClosed)?,
        };

        match answer {
            Ok(()) => Ok(Box::new(server_end)),
            Err(reason) => Err(TransportError::ChannelRejected(reason)),
        }
    }

    async fn request(&self, kind: &str, payload: &[u8]) -> TransportResult<RequestReply> {
        if self.closed.is_cancelled() {
            return Err(TransportError::ConnectionClosed);
        }

        let (respond, response) = oneshot::channel();
        self.events
            .send(AgentEvent::Request(IncomingRequest {
                kind: kind.to_string(),
                payload: payload.to_vec(),
                respond,
            }))
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;

        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::ConnectionClosed),
            reply = response => reply.map_err(|_| TransportError::ConnectionClosed),
        }
    }

    async fn close(&self, reason: &str) {
        debug!(connection_id = %self.connection_id, reason, "Closing in-memory transport");
        self.closed.cancel();
    }

    async fn closed(&self) {
        self.closed.cancelled().await;
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn remote_address(&self) -> SocketAddr {
        self.remote
    }

    fn connection_id(&self) -> String {
        self.connection_id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pair() -> (MemoryTransport, MemoryAgent) {
        memory_pair("192.0.2.10:50000".parse().unwrap())
    }

    #[tokio::test]
    async fn test_open_channel_accepted() {
        let (transport, mut agent) = pair();

        let agent_task = tokio::spawn(async move {
            match agent.next_event().await {
                Some(AgentEvent::Channel(ch)) => {
                    assert_eq!(ch.channel_type, "revtun");
                    assert_eq!(ch.payload_str(), "127.0.0.1:22");
                    let mut stream = ch.accept();
                    let mut buf = [0u8; 4];
                    stream.read_exact(&mut buf).await.unwrap();
                    stream.write_all(&buf).await.unwrap();
                }
                other => panic!("unexpected event: {:?}", other),
            }
        });

        let mut channel = transport.open_channel("revtun", b"127.0.0.1:22").await.unwrap();
        channel.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        channel.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        agent_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_open_channel_rejected() {
        let (transport, mut agent) = pair();

        tokio::spawn(async move {
            if let Some(AgentEvent::Channel(ch)) = agent.next_event().await {
                ch.reject("connection refused");
            }
            // keep the agent alive until the server observed the rejection
            let _ = agent.next_event().await;
        });

        let Err(err) = transport.open_channel("revtun", b"x").await else {
            panic!("expected channel rejection");
        };
        assert!(matches!(err, TransportError::ChannelRejected(reason) if reason == "connection refused"));
    }

    #[tokio::test]
    async fn test_request_reply() {
        let (transport, mut agent) = pair();

        tokio::spawn(async move {
            if let Some(AgentEvent::Request(req)) = agent.next_event().await {
                assert_eq!(req.kind, "tunnel_allowed");
                req.reply(RequestReply::ok(b"{\"is_allowed\":true}".to_vec()));
            }
            let _ = agent.next_event().await;
        });

        let reply = transport.request("tunnel_allowed", b"127.0.0.1:22").await.unwrap();
        assert!(reply.ok);
    }

    #[tokio::test]
    async fn test_closed_transport_fails_fast() {
        let (transport, agent) = pair();
        drop(agent);

        assert!(transport.is_closed());
        transport.closed().await;
        assert!(matches!(
            transport.open_channel("revtun", b"x").await,
            Err(TransportError::ConnectionClosed)
        ));
    }
}
