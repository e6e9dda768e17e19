//! Agent-side channel handling
//!
//! The agent answers a channel-open by dialing the address in the payload.
//! TCP channels become a plain byte relay; UDP channels (payload suffixed
//! with `/udp`) carry [`UdpEnvelope`] frames, and every distinct source gets
//! its own socket towards the target so replies can be routed back.

use crate::memory::{AgentEvent, MemoryAgent};
use crate::RequestReply;
use futures::{SinkExt, StreamExt};
use revtun_proto::{UdpEnvelope, UdpEnvelopeCodec, MAX_DATAGRAM_SIZE, UDP_CHANNEL_SUFFIX, UNKNOWN_REQUEST};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

/// Target reached for a channel, ready to relay
#[derive(Debug)]
pub enum DialedTarget {
    Tcp(TcpStream),
    Udp(String),
}

/// Dial the address named in a channel payload
pub async fn dial(payload: &str) -> io::Result<DialedTarget> {
    if let Some(target) = payload.strip_suffix(UDP_CHANNEL_SUFFIX) {
        // resolve now so a bad target rejects the channel
        tokio::net::lookup_host(target)
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, target.to_string()))?;
        return Ok(DialedTarget::Udp(target.to_string()));
    }
    Ok(DialedTarget::Tcp(TcpStream::connect(payload).await?))
}

impl DialedTarget {
    /// Relay between the channel and the dialed target until either side ends
    pub async fn relay<S>(self, mut channel: S) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        match self {
            DialedTarget::Tcp(mut target) => {
                let (up, down) = tokio::io::copy_bidirectional(&mut channel, &mut target).await?;
                debug!(bytes_up = up, bytes_down = down, "Agent channel closed");
                Ok(())
            }
            DialedTarget::Udp(target) => relay_udp(&target, channel).await,
        }
    }
}

async fn relay_udp<S>(target: &str, channel: S) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, write_half) = tokio::io::split(channel);
    let mut envelopes = FramedRead::new(read_half, UdpEnvelopeCodec);
    let writer = Arc::new(Mutex::new(FramedWrite::new(write_half, UdpEnvelopeCodec)));

    let mut sockets: HashMap<SocketAddr, Arc<UdpSocket>> = HashMap::new();
    let mut readers = JoinSet::new();

    while let Some(envelope) = envelopes.next().await {
        let envelope = envelope.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let socket = match sockets.get(&envelope.source) {
            Some(socket) => socket.clone(),
            None => {
                let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
                socket.connect(target).await?;
                sockets.insert(envelope.source, socket.clone());

                let source = envelope.source;
                let reader = socket.clone();
                let writer = writer.clone();
                readers.spawn(async move {
                    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
                    loop {
                        let n = match reader.recv(&mut buf).await {
                            Ok(n) => n,
                            Err(e) => {
                                debug!("UDP target read ended: {}", e);
                                break;
                            }
                        };
                        let reply = UdpEnvelope {
                            source,
                            payload: bytes::Bytes::copy_from_slice(&buf[..n]),
                        };
                        if writer.lock().await.send(reply).await.is_err() {
                            break;
                        }
                    }
                });
                socket
            }
        };

        socket.send(&envelope.payload).await?;
    }

    readers.shutdown().await;
    Ok(())
}

/// Run a [`MemoryAgent`] that dials every channel it is asked to open.
///
/// Requests go to `on_request`; use [`unknown_request`] for an agent
/// without policy support.
pub fn spawn_memory_dialer<F>(mut agent: MemoryAgent, on_request: F) -> JoinHandle<()>
where
    F: Fn(&str, &[u8]) -> RequestReply + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(event) = agent.next_event().await {
            match event {
                AgentEvent::Channel(channel) => {
                    let payload = channel.payload_str();
                    match dial(&payload).await {
                        Ok(target) => {
                            let stream = channel.accept();
                            tokio::spawn(async move {
                                if let Err(e) = target.relay(stream).await {
                                    debug!("Relay for {} ended: {}", payload, e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("Agent failed to dial {}: {}", payload, e);
                            channel.reject(&e.to_string());
                        }
                    }
                }
                AgentEvent::Request(request) => {
                    let reply = on_request(&request.kind, &request.payload);
                    request.reply(reply);
                }
            }
        }
    })
}

/// Request handler of an agent that knows no request kinds
pub fn unknown_request(_kind: &str, _payload: &[u8]) -> RequestReply {
    RequestReply::error(UNKNOWN_REQUEST)
}
