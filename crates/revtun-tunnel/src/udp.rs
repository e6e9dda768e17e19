//! UDP data plane
//!
//! All local peers share one channel to the agent; datagrams travel as
//! [`UdpEnvelope`]s carrying the peer address, so replies can be sent back
//! to the right peer.

use crate::clock::SharedClock;
use crate::error::TunnelError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use revtun_proto::{
    is_permitted, AccessList, ForwardingSpec, Protocol, UdpEnvelope, UdpEnvelopeCodec,
    CHANNEL_TYPE, MAX_DATAGRAM_SIZE,
};
use revtun_transport::{AgentTransport, Channel};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::UdpSocket;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

/// Upper bound on a single socket read so cancellation is noticed
pub const READ_DEADLINE: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct UdpTunnel {
    spec: ForwardingSpec,
    acl: Option<AccessList>,
    transport: Arc<dyn AgentTransport>,
    clock: SharedClock,
    token: OnceLock<CancellationToken>,
    local_addr: OnceLock<SocketAddr>,
    tasks: TaskTracker,
    last_active_ms: Arc<AtomicI64>,
}

impl UdpTunnel {
    pub fn new(
        spec: ForwardingSpec,
        acl: Option<AccessList>,
        transport: Arc<dyn AgentTransport>,
        clock: SharedClock,
    ) -> Self {
        let last_active_ms = Arc::new(AtomicI64::new(clock.now().timestamp_millis()));
        Self {
            spec,
            acl,
            transport,
            clock,
            token: OnceLock::new(),
            local_addr: OnceLock::new(),
            tasks: TaskTracker::new(),
            last_active_ms,
        }
    }

    /// Bind the socket, open the shared channel and start both pumps
    pub async fn start(&self, cancel: &CancellationToken) -> Result<(), TunnelError> {
        let (host, port) = match (&self.spec.local_host, self.spec.local_port) {
            (Some(host), Some(port)) => (host.as_str(), port),
            _ => return Err(TunnelError::UnresolvedLocal(self.spec.to_string())),
        };
        if self.token.get().is_some() {
            return Err(TunnelError::AlreadyStarted);
        }

        let socket = UdpSocket::bind((host, port))
            .await
            .map_err(|e| TunnelError::bind(host, port, &e))?;
        let local_addr = socket.local_addr()?;

        let payload = self.spec.channel_payload(Protocol::Udp);
        let channel = self
            .transport
            .open_channel(CHANNEL_TYPE, payload.as_bytes())
            .await?;

        let token = cancel.child_token();
        self.token
            .set(token.clone())
            .map_err(|_| TunnelError::AlreadyStarted)?;
        let _ = self.local_addr.set(local_addr);
        self.last_active_ms
            .store(self.clock.now().timestamp_millis(), Ordering::SeqCst);

        info!(tunnel = %self.spec, %local_addr, "UDP tunnel listening");

        let socket = Arc::new(socket);
        let (reader, writer) = tokio::io::split(channel);

        self.tasks.spawn(inbound(
            socket.clone(),
            FramedWrite::new(writer, UdpEnvelopeCodec),
            self.acl.clone(),
            token.clone(),
            self.clock.clone(),
            self.last_active_ms.clone(),
        ));
        self.tasks.spawn(outbound(
            socket,
            FramedRead::new(reader, UdpEnvelopeCodec),
            token,
            self.clock.clone(),
            self.last_active_ms.clone(),
        ));
        Ok(())
    }

    /// Stop both pumps and close the socket. `force` has no effect on UDP.
    pub async fn terminate(&self, _force: bool) -> Result<(), TunnelError> {
        let Some(token) = self.token.get() else {
            return Ok(());
        };
        token.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        debug!(tunnel = %self.spec, "UDP tunnel terminated");
        Ok(())
    }

    pub fn spec(&self) -> &ForwardingSpec {
        &self.spec
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Time of the last datagram in either direction
    pub fn last_active(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_active_ms.load(Ordering::SeqCst))
            .unwrap_or_default()
    }
}

/// Local socket -> agent
async fn inbound(
    socket: Arc<UdpSocket>,
    mut sink: FramedWrite<WriteHalf<Channel>, UdpEnvelopeCodec>,
    acl: Option<AccessList>,
    token: CancellationToken,
    clock: SharedClock,
    last_active_ms: Arc<AtomicI64>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let received = tokio::select! {
            _ = token.cancelled() => break,
            received = tokio::time::timeout(READ_DEADLINE, socket.recv_from(&mut buf)) => received,
        };

        let (n, source) = match received {
            Err(_deadline) => continue,
            Ok(Ok(received)) => received,
            Ok(Err(e)) => {
                error!("UDP tunnel read failed: {}", e);
                break;
            }
        };

        if !is_permitted(acl.as_ref(), &source) {
            debug!(peer = %source, "Datagram rejected by ACL");
            continue;
        }

        last_active_ms.store(clock.now().timestamp_millis(), Ordering::SeqCst);
        let envelope = UdpEnvelope {
            source,
            payload: Bytes::copy_from_slice(&buf[..n]),
        };
        if let Err(e) = sink.send(envelope).await {
            debug!("UDP channel write failed: {}", e);
            break;
        }
    }

    let _ = sink.close().await;
    // the outbound side has nothing left to deliver to
    token.cancel();
}

/// Agent -> local socket
async fn outbound(
    socket: Arc<UdpSocket>,
    mut frames: FramedRead<ReadHalf<Channel>, UdpEnvelopeCodec>,
    token: CancellationToken,
    clock: SharedClock,
    last_active_ms: Arc<AtomicI64>,
) {
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = frames.next() => next,
        };

        match next {
            Some(Ok(envelope)) => {
                last_active_ms.store(clock.now().timestamp_millis(), Ordering::SeqCst);
                if let Err(e) = socket.send_to(&envelope.payload, envelope.source).await {
                    debug!(peer = %envelope.source, "UDP reply failed: {}", e);
                }
            }
            Some(Err(e)) => {
                error!("Malformed datagram envelope: {}", e);
                break;
            }
            None => {
                debug!("UDP channel closed by agent");
                break;
            }
        }
    }
    token.cancel();
}
