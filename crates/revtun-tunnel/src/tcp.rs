//! TCP data plane
//!
//! One listener per tunnel. Every accepted connection gets its own channel
//! to the agent and two copy directions; all tasks live in the tunnel's
//! [`TaskTracker`] so `terminate` can wait for them.

use crate::clock::SharedClock;
use crate::error::TunnelError;
use chrono::{DateTime, Utc};
use revtun_proto::{is_permitted, AccessList, ForwardingSpec, CHANNEL_TYPE};
use revtun_transport::AgentTransport;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

/// Pause before accepting again after an accept error
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct TcpStats {
    active: AtomicUsize,
    accepted: AtomicU64,
    bytes_to_agent: AtomicU64,
    bytes_from_agent: AtomicU64,
    last_active_ms: AtomicI64,
}

impl TcpStats {
    fn touch(&self, at: DateTime<Utc>) {
        self.last_active_ms
            .store(at.timestamp_millis(), Ordering::SeqCst);
    }
}

/// Decrements the active counter however the connection task ends
struct ActiveGuard<'a> {
    stats: &'a TcpStats,
    clock: &'a SharedClock,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.stats.touch(self.clock.now());
        self.stats.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Local side of a relayed connection. Reads go to the agent, writes come
/// from it; both are counted as they happen.
struct Counted<'a, S> {
    inner: S,
    stats: &'a TcpStats,
}

impl<S: AsyncRead + Unpin> AsyncRead for Counted<'_, S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let this = &mut *self;
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let read = (buf.filled().len() - before) as u64;
            this.stats.bytes_to_agent.fetch_add(read, Ordering::SeqCst);
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Counted<'_, S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(written)) = &poll {
            this.stats
                .bytes_from_agent
                .fetch_add(*written as u64, Ordering::SeqCst);
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[derive(Debug)]
pub struct TcpTunnel {
    spec: ForwardingSpec,
    acl: Option<AccessList>,
    transport: Arc<dyn AgentTransport>,
    clock: SharedClock,
    token: OnceLock<CancellationToken>,
    local_addr: OnceLock<SocketAddr>,
    tasks: TaskTracker,
    stats: Arc<TcpStats>,
}

impl TcpTunnel {
    pub fn new(
        spec: ForwardingSpec,
        acl: Option<AccessList>,
        transport: Arc<dyn AgentTransport>,
        clock: SharedClock,
    ) -> Self {
        let stats = TcpStats::default();
        stats.touch(clock.now());
        Self {
            spec,
            acl,
            transport,
            clock,
            token: OnceLock::new(),
            local_addr: OnceLock::new(),
            tasks: TaskTracker::new(),
            stats: Arc::new(stats),
        }
    }

    /// Bind the listener and start accepting. Bind errors are returned as is.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<(), TunnelError> {
        let (host, port) = match (&self.spec.local_host, self.spec.local_port) {
            (Some(host), Some(port)) => (host.as_str(), port),
            _ => return Err(TunnelError::UnresolvedLocal(self.spec.to_string())),
        };

        if self.token.get().is_some() {
            return Err(TunnelError::AlreadyStarted);
        }

        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|e| TunnelError::bind(host, port, &e))?;
        let local_addr = listener.local_addr()?;

        let token = cancel.child_token();
        self.token
            .set(token.clone())
            .map_err(|_| TunnelError::AlreadyStarted)?;
        let _ = self.local_addr.set(local_addr);
        self.stats.touch(self.clock.now());

        info!(tunnel = %self.spec, %local_addr, "TCP tunnel listening");

        let accept = AcceptLoop {
            listener,
            token,
            tasks: self.tasks.clone(),
            acl: self.acl.clone(),
            transport: self.transport.clone(),
            clock: self.clock.clone(),
            stats: self.stats.clone(),
            payload: self.spec.remote(),
        };
        self.tasks.spawn(accept.run());
        Ok(())
    }

    /// Stop accepting and wait for every connection task.
    ///
    /// Without `force` a tunnel with open connections is left running.
    pub async fn terminate(&self, force: bool) -> Result<(), TunnelError> {
        let Some(token) = self.token.get() else {
            return Ok(());
        };

        let active = self.active_connections();
        if !force && active > 0 && !token.is_cancelled() {
            return Err(TunnelError::ActiveConnections(active));
        }

        token.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        debug!(tunnel = %self.spec, "TCP tunnel terminated");
        Ok(())
    }

    pub fn spec(&self) -> &ForwardingSpec {
        &self.spec
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub fn active_connections(&self) -> usize {
        self.stats.active.load(Ordering::SeqCst)
    }

    pub fn accepted_connections(&self) -> u64 {
        self.stats.accepted.load(Ordering::SeqCst)
    }

    /// Bytes sent to and received from the agent, over closed connections
    pub fn bytes_transferred(&self) -> (u64, u64) {
        (
            self.stats.bytes_to_agent.load(Ordering::SeqCst),
            self.stats.bytes_from_agent.load(Ordering::SeqCst),
        )
    }

    /// Now while a connection is open, otherwise the last close (or start)
    pub fn last_active(&self) -> DateTime<Utc> {
        if self.active_connections() > 0 {
            return self.clock.now();
        }
        DateTime::from_timestamp_millis(self.stats.last_active_ms.load(Ordering::SeqCst))
            .unwrap_or_default()
    }
}

struct AcceptLoop {
    listener: TcpListener,
    token: CancellationToken,
    tasks: TaskTracker,
    acl: Option<AccessList>,
    transport: Arc<dyn AgentTransport>,
    clock: SharedClock,
    stats: Arc<TcpStats>,
    payload: String,
}

impl AcceptLoop {
    async fn run(self) {
        loop {
            let accepted = tokio::select! {
                _ = self.token.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    if !is_permitted(self.acl.as_ref(), &peer) {
                        debug!(%peer, payload = %self.payload, "Connection rejected by ACL");
                        continue;
                    }

                    self.stats.accepted.fetch_add(1, Ordering::SeqCst);
                    self.stats.active.fetch_add(1, Ordering::SeqCst);
                    self.tasks.spawn(handle_connection(
                        stream,
                        peer,
                        self.payload.clone(),
                        self.transport.clone(),
                        self.token.clone(),
                        self.clock.clone(),
                        self.stats.clone(),
                    ));
                }
                Err(e) => {
                    if self.token.is_cancelled() {
                        break;
                    }
                    error!("Failed to accept TCP connection: {}", e);
                    tokio::select! {
                        _ = self.token.cancelled() => break,
                        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                    }
                }
            }
        }
        debug!(payload = %self.payload, "Accept loop stopped");
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    payload: String,
    transport: Arc<dyn AgentTransport>,
    token: CancellationToken,
    clock: SharedClock,
    stats: Arc<TcpStats>,
) {
    let _guard = ActiveGuard {
        stats: &stats,
        clock: &clock,
    };
    debug!(%peer, %payload, "New tunnel connection");

    let opened = tokio::select! {
        _ = token.cancelled() => return,
        opened = transport.open_channel(CHANNEL_TYPE, payload.as_bytes()) => opened,
    };
    let mut channel = match opened {
        Ok(channel) => channel,
        Err(e) => {
            error!(%peer, %payload, "Failed to open channel: {}", e);
            return;
        }
    };

    let mut local = Counted {
        inner: stream,
        stats: &stats,
    };
    tokio::select! {
        _ = token.cancelled() => {
            debug!(%peer, "Connection closed by tunnel shutdown");
        }
        copied = tokio::io::copy_bidirectional(&mut local, &mut channel) => match copied {
            Ok((to_agent, from_agent)) => {
                debug!(%peer, to_agent, from_agent, "Tunnel connection closed");
            }
            Err(e) => debug!(%peer, "Tunnel connection ended: {}", e),
        }
    }
}
