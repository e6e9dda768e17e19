//! A tunnel over one or both protocols

use crate::clock::SharedClock;
use crate::error::TunnelError;
use crate::tcp::TcpTunnel;
use crate::udp::UdpTunnel;
use chrono::{DateTime, Utc};
use revtun_proto::{AccessList, ForwardingSpec};
use revtun_transport::AgentTransport;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug)]
pub enum DataPlane {
    Tcp(TcpTunnel),
    Udp(UdpTunnel),
}

impl DataPlane {
    async fn start(&self, cancel: &CancellationToken) -> Result<(), TunnelError> {
        match self {
            DataPlane::Tcp(tunnel) => tunnel.start(cancel).await,
            DataPlane::Udp(tunnel) => tunnel.start(cancel).await,
        }
    }

    async fn terminate(&self, force: bool) -> Result<(), TunnelError> {
        match self {
            DataPlane::Tcp(tunnel) => tunnel.terminate(force).await,
            DataPlane::Udp(tunnel) => tunnel.terminate(force).await,
        }
    }

    fn last_active(&self) -> DateTime<Utc> {
        match self {
            DataPlane::Tcp(tunnel) => tunnel.last_active(),
            DataPlane::Udp(tunnel) => tunnel.last_active(),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            DataPlane::Tcp(tunnel) => tunnel.local_addr(),
            DataPlane::Udp(tunnel) => tunnel.local_addr(),
        }
    }
}

/// Data planes of one forwarding spec; `tcp+udp` runs both
#[derive(Debug)]
pub struct Tunnel {
    spec: ForwardingSpec,
    planes: Vec<DataPlane>,
}

impl Tunnel {
    /// Build the data planes for `spec`. Fails on a malformed ACL.
    pub fn new(
        spec: ForwardingSpec,
        transport: Arc<dyn AgentTransport>,
        clock: SharedClock,
    ) -> Result<Self, TunnelError> {
        let acl = match &spec.acl {
            Some(acl) => AccessList::parse(acl)?,
            None => None,
        };

        let mut planes = Vec::with_capacity(2);
        if spec.protocol.includes_tcp() {
            planes.push(DataPlane::Tcp(TcpTunnel::new(
                spec.clone(),
                acl.clone(),
                transport.clone(),
                clock.clone(),
            )));
        }
        if spec.protocol.includes_udp() {
            planes.push(DataPlane::Udp(UdpTunnel::new(
                spec.clone(),
                acl,
                transport,
                clock,
            )));
        }

        Ok(Self { spec, planes })
    }

    /// Start every plane; if one fails the ones already running are stopped.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<(), TunnelError> {
        for (started, plane) in self.planes.iter().enumerate() {
            if let Err(e) = plane.start(cancel).await {
                for running in &self.planes[..started] {
                    if let Err(stop_err) = running.terminate(true).await {
                        warn!(tunnel = %self.spec, "Failed to stop partially started tunnel: {}", stop_err);
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Terminate every plane, collecting all errors
    pub async fn terminate(&self, force: bool) -> Result<(), TunnelError> {
        let mut errors = Vec::new();
        for plane in &self.planes {
            if let Err(e) = plane.terminate(force).await {
                errors.push(e);
            }
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(TunnelError::Multiple(errors)),
        }
    }

    pub fn spec(&self) -> &ForwardingSpec {
        &self.spec
    }

    pub fn planes(&self) -> &[DataPlane] {
        &self.planes
    }

    /// Latest activity over all planes
    pub fn last_active(&self) -> DateTime<Utc> {
        self.planes
            .iter()
            .map(DataPlane::last_active)
            .max()
            .unwrap_or_default()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.planes.iter().find_map(DataPlane::local_addr)
    }
}
