//! Local port allocation
//!
//! The allocator owns the configured allow-list. [`PortAllocator::refresh`]
//! asks a [`PortProbe`] which of those ports the host currently uses; the
//! remainder is the free pool random ports are drawn from.

use rand::seq::IteratorRandom;
use revtun_proto::Protocol;
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("no ports available")]
    NoPortsAvailable,

    #[error("invalid port range: {0}")]
    InvalidRange(String),
}

/// Reports which ports are in use on the host
pub trait PortProbe: Send + Sync + Debug {
    fn busy_ports(&self, protocol: Protocol, candidates: &BTreeSet<u16>) -> BTreeSet<u16>;
}

/// Probes by binding each candidate on `0.0.0.0`
#[derive(Debug, Default, Clone, Copy)]
pub struct BindProbe;

impl PortProbe for BindProbe {
    fn busy_ports(&self, protocol: Protocol, candidates: &BTreeSet<u16>) -> BTreeSet<u16> {
        candidates
            .iter()
            .copied()
            .filter(|&port| match protocol {
                Protocol::Udp => std::net::UdpSocket::bind(("0.0.0.0", port)).is_err(),
                _ => std::net::TcpListener::bind(("0.0.0.0", port)).is_err(),
            })
            .collect()
    }
}

#[derive(Debug, Default)]
struct BusyPorts {
    tcp: BTreeSet<u16>,
    udp: BTreeSet<u16>,
}

impl BusyPorts {
    fn is_busy(&self, protocol: Protocol, port: u16) -> bool {
        (protocol.includes_tcp() && self.tcp.contains(&port))
            || (protocol.includes_udp() && self.udp.contains(&port))
    }

    fn mark(&mut self, protocol: Protocol, port: u16) {
        if protocol.includes_tcp() {
            self.tcp.insert(port);
        }
        if protocol.includes_udp() {
            self.udp.insert(port);
        }
    }
}

#[derive(Debug)]
pub struct PortAllocator {
    allowed: BTreeSet<u16>,
    probe: Arc<dyn PortProbe>,
    busy: Mutex<BusyPorts>,
}

impl PortAllocator {
    pub fn new(allowed: BTreeSet<u16>) -> Self {
        Self::with_probe(allowed, Arc::new(BindProbe))
    }

    pub fn with_probe(allowed: BTreeSet<u16>, probe: Arc<dyn PortProbe>) -> Self {
        Self {
            allowed,
            probe,
            busy: Mutex::new(BusyPorts::default()),
        }
    }

    /// Allow-list from range strings such as `"20000-30000"` or `"8080"`
    pub fn from_ranges<S: AsRef<str>>(allowed: &[S], excluded: &[S]) -> Result<Self, PortError> {
        let allowed = parse_port_ranges(allowed)?;
        let excluded = parse_port_ranges(excluded)?;
        Ok(Self::new(allowed.difference(&excluded).copied().collect()))
    }

    fn busy(&self) -> MutexGuard<'_, BusyPorts> {
        self.busy.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Re-read host port usage. Call before each batch of allocations.
    pub fn refresh(&self) {
        let tcp = self.probe.busy_ports(Protocol::Tcp, &self.allowed);
        let udp = self.probe.busy_ports(Protocol::Udp, &self.allowed);
        debug!(
            allowed = self.allowed.len(),
            tcp_busy = tcp.len(),
            udp_busy = udp.len(),
            "Refreshed port usage"
        );
        *self.busy() = BusyPorts { tcp, udp };
    }

    /// Take an arbitrary free port for `protocol`
    pub fn get_random_port(&self, protocol: Protocol) -> Result<u16, PortError> {
        let mut busy = self.busy();
        let port = self
            .allowed
            .iter()
            .copied()
            .filter(|&port| !busy.is_busy(protocol, port))
            .choose(&mut rand::thread_rng())
            .ok_or(PortError::NoPortsAvailable)?;
        busy.mark(protocol, port);
        Ok(port)
    }

    pub fn is_port_allowed(&self, port: u16) -> bool {
        self.allowed.contains(&port)
    }

    /// For `tcp+udp` the port counts as busy if either protocol is taken.
    pub fn is_port_busy(&self, protocol: Protocol, port: u16) -> bool {
        self.busy().is_busy(protocol, port)
    }

    pub fn allowed_ports(&self) -> &BTreeSet<u16> {
        &self.allowed
    }

    pub fn free_count(&self, protocol: Protocol) -> usize {
        let busy = self.busy();
        self.allowed
            .iter()
            .filter(|&&port| !busy.is_busy(protocol, port))
            .count()
    }
}

/// Parse a list of `"N"` / `"A-B"` entries; entries may also be comma separated.
pub fn parse_port_ranges<S: AsRef<str>>(ranges: &[S]) -> Result<BTreeSet<u16>, PortError> {
    let mut ports = BTreeSet::new();
    for entry in ranges {
        for part in entry.as_ref().split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let invalid = || PortError::InvalidRange(part.to_string());
            let parse = |s: &str| -> Result<u16, PortError> {
                match s.trim().parse::<u16>() {
                    Ok(0) | Err(_) => Err(invalid()),
                    Ok(port) => Ok(port),
                }
            };

            match part.split_once('-') {
                Some((start, end)) => {
                    let (start, end) = (parse(start)?, parse(end)?);
                    if start > end {
                        return Err(invalid());
                    }
                    ports.extend(start..=end);
                }
                None => {
                    ports.insert(parse(part)?);
                }
            }
        }
    }
    Ok(ports)
}
