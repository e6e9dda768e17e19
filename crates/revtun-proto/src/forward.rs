//! Forwarding specifications
//!
//! A [`ForwardingSpec`] describes one reverse tunnel: where the server listens
//! (local side) and which address the agent dials on its end (remote side).
//!
//! Accepted grammar (optionally suffixed with `/tcp`, `/udp` or `/tcp+udp`):
//!
//! - `<local-host>:<local-port>:<remote-host>:<remote-port>`
//! - `<local-port>:<remote-host>:<remote-port>`
//! - `<remote-host>:<remote-port>`
//! - `<remote-port>`
//!
//! Omitting the local part means the server picks a random allowed port.

use crate::acl::AccessList;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Host used when a local port is given without a local host
pub const ZERO_HOST: &str = "0.0.0.0";

/// Host used when no remote host is given
pub const LOOPBACK_HOST: &str = "127.0.0.1";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SpecError {
    #[error("Invalid remote: {0}")]
    InvalidRemote(String),

    #[error("Missing ports in remote: {0}")]
    MissingPorts(String),

    #[error("Invalid host: {0}")]
    InvalidHost(String),

    #[error("Invalid port: {0}")]
    InvalidPort(String),

    #[error("Unknown protocol: {0} (expected tcp, udp or tcp+udp)")]
    UnknownProtocol(String),
}

/// Transport protocol(s) carried by a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Protocol {
    #[default]
    #[serde(rename = "tcp")]
    Tcp,
    #[serde(rename = "udp")]
    Udp,
    #[serde(rename = "tcp+udp")]
    TcpUdp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::TcpUdp => "tcp+udp",
        }
    }

    pub fn includes_tcp(&self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::TcpUdp)
    }

    pub fn includes_udp(&self) -> bool {
        matches!(self, Protocol::Udp | Protocol::TcpUdp)
    }

    /// True when the protocols overlap: `tcp+udp` overlaps both `tcp` and `udp`.
    pub fn overlaps(&self, other: Protocol) -> bool {
        (self.includes_tcp() && other.includes_tcp()) || (self.includes_udp() && other.includes_udp())
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "tcp+udp" => Ok(Protocol::TcpUdp),
            other => Err(SpecError::UnknownProtocol(other.to_string())),
        }
    }
}

/// Declarative description of one tunnel
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ForwardingSpec {
    /// Optional human readable name
    pub name: Option<String>,
    pub protocol: Protocol,
    pub local_host: Option<String>,
    /// `None` until the server resolves a port
    pub local_port: Option<u16>,
    /// Set when `local_port` was picked by the server
    pub local_port_random: bool,
    pub remote_host: String,
    pub remote_port: u16,
    /// Backend scheme used by the tunnel proxy (`http`, `https`, `vnc`)
    pub scheme: Option<String>,
    /// Comma separated IPv4 addresses / CIDR blocks
    pub acl: Option<String>,
    /// 0 disables the idle timeout
    pub idle_timeout_minutes: u32,
    pub auto_close: Option<Duration>,
    /// Put a TLS terminating proxy in front of the tunnel
    pub http_proxy: bool,
    pub host_header: Option<String>,
    pub auth_user: Option<String>,
    pub auth_password: Option<String>,
    /// Public subdomain registered with the downstream routing service
    pub downstream_subdomain: Option<String>,
}

impl ForwardingSpec {
    /// Create a TCP spec for a remote address with no local side
    pub fn new(remote_host: impl Into<String>, remote_port: u16) -> Self {
        Self {
            remote_host: remote_host.into(),
            remote_port,
            ..Default::default()
        }
    }

    pub fn with_local(mut self, host: impl Into<String>, port: u16) -> Self {
        self.local_host = Some(host.into());
        self.local_port = Some(port);
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_acl(mut self, acl: impl Into<String>) -> Self {
        self.acl = Some(acl.into());
        self
    }

    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = Some(scheme.into());
        self
    }

    pub fn with_auto_close(mut self, after: Duration) -> Self {
        self.auto_close = Some(after);
        self
    }

    pub fn with_idle_timeout_minutes(mut self, minutes: u32) -> Self {
        self.idle_timeout_minutes = minutes;
        self
    }

    pub fn with_http_proxy(mut self, enabled: bool) -> Self {
        self.http_proxy = enabled;
        self
    }

    /// `remoteHost:remotePort`, the address the agent dials
    pub fn remote(&self) -> String {
        join_host_port(&self.remote_host, self.remote_port)
    }

    /// `localHost:localPort` once both are known
    pub fn local(&self) -> Option<String> {
        match (&self.local_host, self.local_port) {
            (Some(host), Some(port)) if !host.is_empty() => Some(join_host_port(host, port)),
            _ => None,
        }
    }

    pub fn is_local_specified(&self) -> bool {
        self.local().is_some()
    }

    pub fn is_protocol(&self, protocol: Protocol) -> bool {
        self.protocol == protocol || self.protocol.overlaps(protocol)
    }

    /// ACLs match when their normalized forms do; unset and empty both allow all.
    pub fn equal_acl(&self, acl: &Option<String>) -> bool {
        normalized_acl(&self.acl) == normalized_acl(acl)
    }

    /// Same remote target, protocol and ACL; the local side is ignored.
    pub fn remote_equal(&self, other: &ForwardingSpec) -> bool {
        self.remote_host == other.remote_host
            && self.remote_port == other.remote_port
            && self.protocol == other.protocol
            && self.equal_acl(&other.acl)
    }

    /// Payload of the channel-open request for one data plane
    pub fn channel_payload(&self, protocol: Protocol) -> String {
        match protocol {
            Protocol::Udp => format!("{}{}", self.remote(), crate::UDP_CHANNEL_SUFFIX),
            _ => self.remote(),
        }
    }

    /// Forget a server assigned local side so a new one is picked.
    pub fn clear_local(&mut self) {
        self.local_host = None;
        self.local_port = None;
    }

    pub fn assign_random_local(&mut self, port: u16) {
        self.local_host = Some(ZERO_HOST.to_string());
        self.local_port = Some(port);
        self.local_port_random = true;
    }
}

fn normalized_acl(acl: &Option<String>) -> Option<String> {
    let raw = acl.as_deref().unwrap_or("");
    match AccessList::parse(raw) {
        Ok(list) => list.map(|list| list.to_string()),
        // Unparseable lists only match the same spelling.
        Err(_) => Some(raw.trim().to_string()),
    }
}

impl fmt::Display for ForwardingSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let local_host = self.local_host.as_deref().unwrap_or("");
        let local_port = self.local_port.map(|p| p.to_string()).unwrap_or_default();
        write!(f, "{}:{}:{}", local_host, local_port, self.remote())?;
        if self.protocol != Protocol::Tcp {
            write!(f, "/{}", self.protocol)?;
        }
        if let Some(acl) = &self.acl {
            write!(f, "(acl:{})", acl)?;
        }
        Ok(())
    }
}

impl FromStr for ForwardingSpec {
    type Err = SpecError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (body, protocol) = split_protocol(input);

        let parts: Vec<&str> = body.split(':').collect();
        if parts.len() > 4 {
            return Err(SpecError::InvalidRemote(input.to_string()));
        }

        let mut remote_port: Option<u16> = None;
        let mut local_port: Option<u16> = None;
        let mut remote_host: Option<String> = None;
        let mut local_host: Option<String> = None;

        // Walk right to left: the first port seen is the remote one.
        for part in parts.iter().rev() {
            if is_port(part) {
                let port = parse_port(part)?;
                if remote_port.is_none() {
                    remote_port = Some(port);
                } else if local_port.is_none() {
                    local_port = Some(port);
                } else {
                    return Err(SpecError::InvalidRemote(input.to_string()));
                }
                continue;
            }

            if remote_port.is_none() && local_port.is_none() {
                return Err(SpecError::MissingPorts(input.to_string()));
            }
            if !is_host(part) {
                return Err(SpecError::InvalidHost(part.to_string()));
            }
            if remote_host.is_none() {
                remote_host = Some(part.to_string());
            } else if local_host.is_none() {
                local_host = Some(part.to_string());
            } else {
                return Err(SpecError::InvalidRemote(input.to_string()));
            }
        }

        let remote_port = remote_port.ok_or_else(|| SpecError::MissingPorts(input.to_string()))?;

        if local_host.is_none() && local_port.is_some() {
            local_host = Some(ZERO_HOST.to_string());
        }

        Ok(Self {
            protocol,
            local_host,
            local_port,
            remote_host: remote_host.unwrap_or_else(|| LOOPBACK_HOST.to_string()),
            remote_port,
            ..Default::default()
        })
    }
}

fn split_protocol(input: &str) -> (&str, Protocol) {
    for (suffix, protocol) in [
        ("/tcp+udp", Protocol::TcpUdp),
        ("/tcp", Protocol::Tcp),
        ("/udp", Protocol::Udp),
    ] {
        if let Some(body) = input.strip_suffix(suffix) {
            return (body, protocol);
        }
    }
    (input, Protocol::Tcp)
}

fn is_port(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn parse_port(s: &str) -> Result<u16, SpecError> {
    match s.parse::<u16>() {
        Ok(0) | Err(_) => Err(SpecError::InvalidPort(s.to_string())),
        Ok(port) => Ok(port),
    }
}

fn is_host(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

/// Join host and port, bracketing IPv6 literals
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
