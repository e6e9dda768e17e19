//! Tunnel data planes
//!
//! A [`Tunnel`] binds the local side of a [`revtun_proto::ForwardingSpec`]
//! and relays traffic through channels opened on the agent's transport.
//! Local ports come from the [`PortAllocator`]; time comes from an injected
//! [`Clock`].

pub mod clock;
pub mod error;
pub mod lifetime;
pub mod port;
pub mod tcp;
pub mod tunnel;
pub mod udp;

pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use error::TunnelError;
pub use lifetime::{CloseReason, LifetimeToken};
pub use port::{parse_port_ranges, BindProbe, PortAllocator, PortError, PortProbe};
pub use tcp::TcpTunnel;
pub use tunnel::{DataPlane, Tunnel};
pub use udp::UdpTunnel;
