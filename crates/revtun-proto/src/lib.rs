//! Shared types for the revtun reverse tunnel server
//!
//! This crate defines:
//! - Forwarding specifications and their textual grammar
//! - IPv4 access lists
//! - Control message framing used on transport streams
//! - The datagram envelope used by UDP tunnels

pub mod acl;
pub mod codec;
pub mod forward;
pub mod messages;
pub mod udp;
pub mod version;

pub use acl::{is_permitted, AccessList, AclError};
pub use codec::{read_message, write_message, CodecError, FrameCodec};
pub use forward::{join_host_port, ForwardingSpec, Protocol, SpecError, LOOPBACK_HOST, ZERO_HOST};
pub use messages::{AgentHello, ControlMessage, HelloResponse, TunnelAllowedReply, TunnelInfo};
pub use udp::{EnvelopeError, UdpEnvelope, UdpEnvelopeCodec, MAX_DATAGRAM_SIZE};
pub use version::{AgentVersion, VersionError, POLICY_CHECK_MIN_VERSION};

/// Channel type used for every tunnel channel
pub const CHANNEL_TYPE: &str = "revtun";

/// Suffix appended to the channel payload of UDP tunnels
pub const UDP_CHANNEL_SUFFIX: &str = "/udp";

/// Request kind used to re-validate a tunnel against the agent's policy
pub const TUNNEL_ALLOWED_REQUEST: &str = "tunnel_allowed";

/// Error text returned by agents for request kinds they do not know
pub const UNKNOWN_REQUEST: &str = "unknown request";

/// Response header naming the tunnel proxy that served a request
pub const PROXY_HEADER: &str = "x-revtun-proxy";
