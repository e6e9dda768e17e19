//! Transport abstraction between the server and its agents
//!
//! The server only needs two things from an agent connection:
//!
//! - opening a reliable, ordered byte channel with a typed payload
//!   (the agent dials the address named in the payload)
//! - sending an out-of-band request and reading the reply
//!
//! ```text
//! ┌──────────────────────────────┐
//! │ tunnels / session service    │
//! └──────────────────────────────┘
//!                │ AgentTransport
//!                ↓
//! ┌──────────────┬───────────────┐
//! │ QUIC         │ in-memory     │
//! │ (production) │ (tests)       │
//! └──────────────┴───────────────┘
//! ```

pub mod dialer;
pub mod memory;

use async_trait::async_trait;
use revtun_proto::CodecError;
use std::fmt::Debug;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub use memory::{memory_pair, AgentEvent, IncomingChannel, IncomingRequest, MemoryAgent, MemoryTransport};

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Channel rejected by agent: {0}")]
    ChannelRejected(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Timeout")]
    Timeout,

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Byte stream carried by a channel
pub trait ChannelStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ChannelStream for T {}

/// An opened channel
pub type Channel = Box<dyn ChannelStream>;

/// Reply to an out-of-band request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestReply {
    pub ok: bool,
    pub payload: Vec<u8>,
}

impl RequestReply {
    pub fn ok(payload: Vec<u8>) -> Self {
        Self { ok: true, payload }
    }

    pub fn error(message: &str) -> Self {
        Self {
            ok: false,
            payload: message.as_bytes().to_vec(),
        }
    }

    /// Payload as text, for error replies
    pub fn message(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// A live connection to one agent
#[async_trait]
pub trait AgentTransport: Send + Sync + Debug {
    /// Ask the agent to open a channel; resolves once the agent accepted it.
    async fn open_channel(&self, channel_type: &str, payload: &[u8]) -> TransportResult<Channel>;

    /// Send an out-of-band request and wait for the reply
    async fn request(&self, kind: &str, payload: &[u8]) -> TransportResult<RequestReply>;

    /// Close the connection
    async fn close(&self, reason: &str);

    /// Resolves once the connection is closed, by either side
    async fn closed(&self);

    fn is_closed(&self) -> bool;

    fn remote_address(&self) -> SocketAddr;

    /// Unique identifier of this connection
    fn connection_id(&self) -> String;
}
