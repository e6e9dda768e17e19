//! Control messages exchanged between agent and server

use crate::forward::ForwardingSpec;
use serde::{Deserialize, Serialize};

/// First message an agent sends after connecting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentHello {
    pub agent_id: String,
    pub auth_id: String,
    /// Display name chosen by the agent operator
    pub name: Option<String>,
    /// Resumption token; equal to the previous one when the agent resumes
    pub session_id: String,
    pub version: String,
    pub tunnels: Vec<ForwardingSpec>,
}

/// A tunnel as reported back to the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelInfo {
    pub id: String,
    pub spec: ForwardingSpec,
    /// Public proxy URL when the tunnel is fronted by a proxy
    pub public_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HelloResponse {
    Accepted { tunnels: Vec<TunnelInfo> },
    Rejected { code: u16, message: String },
}

/// Reply body of a `tunnel_allowed` request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelAllowedReply {
    pub is_allowed: bool,
}

/// Frames carried on transport streams
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    Hello(AgentHello),
    HelloResult(HelloResponse),

    /// Opens a byte channel; after an accept the stream carries raw bytes
    ChannelOpen {
        channel_type: String,
        payload: Vec<u8>,
    },
    ChannelAccepted,
    ChannelRejected {
        reason: String,
    },

    /// Out-of-band request
    Request {
        kind: String,
        payload: Vec<u8>,
    },
    Reply {
        ok: bool,
        payload: Vec<u8>,
    },
}
