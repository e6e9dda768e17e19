//! Re-validating reestablished tunnels against the agent's live policy

use async_trait::async_trait;
use revtun_proto::{TunnelAllowedReply, TUNNEL_ALLOWED_REQUEST, UNKNOWN_REQUEST};
use revtun_transport::{AgentTransport, TransportError};
use std::fmt::Debug;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAnswer {
    Allowed,
    Denied,
    /// The agent does not know the request
    Unsupported,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PolicyCheck: Send + Sync + Debug {
    /// Ask the agent whether it still permits tunnels to `remote`
    async fn tunnel_allowed(
        &self,
        transport: Arc<dyn AgentTransport>,
        remote: String,
    ) -> Result<PolicyAnswer, TransportError>;
}

/// Sends a `tunnel_allowed` request over the agent connection
#[derive(Debug, Default, Clone, Copy)]
pub struct TransportPolicyCheck;

#[async_trait]
impl PolicyCheck for TransportPolicyCheck {
    async fn tunnel_allowed(
        &self,
        transport: Arc<dyn AgentTransport>,
        remote: String,
    ) -> Result<PolicyAnswer, TransportError> {
        let reply = transport
            .request(TUNNEL_ALLOWED_REQUEST, remote.as_bytes())
            .await?;

        if !reply.ok {
            let message = reply.message();
            if message.contains(UNKNOWN_REQUEST) {
                return Ok(PolicyAnswer::Unsupported);
            }
            return Err(TransportError::RequestFailed(message));
        }

        let answer: TunnelAllowedReply = serde_json::from_slice(&reply.payload)
            .map_err(|e| TransportError::ProtocolError(format!("invalid tunnel_allowed reply: {}", e)))?;
        Ok(match answer.is_allowed {
            true => PolicyAnswer::Allowed,
            false => PolicyAnswer::Denied,
        })
    }
}
