//! Server side state of one agent
//!
//! A [`Session`] outlives the agent's connections: it flips between connected
//! and disconnected, keeps the tunnels of the last connection for
//! reconciliation, and is reaped once it stayed disconnected past the
//! retention window. All tunnel list changes go through `Session` methods
//! under the session's own lock.

use crate::persistence::{SessionRecord, TunnelRecord};
use chrono::{DateTime, Utc};
use revtun_proto::{ForwardingSpec, TunnelInfo};
use revtun_proxy::TunnelProxy;
use revtun_transport::AgentTransport;
use revtun_tunnel::{LifetimeToken, Tunnel, TunnelError};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Running parts of a tunnel
#[derive(Debug)]
pub(crate) struct TunnelRuntime {
    pub(crate) tunnel: Tunnel,
    pub(crate) proxy: Option<TunnelProxy>,
    pub(crate) route_id: Option<String>,
    pub(crate) lifetime: LifetimeToken,
}

/// One tunnel of a session. Tunnels restored from persistence have no runtime.
#[derive(Debug)]
pub struct SessionTunnel {
    id: String,
    spec: ForwardingSpec,
    runtime: Option<TunnelRuntime>,
}

impl SessionTunnel {
    pub(crate) fn running(id: String, spec: ForwardingSpec, runtime: TunnelRuntime) -> Self {
        Self {
            id,
            spec,
            runtime: Some(runtime),
        }
    }

    pub(crate) fn stored(record: TunnelRecord) -> Self {
        Self {
            id: record.id,
            spec: record.spec,
            runtime: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Spec as requested; with a proxy the local side is the proxy's address.
    pub fn spec(&self) -> &ForwardingSpec {
        &self.spec
    }

    pub fn is_running(&self) -> bool {
        self.runtime
            .as_ref()
            .is_some_and(|runtime| !runtime.lifetime.is_cancelled())
    }

    /// Address of the raw tunnel listener
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.runtime.as_ref().and_then(|r| r.tunnel.local_addr())
    }

    pub fn proxy(&self) -> Option<&TunnelProxy> {
        self.runtime.as_ref().and_then(|r| r.proxy.as_ref())
    }

    pub fn public_url(&self) -> Option<String> {
        self.proxy().map(TunnelProxy::public_url)
    }

    pub fn last_active(&self) -> Option<DateTime<Utc>> {
        self.runtime.as_ref().map(|r| r.tunnel.last_active())
    }

    pub(crate) fn route_id(&self) -> Option<&str> {
        self.runtime.as_ref().and_then(|r| r.route_id.as_deref())
    }

    pub(crate) fn lifetime(&self) -> Option<&LifetimeToken> {
        self.runtime.as_ref().map(|r| &r.lifetime)
    }

    pub fn info(&self) -> TunnelInfo {
        TunnelInfo {
            id: self.id.clone(),
            spec: self.spec.clone(),
            public_url: self.public_url(),
        }
    }

    pub(crate) fn record(&self) -> TunnelRecord {
        TunnelRecord {
            id: self.id.clone(),
            spec: self.spec.clone(),
        }
    }

    /// Stop the data planes, then the proxy. A refused non-forced terminate
    /// leaves everything running.
    pub(crate) async fn shutdown(&self, force: bool) -> Result<(), TunnelError> {
        let Some(runtime) = &self.runtime else {
            return Ok(());
        };

        runtime.tunnel.terminate(force).await?;
        runtime.lifetime.cancel();
        if let Some(proxy) = &runtime.proxy {
            proxy.stop().await;
        }
        debug!(tunnel_id = %self.id, tunnel = %self.spec, "Tunnel shut down");
        Ok(())
    }
}

/// Connection metadata taken from the agent's hello
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub session_id: String,
    pub auth_id: String,
    pub name: Option<String>,
    pub version: String,
    pub transport: Arc<dyn AgentTransport>,
    pub cancel: CancellationToken,
}

#[derive(Debug)]
struct SessionState {
    session_id: String,
    auth_id: String,
    name: Option<String>,
    version: Option<String>,
    address: Option<String>,
    allowed_user_groups: Vec<String>,
    transport: Option<Arc<dyn AgentTransport>>,
    cancel: CancellationToken,
    tunnels: Vec<Arc<SessionTunnel>>,
    connected_at: DateTime<Utc>,
    disconnected_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct Session {
    agent_id: String,
    last_tunnel_id: AtomicU64,
    state: RwLock<SessionState>,
}

impl Session {
    /// A session that has not connected yet; it counts as disconnected.
    pub fn new(agent_id: impl Into<String>, auth_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            agent_id: agent_id.into(),
            last_tunnel_id: AtomicU64::new(0),
            state: RwLock::new(SessionState {
                session_id: String::new(),
                auth_id: auth_id.into(),
                name: None,
                version: None,
                address: None,
                allowed_user_groups: Vec::new(),
                transport: None,
                cancel: CancellationToken::new(),
                tunnels: Vec::new(),
                connected_at: now,
                disconnected_at: Some(now),
                updated_at: now,
            }),
        }
    }

    /// Rebuild a session loaded from persistence. Nothing runs after a
    /// restart, so a session stored as connected is disconnected at `now`.
    pub fn restore(record: SessionRecord, now: DateTime<Utc>) -> Self {
        let last_id = record
            .tunnels
            .iter()
            .filter_map(|t| t.id.parse::<u64>().ok())
            .max()
            .unwrap_or(0);

        Self {
            agent_id: record.agent_id,
            last_tunnel_id: AtomicU64::new(last_id),
            state: RwLock::new(SessionState {
                session_id: record.session_id,
                auth_id: record.auth_id,
                name: record.name,
                version: record.version,
                address: record.address,
                allowed_user_groups: record.allowed_user_groups,
                transport: None,
                cancel: CancellationToken::new(),
                tunnels: record
                    .tunnels
                    .into_iter()
                    .map(|t| Arc::new(SessionTunnel::stored(t)))
                    .collect(),
                connected_at: record.connected_at,
                disconnected_at: Some(record.disconnected_at.unwrap_or(now)),
                updated_at: record.updated_at,
            }),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Next tunnel ID, unique within this session
    pub(crate) fn next_tunnel_id(&self) -> String {
        (self.last_tunnel_id.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    pub async fn session_id(&self) -> String {
        self.state.read().await.session_id.clone()
    }

    pub async fn auth_id(&self) -> String {
        self.state.read().await.auth_id.clone()
    }

    pub async fn name(&self) -> Option<String> {
        self.state.read().await.name.clone()
    }

    pub async fn version(&self) -> Option<String> {
        self.state.read().await.version.clone()
    }

    pub async fn address(&self) -> Option<String> {
        self.state.read().await.address.clone()
    }

    pub async fn allowed_user_groups(&self) -> Vec<String> {
        self.state.read().await.allowed_user_groups.clone()
    }

    pub async fn set_allowed_user_groups(&self, groups: Vec<String>) {
        self.state.write().await.allowed_user_groups = groups;
    }

    pub async fn is_connected(&self) -> bool {
        self.state.read().await.disconnected_at.is_none()
    }

    pub async fn connected_at(&self) -> DateTime<Utc> {
        self.state.read().await.connected_at
    }

    pub async fn disconnected_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().await.disconnected_at
    }

    pub async fn transport(&self) -> Option<Arc<dyn AgentTransport>> {
        self.state.read().await.transport.clone()
    }

    /// Connection ID of the current transport
    pub async fn connection_id(&self) -> Option<String> {
        self.state
            .read()
            .await
            .transport
            .as_ref()
            .map(|t| t.connection_id())
    }

    pub(crate) async fn cancel_token(&self) -> CancellationToken {
        self.state.read().await.cancel.clone()
    }

    pub async fn tunnels(&self) -> Vec<Arc<SessionTunnel>> {
        self.state.read().await.tunnels.clone()
    }

    pub async fn tunnel_specs(&self) -> Vec<ForwardingSpec> {
        self.state
            .read()
            .await
            .tunnels
            .iter()
            .map(|t| t.spec().clone())
            .collect()
    }

    pub async fn tunnel_infos(&self) -> Vec<TunnelInfo> {
        self.state
            .read()
            .await
            .tunnels
            .iter()
            .map(|t| t.info())
            .collect()
    }

    pub async fn find_tunnel(&self, tunnel_id: &str) -> Option<Arc<SessionTunnel>> {
        self.state
            .read()
            .await
            .tunnels
            .iter()
            .find(|t| t.id() == tunnel_id)
            .cloned()
    }

    /// Tunnel whose spec equals `spec` in every field
    pub async fn find_tunnel_by_spec(&self, spec: &ForwardingSpec) -> Option<Arc<SessionTunnel>> {
        self.state
            .read()
            .await
            .tunnels
            .iter()
            .find(|t| t.spec() == spec)
            .cloned()
    }

    /// Mark connected with a fresh tunnel list
    pub(crate) async fn connect(
        &self,
        info: ConnectionInfo,
        tunnels: Vec<Arc<SessionTunnel>>,
        now: DateTime<Utc>,
    ) {
        let mut state = self.state.write().await;
        state.session_id = info.session_id;
        state.auth_id = info.auth_id;
        state.name = info.name;
        state.version = Some(info.version).filter(|v| !v.is_empty());
        state.address = Some(info.transport.remote_address().to_string());
        state.transport = Some(info.transport);
        state.cancel = info.cancel;
        state.tunnels = tunnels;
        state.connected_at = now;
        state.disconnected_at = None;
        state.updated_at = now;
    }

    /// Mark disconnected and hand back what still has to be stopped. The
    /// tunnel list is kept for the next reconnect.
    pub(crate) async fn disconnect(&self, now: DateTime<Utc>) -> Vec<Arc<SessionTunnel>> {
        let mut state = self.state.write().await;
        state.cancel.cancel();
        state.transport = None;
        if state.disconnected_at.is_none() {
            state.disconnected_at = Some(now);
        }
        state.updated_at = now;
        state.tunnels.clone()
    }

    pub(crate) async fn add_tunnels(&self, tunnels: &[Arc<SessionTunnel>], now: DateTime<Utc>) {
        if tunnels.is_empty() {
            return;
        }
        let mut state = self.state.write().await;
        state.tunnels.extend(tunnels.iter().cloned());
        state.updated_at = now;
    }

    /// Splice a tunnel out of the list; `None` if it was already gone
    pub(crate) async fn remove_tunnel(
        &self,
        tunnel_id: &str,
        now: DateTime<Utc>,
    ) -> Option<Arc<SessionTunnel>> {
        let mut state = self.state.write().await;
        let index = state.tunnels.iter().position(|t| t.id() == tunnel_id)?;
        state.updated_at = now;
        Some(state.tunnels.remove(index))
    }

    /// Obsolete once disconnected for longer than `retention`. No retention
    /// means sessions are kept forever.
    pub async fn is_obsolete(&self, retention: Option<Duration>, now: DateTime<Utc>) -> bool {
        let disconnected_at = self.state.read().await.disconnected_at;
        obsolete(disconnected_at, retention, now)
    }

    pub async fn record(&self) -> SessionRecord {
        let state = self.state.read().await;
        SessionRecord {
            agent_id: self.agent_id.clone(),
            session_id: state.session_id.clone(),
            auth_id: state.auth_id.clone(),
            name: state.name.clone(),
            version: state.version.clone(),
            address: state.address.clone(),
            allowed_user_groups: state.allowed_user_groups.clone(),
            tunnels: state.tunnels.iter().map(|t| t.record()).collect(),
            connected_at: state.connected_at,
            disconnected_at: state.disconnected_at,
            updated_at: state.updated_at,
        }
    }
}

pub(crate) fn obsolete(
    disconnected_at: Option<DateTime<Utc>>,
    retention: Option<Duration>,
    now: DateTime<Utc>,
) -> bool {
    let (Some(disconnected_at), Some(retention)) = (disconnected_at, retention) else {
        return false;
    };
    match chrono::Duration::from_std(retention) {
        Ok(retention) => now - disconnected_at > retention,
        Err(_) => {
            warn!(?retention, "Retention out of range, treating session as kept");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use revtun_transport::memory_pair;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 9, 1, 12, minute, 0).unwrap()
    }

    #[test]
    fn test_obsolescence_boundary() {
        let retention = Some(Duration::from_secs(3600));
        let disconnected = Some(at(0));

        let exactly = at(0) + chrono::Duration::hours(1);
        assert!(!obsolete(disconnected, retention, exactly));
        assert!(obsolete(
            disconnected,
            retention,
            exactly + chrono::Duration::milliseconds(1)
        ));
    }

    #[test]
    fn test_never_obsolete_while_connected_or_without_retention() {
        let much_later = at(0) + chrono::Duration::days(365);
        assert!(!obsolete(None, Some(Duration::ZERO), much_later));
        assert!(!obsolete(Some(at(0)), None, much_later));
    }

    #[tokio::test]
    async fn test_restore_marks_disconnected() {
        let record = SessionRecord {
            agent_id: "agent-1".into(),
            session_id: "s-1".into(),
            auth_id: "auth-1".into(),
            name: None,
            version: Some("0.7.0".into()),
            address: None,
            allowed_user_groups: vec![],
            tunnels: vec![
                TunnelRecord {
                    id: "3".into(),
                    spec: ForwardingSpec::new("127.0.0.1", 22),
                },
                TunnelRecord {
                    id: "7".into(),
                    spec: ForwardingSpec::new("127.0.0.1", 80),
                },
            ],
            connected_at: at(0),
            disconnected_at: None,
            updated_at: at(0),
        };

        let session = Session::restore(record, at(5));
        assert!(!session.is_connected().await);
        assert_eq!(session.disconnected_at().await, Some(at(5)));
        assert_eq!(session.tunnels().await.len(), 2);
        assert!(!session.tunnels().await[0].is_running());
        assert_eq!(session.next_tunnel_id(), "8");
    }

    #[tokio::test]
    async fn test_connect_disconnect_cycle() {
        let session = Session::new("agent-1", "auth-1", at(0));
        assert!(!session.is_connected().await);
        assert_eq!(session.next_tunnel_id(), "1");
        assert_eq!(session.next_tunnel_id(), "2");

        let (transport, _agent) = memory_pair("192.0.2.1:40000".parse().unwrap());
        let cancel = CancellationToken::new();
        let info = ConnectionInfo {
            session_id: "s-1".into(),
            auth_id: "auth-1".into(),
            name: Some("build box".into()),
            version: "0.7.0".into(),
            transport: Arc::new(transport),
            cancel: cancel.clone(),
        };
        session.connect(info, Vec::new(), at(1)).await;
        assert!(session.is_connected().await);
        assert_eq!(session.address().await.as_deref(), Some("192.0.2.1:40000"));
        assert!(session.connection_id().await.is_some());

        session.disconnect(at(2)).await;
        assert!(cancel.is_cancelled());
        assert_eq!(session.disconnected_at().await, Some(at(2)));
        assert!(session.transport().await.is_none());

        let record = session.record().await;
        assert_eq!(record.name.as_deref(), Some("build box"));
        assert_eq!(record.disconnected_at, Some(at(2)));
    }
}
