//! Session lifecycle
//!
//! [`SessionService`] is what the server's connection handler talks to:
//! establishing a session when an agent says hello, starting and
//! terminating tunnels, disconnecting, deleting and reaping sessions.
//!
//! Establishing, starting, terminating and deleting are serialized by one
//! service-wide lock. Auto-close and idle cleanups only take the session's
//! own lock.

use crate::error::ServiceError;
use crate::policy::{PolicyAnswer, PolicyCheck, TransportPolicyCheck};
use crate::reconciler::tunnels_to_reestablish;
use crate::registry::SessionRegistry;
use crate::route::{DownstreamRouteApi, NewRoute};
use crate::session::{ConnectionInfo, Session, SessionTunnel, TunnelRuntime};
use crate::watchers;
use revtun_proto::{
    AccessList, AgentHello, AgentVersion, ForwardingSpec, Protocol, TunnelInfo, LOOPBACK_HOST,
    ZERO_HOST,
};
use revtun_proxy::{CertificateProvider, ProxyKind, ProxyTarget, TunnelProxy, TunnelProxyConfig};
use revtun_transport::AgentTransport;
use revtun_tunnel::{LifetimeToken, PortAllocator, SharedClock, Tunnel};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    /// Let several agents share one auth ID
    pub allow_multi_use_auth: bool,
    pub proxy: Arc<TunnelProxyConfig>,
}

/// Tunnels resolved for one request
#[derive(Debug, Default)]
struct Batch {
    /// One per requested spec, including already existing duplicates
    tunnels: Vec<Arc<SessionTunnel>>,
    /// Only the ones started by this request
    created: Vec<Arc<SessionTunnel>>,
}

#[derive(Debug)]
pub struct SessionService {
    registry: SessionRegistry,
    ports: Arc<PortAllocator>,
    config: ServiceConfig,
    policy: Arc<dyn PolicyCheck>,
    routes: Option<Arc<dyn DownstreamRouteApi>>,
    certs: Option<Arc<dyn CertificateProvider>>,
    lifecycle: Mutex<()>,
    shutdown: CancellationToken,
}

impl SessionService {
    pub fn new(registry: SessionRegistry, ports: Arc<PortAllocator>, config: ServiceConfig) -> Self {
        Self {
            registry,
            ports,
            config,
            policy: Arc::new(TransportPolicyCheck),
            routes: None,
            certs: None,
            lifecycle: Mutex::new(()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn PolicyCheck>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_routes(mut self, routes: Arc<dyn DownstreamRouteApi>) -> Self {
        self.routes = Some(routes);
        self
    }

    /// Enables tunnel proxies when the proxy config is enabled as well
    pub fn with_certificates(mut self, certs: Arc<dyn CertificateProvider>) -> Self {
        self.certs = Some(certs);
        self
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn clock(&self) -> &SharedClock {
        self.registry.clock()
    }

    /// Load stored sessions; see [`SessionRegistry::restore`]
    pub async fn restore(&self) -> Result<usize, ServiceError> {
        Ok(self.registry.restore().await?)
    }

    /// Accept an agent connection and start its tunnels.
    ///
    /// A returning agent gets the tunnels of its previous connection back
    /// unless the new request already covers them. On error the registry
    /// is left as it was and nothing keeps running.
    pub async fn establish(
        self: &Arc<Self>,
        hello: AgentHello,
        transport: Arc<dyn AgentTransport>,
    ) -> Result<Arc<Session>, ServiceError> {
        let _guard = self.lifecycle.lock().await;
        let agent_id = hello.agent_id.clone();
        debug!(agent_id = %agent_id, "Starting session");

        let version = AgentVersion::parse(&hello.version)?;
        let mut requested = hello.tunnels;
        let existing = self.registry.get(&agent_id).await;

        if let Some(session) = &existing {
            let resumed =
                !hello.session_id.is_empty() && hello.session_id == session.session_id().await;
            if resumed {
                debug!(agent_id = %agent_id, session_id = %hello.session_id, "Resuming existing session");
            }
            if session.is_connected().await && !resumed {
                return Err(ServiceError::AlreadyConnected(agent_id));
            }

            let mut old = tunnels_to_reestablish(&session.tunnel_specs().await, &requested);
            if version.supports_policy_check() {
                old = self.exclude_not_allowed(&agent_id, &transport, old).await?;
            } else {
                info!(
                    agent_id = %agent_id,
                    version = %hello.version,
                    "Agent does not support tunnel policies, consider upgrading"
                );
            }

            if !old.is_empty() {
                info!(agent_id = %agent_id, count = old.len(), "Reestablishing previous tunnels");
                requested.extend(old);
            }
        }

        if !self.config.allow_multi_use_auth
            && self
                .registry
                .is_auth_id_in_use(&hello.auth_id, &agent_id)
                .await
        {
            return Err(ServiceError::AuthIdInUse(hello.auth_id));
        }

        let live = match &existing {
            Some(session) if session.is_connected().await => session.tunnels().await,
            _ => Vec::new(),
        };
        self.validate_specs(&requested, &live)?;

        let mut replaced = None;
        let session = match existing {
            Some(session) => {
                if session.is_connected().await {
                    replaced = session.transport().await;
                    self.stop_session(&session).await;
                }
                session
            }
            None => Arc::new(Session::new(&agent_id, &hello.auth_id, self.clock().now())),
        };

        let cancel = self.shutdown.child_token();
        let batch = match self
            .start_specs(&session, &transport, &cancel, requested, Vec::new())
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                cancel.cancel();
                if let Some(previous) = replaced {
                    self.abandon_replaced(&session, previous).await;
                }
                return Err(e);
            }
        };

        let info = ConnectionInfo {
            session_id: hello.session_id,
            auth_id: hello.auth_id,
            name: hello.name,
            version: hello.version,
            transport,
            cancel,
        };
        session
            .connect(info, batch.created.clone(), self.clock().now())
            .await;

        if let Err(e) = self.registry.save(&session).await {
            self.stop_session(&session).await;
            return Err(e.into());
        }

        self.spawn_watchers(&session, &batch.created);
        info!(agent_id = %agent_id, tunnels = batch.created.len(), "Session established");
        Ok(session)
    }

    /// Start more tunnels on a connected session
    pub async fn start_tunnels(
        self: &Arc<Self>,
        agent_id: &str,
        specs: Vec<ForwardingSpec>,
    ) -> Result<Vec<TunnelInfo>, ServiceError> {
        let _guard = self.lifecycle.lock().await;
        let session = self.require(agent_id).await?;

        let transport = match session.transport().await {
            Some(transport) if session.is_connected().await => transport,
            _ => return Err(ServiceError::NotConnected(agent_id.to_string())),
        };
        let cancel = session.cancel_token().await;
        let existing = session.tunnels().await;
        self.validate_specs(&specs, &existing)?;

        let batch = self
            .start_specs(&session, &transport, &cancel, specs, existing)
            .await?;
        session.add_tunnels(&batch.created, self.clock().now()).await;
        self.registry.save(&session).await?;

        self.spawn_watchers(&session, &batch.created);
        Ok(batch.tunnels.iter().map(|t| t.info()).collect())
    }

    /// Stop one tunnel. Without `force` a TCP tunnel with open connections is
    /// left running and a Conflict is returned.
    pub async fn terminate_tunnel(
        &self,
        agent_id: &str,
        tunnel_id: &str,
        force: bool,
    ) -> Result<(), ServiceError> {
        let _guard = self.lifecycle.lock().await;
        let session = self.require(agent_id).await?;
        let tunnel =
            session
                .find_tunnel(tunnel_id)
                .await
                .ok_or_else(|| ServiceError::TunnelNotFound {
                    agent_id: agent_id.to_string(),
                    tunnel_id: tunnel_id.to_string(),
                })?;

        info!(agent_id = %agent_id, tunnel_id = %tunnel_id, force, "Terminating tunnel");
        tunnel.shutdown(force).await?;
        self.remove_route(&tunnel).await;

        session.remove_tunnel(tunnel_id, self.clock().now()).await;
        self.registry.save(&session).await?;
        Ok(())
    }

    /// The agent went away: stop its tunnels, keep the session for the
    /// retention window. Zero retention deletes it right away.
    pub async fn disconnect(&self, agent_id: &str) -> Result<(), ServiceError> {
        let _guard = self.lifecycle.lock().await;
        match self.registry.get_any(agent_id).await {
            Some(session) => self.disconnect_session(&session).await,
            None => Ok(()),
        }
    }

    /// Like [`SessionService::disconnect`], but only while `connection_id` is
    /// still the session's current connection.
    pub async fn connection_closed(&self, agent_id: &str, connection_id: &str) -> Result<(), ServiceError> {
        let _guard = self.lifecycle.lock().await;
        let Some(session) = self.registry.get_any(agent_id).await else {
            return Ok(());
        };
        if session.connection_id().await.as_deref() != Some(connection_id) {
            debug!(agent_id = %agent_id, connection_id, "Stale connection closed, session kept");
            return Ok(());
        }
        self.disconnect_session(&session).await
    }

    /// Delete regardless of retention, closing the connection if needed
    pub async fn force_delete(&self, agent_id: &str) -> Result<(), ServiceError> {
        let _guard = self.lifecycle.lock().await;
        let session = self
            .registry
            .get_any(agent_id)
            .await
            .ok_or_else(|| ServiceError::SessionNotFound(agent_id.to_string()))?;

        debug!(agent_id = %agent_id, "Force deleting session");
        if session.is_connected().await {
            let transport = session.transport().await;
            self.stop_session(&session).await;
            if let Some(transport) = transport {
                transport.close("session deleted").await;
            }
        }
        self.registry.delete(agent_id).await?;
        Ok(())
    }

    /// Delete a disconnected session
    pub async fn delete_offline(&self, agent_id: &str) -> Result<(), ServiceError> {
        let _guard = self.lifecycle.lock().await;
        let session = self.require(agent_id).await?;
        if session.is_connected().await {
            return Err(ServiceError::StillConnected(agent_id.to_string()));
        }
        self.registry.delete(agent_id).await?;
        Ok(())
    }

    pub async fn get(&self, agent_id: &str) -> Option<Arc<Session>> {
        self.registry.get(agent_id).await
    }

    pub async fn list(&self) -> Vec<Arc<Session>> {
        self.registry.list().await
    }

    pub async fn count(&self) -> usize {
        self.registry.count().await
    }

    /// Reap sessions past the retention window
    pub async fn cleanup_obsolete(&self) -> Result<usize, ServiceError> {
        let deleted = self.registry.delete_obsolete().await?;
        if !deleted.is_empty() {
            info!(count = deleted.len(), "Deleted obsolete sessions");
        }
        Ok(deleted.len())
    }

    /// Run [`SessionService::cleanup_obsolete`] every `interval` until shutdown
    pub async fn run_cleanup_loop(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.cleanup_obsolete().await {
                error!("Failed to delete obsolete sessions: {}", e);
            }
        }
        debug!("Session cleanup loop stopped");
    }

    /// Disconnect every connected session and stop background loops
    pub async fn shutdown(&self) {
        let _guard = self.lifecycle.lock().await;
        for session in self.registry.list().await {
            if !session.is_connected().await {
                continue;
            }
            let transport = session.transport().await;
            if let Err(e) = self.disconnect_session(&session).await {
                error!(agent_id = %session.agent_id(), "Failed to save session on shutdown: {}", e);
            }
            if let Some(transport) = transport {
                transport.close("server shutting down").await;
            }
        }
        self.shutdown.cancel();
        info!("Session service stopped");
    }

    /// Cleanup shared by auto-close and idle timeout
    pub(crate) async fn cleanup_tunnel(&self, session: &Arc<Session>, tunnel: &Arc<SessionTunnel>) {
        let _guard = self.lifecycle.lock().await;
        self.stop_tunnel(tunnel).await;

        if session
            .remove_tunnel(tunnel.id(), self.clock().now())
            .await
            .is_none()
        {
            return;
        }
        // a force deleted session must not come back
        if !self.registry.contains(session.agent_id()).await {
            return;
        }
        if let Err(e) = self.registry.save(session).await {
            error!(
                agent_id = %session.agent_id(),
                tunnel_id = %tunnel.id(),
                "Unable to save session after tunnel cleanup: {}", e
            );
        }
        debug!(agent_id = %session.agent_id(), tunnel_id = %tunnel.id(), "Closed tunnel removed");
    }

    async fn require(&self, agent_id: &str) -> Result<Arc<Session>, ServiceError> {
        self.registry
            .get(agent_id)
            .await
            .ok_or_else(|| ServiceError::SessionNotFound(agent_id.to_string()))
    }

    async fn disconnect_session(&self, session: &Arc<Session>) -> Result<(), ServiceError> {
        let agent_id = session.agent_id();
        info!(agent_id = %agent_id, "Terminating session");
        self.stop_session(session).await;

        if self.registry.retention() == Some(Duration::ZERO) {
            self.registry.delete(agent_id).await?;
            return Ok(());
        }
        if !self.registry.contains(agent_id).await {
            return Ok(());
        }
        Ok(self.registry.save(session).await?)
    }

    /// Mark disconnected and stop everything that runs for the session
    async fn stop_session(&self, session: &Session) {
        for tunnel in session.disconnect(self.clock().now()).await {
            self.stop_tunnel(&tunnel).await;
        }
    }

    async fn stop_tunnel(&self, tunnel: &SessionTunnel) {
        if let Err(e) = tunnel.shutdown(true).await {
            warn!(tunnel_id = %tunnel.id(), "Error while stopping tunnel: {}", e);
        }
        self.remove_route(tunnel).await;
    }

    async fn remove_route(&self, tunnel: &SessionTunnel) {
        let (Some(routes), Some(route_id)) = (&self.routes, tunnel.route_id()) else {
            return;
        };
        if let Err(e) = routes.delete_route(route_id.to_string()).await {
            error!(tunnel_id = %tunnel.id(), route_id, "Failed to remove downstream route: {}", e);
        }
    }

    async fn exclude_not_allowed(
        &self,
        agent_id: &str,
        transport: &Arc<dyn AgentTransport>,
        specs: Vec<ForwardingSpec>,
    ) -> Result<Vec<ForwardingSpec>, ServiceError> {
        let mut allowed = Vec::with_capacity(specs.len());
        for spec in &specs {
            match self
                .policy
                .tunnel_allowed(transport.clone(), spec.remote())
                .await?
            {
                PolicyAnswer::Allowed => allowed.push(spec.clone()),
                PolicyAnswer::Denied => {
                    warn!(agent_id = %agent_id, tunnel = %spec, "Tunnel no longer allowed by agent policy, not reestablishing it");
                }
                PolicyAnswer::Unsupported => {
                    debug!(agent_id = %agent_id, "Agent does not answer tunnel policy requests");
                    return Ok(specs);
                }
            }
        }
        Ok(allowed)
    }

    /// Reject bad ACLs and unusable explicit ports before anything is
    /// stopped or started. Ports held by `live` tunnels count as free.
    fn validate_specs(
        &self,
        specs: &[ForwardingSpec],
        live: &[Arc<SessionTunnel>],
    ) -> Result<(), ServiceError> {
        self.ports.refresh();
        for spec in specs {
            if let Some(acl) = &spec.acl {
                AccessList::parse(acl)?;
            }
            let Some(port) = spec.local_port.filter(|_| spec.is_local_specified()) else {
                continue;
            };
            if !self.ports.is_port_allowed(port) {
                return Err(ServiceError::PortNotAllowed(port));
            }
            let held = live.iter().any(|t| t.spec().local_port == Some(port));
            if !held && self.ports.is_port_busy(spec.protocol, port) {
                return Err(ServiceError::PortInUse(port));
            }
        }
        Ok(())
    }

    /// A resumed session failed to start after its old tunnels were
    /// stopped: keep it as disconnected and let the old connection go.
    async fn abandon_replaced(&self, session: &Arc<Session>, previous: Arc<dyn AgentTransport>) {
        if let Err(e) = self.registry.save(session).await {
            error!(agent_id = %session.agent_id(), "Failed to save session after failed resume: {}", e);
        }
        previous.close("session replaced").await;
    }

    async fn start_specs(
        &self,
        session: &Session,
        transport: &Arc<dyn AgentTransport>,
        cancel: &CancellationToken,
        specs: Vec<ForwardingSpec>,
        existing: Vec<Arc<SessionTunnel>>,
    ) -> Result<Batch, ServiceError> {
        self.ports.refresh();

        let mut batch = Batch::default();
        for spec in specs {
            let result = self
                .resolve_and_start(session, transport, cancel, spec, &existing, &batch.created)
                .await;
            match result {
                Ok((tunnel, created)) => {
                    if created {
                        batch.created.push(tunnel.clone());
                    }
                    batch.tunnels.push(tunnel);
                }
                Err(e) => {
                    for tunnel in &batch.created {
                        self.stop_tunnel(tunnel).await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(batch)
    }

    /// Returns the tunnel and whether it was started by this call
    async fn resolve_and_start(
        &self,
        session: &Session,
        transport: &Arc<dyn AgentTransport>,
        cancel: &CancellationToken,
        mut spec: ForwardingSpec,
        existing: &[Arc<SessionTunnel>],
        created: &[Arc<SessionTunnel>],
    ) -> Result<(Arc<SessionTunnel>, bool), ServiceError> {
        let acl = match &spec.acl {
            Some(acl) => AccessList::parse(acl)?,
            None => None,
        };

        match spec.local_port.filter(|_| spec.is_local_specified()) {
            Some(port) => {
                if let Some(tunnel) = existing
                    .iter()
                    .chain(created)
                    .find(|t| t.spec() == &spec)
                {
                    debug!(tunnel_id = %tunnel.id(), "Tunnel already exists");
                    return Ok((tunnel.clone(), false));
                }
                self.check_local_port(spec.protocol, port)?;
            }
            None => {
                let port = self.ports.get_random_port(spec.protocol)?;
                spec.assign_random_local(port);
                debug!(port, "Using random local port");
            }
        }

        let tunnel = self
            .start_tunnel(session, transport, cancel, spec, acl)
            .await?;
        Ok((Arc::new(tunnel), true))
    }

    fn check_local_port(&self, protocol: Protocol, port: u16) -> Result<(), ServiceError> {
        if !self.ports.is_port_allowed(port) {
            return Err(ServiceError::PortNotAllowed(port));
        }
        if self.ports.is_port_busy(protocol, port) {
            return Err(ServiceError::PortInUse(port));
        }
        Ok(())
    }

    async fn start_tunnel(
        &self,
        session: &Session,
        transport: &Arc<dyn AgentTransport>,
        cancel: &CancellationToken,
        spec: ForwardingSpec,
        acl: Option<AccessList>,
    ) -> Result<SessionTunnel, ServiceError> {
        let id = session.next_tunnel_id();
        let lifetime = match spec.auto_close.filter(|after| !after.is_zero()) {
            Some(after) => LifetimeToken::with_deadline(cancel, after),
            None => LifetimeToken::child_of(cancel),
        };

        let started = match self.proxy_certificates(&spec) {
            Some(certs) => {
                self.start_proxied(&spec, acl, transport, &lifetime, certs)
                    .await
            }
            None => self
                .start_direct(&spec, transport, &lifetime)
                .await
                .map(|tunnel| (tunnel, None, None)),
        };

        match started {
            Ok((tunnel, proxy, route_id)) => {
                info!(
                    agent_id = %session.agent_id(),
                    tunnel_id = %id,
                    tunnel = %spec,
                    proxy = %proxy.as_ref().map(|p| p.public_url()).unwrap_or_default(),
                    "Tunnel started"
                );
                Ok(SessionTunnel::running(
                    id,
                    spec,
                    TunnelRuntime {
                        tunnel,
                        proxy,
                        route_id,
                        lifetime,
                    },
                ))
            }
            Err(e) => {
                lifetime.cancel();
                Err(e)
            }
        }
    }

    fn proxy_certificates(&self, spec: &ForwardingSpec) -> Option<Arc<dyn CertificateProvider>> {
        if !spec.http_proxy || !self.config.proxy.is_enabled() {
            return None;
        }
        self.certs.clone()
    }

    async fn start_direct(
        &self,
        spec: &ForwardingSpec,
        transport: &Arc<dyn AgentTransport>,
        lifetime: &LifetimeToken,
    ) -> Result<Tunnel, ServiceError> {
        let tunnel = Tunnel::new(spec.clone(), transport.clone(), self.clock().clone())?;
        tunnel.start(lifetime.token()).await?;
        Ok(tunnel)
    }

    /// Raw tunnel on loopback behind a TLS proxy bound to the spec's local side
    async fn start_proxied(
        &self,
        spec: &ForwardingSpec,
        acl: Option<AccessList>,
        transport: &Arc<dyn AgentTransport>,
        lifetime: &LifetimeToken,
        certs: Arc<dyn CertificateProvider>,
    ) -> Result<(Tunnel, Option<TunnelProxy>, Option<String>), ServiceError> {
        let kind = ProxyKind::from_scheme(spec.scheme.as_deref())?;
        let backend_port = self.ports.get_random_port(Protocol::Tcp)?;

        let mut inner = spec.clone();
        inner.protocol = Protocol::Tcp;
        inner.local_host = Some(LOOPBACK_HOST.to_string());
        inner.local_port = Some(backend_port);
        inner.local_port_random = true;
        inner.acl = Some(LOOPBACK_HOST.to_string());
        inner.http_proxy = false;
        let tunnel = self.start_direct(&inner, transport, lifetime).await?;

        let bind_host = spec
            .local_host
            .clone()
            .unwrap_or_else(|| ZERO_HOST.to_string());
        let target = ProxyTarget {
            bind_host: bind_host.clone(),
            bind_port: spec.local_port.unwrap_or_default(),
            backend_host: LOOPBACK_HOST.to_string(),
            backend_port,
            kind,
            acl,
            host_header: spec.host_header.clone(),
            basic_auth: spec.auth_user.clone().zip(spec.auth_password.clone()),
        };
        let proxy = TunnelProxy::new(target, self.config.proxy.clone(), certs);

        let proxy_addr = match proxy.start().await {
            Ok(addr) => addr,
            Err(e) => {
                if let Err(stop_err) = tunnel.terminate(true).await {
                    warn!(tunnel = %spec, "Failed to stop tunnel after proxy error: {}", stop_err);
                }
                return Err(e.into());
            }
        };

        let route_id = match (&spec.downstream_subdomain, &self.routes) {
            (Some(subdomain), Some(routes)) => {
                let target_host = match bind_host.as_str() {
                    ZERO_HOST => LOOPBACK_HOST.to_string(),
                    host => host.to_string(),
                };
                let route = NewRoute {
                    route_id: subdomain.clone(),
                    subdomain: subdomain.clone(),
                    target_host,
                    target_port: proxy_addr.port(),
                };
                if let Err(e) = routes.add_route(route).await {
                    proxy.stop().await;
                    if let Err(stop_err) = tunnel.terminate(true).await {
                        warn!(tunnel = %spec, "Failed to stop tunnel after route error: {}", stop_err);
                    }
                    return Err(e.into());
                }
                Some(subdomain.clone())
            }
            _ => None,
        };

        Ok((tunnel, Some(proxy), route_id))
    }

    fn spawn_watchers(self: &Arc<Self>, session: &Arc<Session>, tunnels: &[Arc<SessionTunnel>]) {
        for tunnel in tunnels {
            let Some(lifetime) = tunnel.lifetime().cloned() else {
                continue;
            };

            if tunnel.spec().auto_close.is_some_and(|after| !after.is_zero()) {
                tokio::spawn(watchers::auto_close(
                    self.clone(),
                    session.clone(),
                    tunnel.clone(),
                    lifetime.clone(),
                ));
            }

            let idle_minutes = tunnel.spec().idle_timeout_minutes;
            if idle_minutes > 0 {
                tokio::spawn(watchers::idle_timeout(
                    self.clone(),
                    session.clone(),
                    tunnel.clone(),
                    lifetime,
                    Duration::from_secs(u64::from(idle_minutes) * 60),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{MemoryPersistence, SessionPersistence};
    use crate::policy::MockPolicyCheck;
    use crate::route::{MockDownstreamRouteApi, RouteError};
    use mockall::predicate::eq;
    use revtun_proxy::SelfSignedCertificateProvider;
    use revtun_transport::{memory_pair, MemoryAgent, TransportError};
    use revtun_tunnel::system_clock;
    use std::sync::atomic::{AtomicU16, Ordering};

    /// Port blocks handed out per service so parallel tests never share ports
    static NEXT_PORT_BLOCK: AtomicU16 = AtomicU16::new(47000);

    fn build(config: ServiceConfig) -> SessionService {
        let registry = SessionRegistry::new(Arc::new(MemoryPersistence::new()), None, system_clock());
        let first = NEXT_PORT_BLOCK.fetch_add(10, Ordering::SeqCst);
        let ports = PortAllocator::new((first..first + 10).collect());
        SessionService::new(registry, Arc::new(ports), config)
    }

    fn with_policy(policy: MockPolicyCheck) -> Arc<SessionService> {
        Arc::new(build(ServiceConfig::default()).with_policy(Arc::new(policy)))
    }

    fn hello(version: &str, tunnels: Vec<ForwardingSpec>) -> AgentHello {
        AgentHello {
            agent_id: "agent-1".into(),
            auth_id: "auth-1".into(),
            name: None,
            session_id: String::new(),
            version: version.into(),
            tunnels,
        }
    }

    fn connection() -> (Arc<dyn AgentTransport>, MemoryAgent) {
        let (transport, agent) = memory_pair("192.0.2.10:50000".parse().unwrap());
        (Arc::new(transport), agent)
    }

    /// Connect once with one random-port tunnel, then disconnect
    async fn previous_session(service: &Arc<SessionService>) {
        let (transport, _agent) = connection();
        let spec = ForwardingSpec::new("10.0.0.5", 22);
        service
            .establish(hello("0.7.0", vec![spec]), transport)
            .await
            .unwrap();
        service.disconnect("agent-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_tunnel_cleanup_waits_for_session_delete() {
        let persistence = Arc::new(MemoryPersistence::new());
        let registry = SessionRegistry::new(persistence.clone(), None, system_clock());
        let first = NEXT_PORT_BLOCK.fetch_add(10, Ordering::SeqCst);
        let ports = PortAllocator::new((first..first + 10).collect());
        let service = Arc::new(SessionService::new(
            registry,
            Arc::new(ports),
            ServiceConfig::default(),
        ));

        let (transport, _agent) = connection();
        let session = service
            .establish(hello("0.7.0", vec![ForwardingSpec::new("10.0.0.5", 22)]), transport)
            .await
            .unwrap();
        let tunnel = session.tunnels().await[0].clone();

        let guard = service.lifecycle.lock().await;
        let cleanup = tokio::spawn({
            let service = service.clone();
            let session = session.clone();
            async move { service.cleanup_tunnel(&session, &tunnel).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!cleanup.is_finished());

        // what force_delete does while it holds the lock
        service.stop_session(&session).await;
        service.registry.delete("agent-1").await.unwrap();
        drop(guard);

        cleanup.await.unwrap();
        assert!(service.registry.get_any("agent-1").await.is_none());
        assert!(persistence.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_denied_tunnels_are_not_reestablished() {
        let mut policy = MockPolicyCheck::new();
        policy
            .expect_tunnel_allowed()
            .withf(|_, remote| remote == "10.0.0.5:22")
            .times(1)
            .returning(|_, _| Ok(PolicyAnswer::Denied));
        let service = with_policy(policy);
        previous_session(&service).await;

        let (transport, _agent) = connection();
        let session = service
            .establish(hello("0.7.0", vec![]), transport)
            .await
            .unwrap();
        assert!(session.is_connected().await);
        assert!(session.tunnels().await.is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_policy_keeps_previous_tunnels() {
        let mut policy = MockPolicyCheck::new();
        policy
            .expect_tunnel_allowed()
            .returning(|_, _| Ok(PolicyAnswer::Unsupported));
        let service = with_policy(policy);
        previous_session(&service).await;

        let (transport, _agent) = connection();
        let session = service
            .establish(hello("0.7.0", vec![]), transport)
            .await
            .unwrap();
        let tunnels = session.tunnels().await;
        assert_eq!(tunnels.len(), 1);
        assert!(tunnels[0].is_running());
        assert!(tunnels[0].spec().local_port_random);
        assert_eq!(tunnels[0].id(), "2");
    }

    #[tokio::test]
    async fn test_old_agents_skip_policy_check() {
        let mut policy = MockPolicyCheck::new();
        policy.expect_tunnel_allowed().times(0);
        let service = with_policy(policy);
        previous_session(&service).await;

        let (transport, _agent) = connection();
        let session = service
            .establish(hello("0.6.3", vec![]), transport)
            .await
            .unwrap();
        assert_eq!(session.tunnels().await.len(), 1);
    }

    #[tokio::test]
    async fn test_policy_failure_leaves_session_untouched() {
        let mut policy = MockPolicyCheck::new();
        policy
            .expect_tunnel_allowed()
            .returning(|_, _| Err(TransportError::Timeout));
        let service = with_policy(policy);
        previous_session(&service).await;

        let (transport, _agent) = connection();
        let err = service
            .establish(hello("0.7.0", vec![]), transport)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Policy(_)));
        assert_eq!(err.status_code(), 502);

        let session = service.get("agent-1").await.unwrap();
        assert!(!session.is_connected().await);
        assert_eq!(session.tunnels().await.len(), 1);
    }

    #[tokio::test]
    async fn test_identical_spec_returns_existing_tunnel() {
        let service = Arc::new(build(ServiceConfig::default()));
        let (transport, _agent) = connection();
        let session = service
            .establish(hello("0.7.0", vec![ForwardingSpec::new("10.0.0.5", 22)]), transport)
            .await
            .unwrap();
        let existing = session.tunnels().await[0].clone();

        let infos = service
            .start_tunnels("agent-1", vec![existing.spec().clone()])
            .await
            .unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].id, existing.id());
        assert_eq!(session.tunnels().await.len(), 1);
    }

    fn proxied_service(routes: MockDownstreamRouteApi) -> Arc<SessionService> {
        let config = ServiceConfig {
            allow_multi_use_auth: false,
            proxy: Arc::new(TunnelProxyConfig {
                self_signed: true,
                ..Default::default()
            }),
        };
        let certs = SelfSignedCertificateProvider::new(vec!["localhost".into()]).unwrap();
        Arc::new(
            build(config)
                .with_certificates(Arc::new(certs))
                .with_routes(Arc::new(routes)),
        )
    }

    fn proxied_spec() -> ForwardingSpec {
        let mut spec = ForwardingSpec::new("127.0.0.1", 80).with_http_proxy(true);
        spec.downstream_subdomain = Some("app".into());
        spec
    }

    #[tokio::test]
    async fn test_route_registered_and_removed_with_tunnel() {
        let mut routes = MockDownstreamRouteApi::new();
        routes
            .expect_add_route()
            .withf(|route| {
                route.route_id == "app" && route.subdomain == "app" && route.target_host == LOOPBACK_HOST
            })
            .times(1)
            .returning(|_| Ok(()));
        routes
            .expect_delete_route()
            .with(eq("app".to_string()))
            .times(1)
            .returning(|_| Ok(()));
        let service = proxied_service(routes);

        let (transport, _agent) = connection();
        let session = service
            .establish(hello("0.7.0", vec![proxied_spec()]), transport)
            .await
            .unwrap();
        let tunnel = session.tunnels().await[0].clone();
        let port = tunnel.spec().local_port.unwrap();
        let proxy = tunnel.proxy().expect("proxy running");
        assert_eq!(proxy.local_addr().map(|a| a.port()), Some(port));
        assert!(tunnel.public_url().is_some());

        service
            .terminate_tunnel("agent-1", tunnel.id(), true)
            .await
            .unwrap();
        assert!(session.tunnels().await.is_empty());
        assert!(tokio::net::TcpListener::bind(("0.0.0.0", port)).await.is_ok());
    }

    #[tokio::test]
    async fn test_route_failure_stops_proxy_and_fails_establish() {
        let mut routes = MockDownstreamRouteApi::new();
        routes.expect_add_route().times(1).returning(|_| {
            Err(RouteError::Status {
                status: 500,
                body: "no servers".into(),
            })
        });
        routes.expect_delete_route().times(0);
        let service = proxied_service(routes);

        let (transport, _agent) = connection();
        let err = service
            .establish(hello("0.7.0", vec![proxied_spec()]), transport)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Route(_)));
        assert!(service.get("agent-1").await.is_none());
    }

    #[tokio::test]
    async fn test_http_proxy_without_tls_falls_back_to_plain_tunnel() {
        let service = Arc::new(build(ServiceConfig::default()));
        let (transport, _agent) = connection();
        let session = service
            .establish(hello("0.7.0", vec![proxied_spec()]), transport)
            .await
            .unwrap();
        let tunnel = session.tunnels().await[0].clone();
        assert!(tunnel.is_running());
        assert!(tunnel.proxy().is_none());
        assert!(tunnel.public_url().is_none());
    }
}
