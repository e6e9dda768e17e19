//! Per-tunnel background tasks that close tunnels on their own
//!
//! Both watchers end quietly when the tunnel's lifetime is cancelled for any
//! other reason; only their own trigger runs the cleanup.

use crate::service::SessionService;
use crate::session::{Session, SessionTunnel};
use revtun_tunnel::{CloseReason, LifetimeToken};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Shortest re-arm delay of the idle timer
const MIN_IDLE_CHECK: Duration = Duration::from_secs(1);

/// Clean up once the auto-close deadline of `lifetime` passes
pub(crate) async fn auto_close(
    service: Arc<SessionService>,
    session: Arc<Session>,
    tunnel: Arc<SessionTunnel>,
    lifetime: LifetimeToken,
) {
    match lifetime.cancelled().await {
        CloseReason::DeadlineExceeded => {
            info!(
                agent_id = %session.agent_id(),
                tunnel_id = %tunnel.id(),
                "Tunnel reached its auto-close deadline"
            );
            service.cleanup_tunnel(&session, &tunnel).await;
        }
        CloseReason::Cancelled => {
            debug!(tunnel_id = %tunnel.id(), "Auto-close watcher stopped");
        }
    }
}

/// Terminate the tunnel once it stayed idle for longer than `timeout`
pub(crate) async fn idle_timeout(
    service: Arc<SessionService>,
    session: Arc<Session>,
    tunnel: Arc<SessionTunnel>,
    lifetime: LifetimeToken,
    timeout: Duration,
) {
    let mut wait = timeout;
    loop {
        tokio::select! {
            _ = lifetime.cancelled() => {
                debug!(tunnel_id = %tunnel.id(), "Idle watcher stopped");
                return;
            }
            _ = tokio::time::sleep(wait) => {}
        }

        let Some(last_active) = tunnel.last_active() else {
            return;
        };
        let idle = (service.clock().now() - last_active)
            .to_std()
            .unwrap_or_default();

        if idle > timeout {
            info!(
                agent_id = %session.agent_id(),
                tunnel_id = %tunnel.id(),
                idle_secs = idle.as_secs(),
                "Tunnel idle timeout exceeded"
            );
            service.cleanup_tunnel(&session, &tunnel).await;
            return;
        }
        wait = timeout.saturating_sub(idle).max(MIN_IDLE_CHECK);
    }
}
