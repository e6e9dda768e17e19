//! revtund - reverse tunnel server
//!
//! Agents connect over QUIC and say hello with the tunnels they want; the
//! server opens those tunnels on this host and relays every accepted
//! connection back through the agent.

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use config::{Args, FileConfig, Settings};
use revtun_control::{
    HttpRouteApi, JsonFilePersistence, MemoryPersistence, ServiceConfig, SessionPersistence,
    SessionRegistry, SessionService, SqlPersistence,
};
use revtun_proto::HelloResponse;
use revtun_proxy::provider_from_config;
use revtun_transport::AgentTransport;
use revtun_transport_quic::{QuicConfig, QuicConnection, QuicListener};
use revtun_tunnel::{system_clock, PortAllocator};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::prelude::*;

/// How long a rejected agent gets to read the rejection before we hang up
const REJECT_LINGER: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize rustls crypto provider (required for QUIC/TLS)
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("Rustls crypto provider already installed");
    }

    let args = Args::parse();
    let file = match &args.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let settings = Settings::resolve(args, file)?;

    init_logging(&settings.log_level)?;
    info!(
        version = env!("GIT_TAG"),
        commit = env!("GIT_HASH"),
        built = env!("BUILD_TIME"),
        "Starting revtund"
    );

    let service = Arc::new(build_service(&settings).await?);
    let restored = service.restore().await.context("Failed to restore sessions")?;
    if restored > 0 {
        info!(sessions = restored, "Restored sessions from storage");
    }

    let quic_config = match (&settings.cert, &settings.key) {
        (Some(cert), Some(key)) => {
            info!("Using TLS certificate {} for QUIC", cert.display());
            QuicConfig::server_default(cert, key)
        }
        _ => {
            info!("Generating self-signed certificate for QUIC");
            QuicConfig::server_self_signed()?
        }
    };
    let listener = Arc::new(
        QuicListener::new(settings.listen, Arc::new(quic_config))
            .with_context(|| format!("Failed to listen on {}", settings.listen))?,
    );
    info!(listen = %listener.local_addr()?, "Accepting agents over QUIC");

    let cleanup = tokio::spawn(service.clone().run_cleanup_loop(settings.cleanup_interval));
    let accept = tokio::spawn(accept_loop(listener.clone(), service.clone()));

    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!("Error listening for shutdown signal: {}", e),
    }

    listener.close();
    accept.abort();
    service.shutdown().await;
    if let Err(e) = cleanup.await {
        warn!("Session cleanup task ended abnormally: {}", e);
    }

    info!("revtund stopped");
    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

async fn build_service(settings: &Settings) -> Result<SessionService> {
    settings
        .proxy
        .validate()
        .context("Invalid tunnel proxy configuration")?;

    let persistence = open_persistence(settings).await?;
    let registry = SessionRegistry::new(persistence, settings.retention, system_clock());
    match settings.retention {
        Some(retention) => info!(?retention, "Disconnected sessions are kept for a while"),
        None => info!("Disconnected sessions are kept forever"),
    }

    let ports = PortAllocator::from_ranges(&settings.allowed_ports, &settings.excluded_ports)
        .context("Invalid port ranges")?;
    info!(
        allowed = ports.allowed_ports().len(),
        ranges = ?settings.allowed_ports,
        excluded = ?settings.excluded_ports,
        "Local port allow-list loaded"
    );

    let config = ServiceConfig {
        allow_multi_use_auth: settings.allow_multi_use_auth,
        proxy: Arc::new(settings.proxy.clone()),
    };
    let mut service = SessionService::new(registry, Arc::new(ports), config);

    if let Some(certs) = provider_from_config(&settings.proxy)? {
        info!("Tunnel proxies enabled");
        service = service.with_certificates(certs);
    }
    if let Some(route_api) = &settings.route_api {
        let routes = HttpRouteApi::new(&route_api.url, route_api.base_domain.as_str())
            .context("Invalid route API configuration")?;
        info!(url = %route_api.url, domain = %route_api.base_domain, "Downstream routes enabled");
        service = service.with_routes(Arc::new(routes));
    }

    Ok(service)
}

async fn open_persistence(settings: &Settings) -> Result<Arc<dyn SessionPersistence>> {
    if let Some(url) = &settings.database_url {
        info!("Storing sessions in database");
        let store = SqlPersistence::open(url)
            .await
            .context("Failed to open session database")?;
        return Ok(Arc::new(store));
    }
    if let Some(path) = &settings.sessions_file {
        info!("Storing sessions in {}", path.display());
        return Ok(Arc::new(JsonFilePersistence::new(path)));
    }
    warn!("No session storage configured, sessions are lost on restart");
    Ok(Arc::new(MemoryPersistence::new()))
}

async fn accept_loop(listener: Arc<QuicListener>, service: Arc<SessionService>) {
    loop {
        match listener.accept().await {
            Ok(connection) => {
                tokio::spawn(handle_agent(Arc::new(connection), service.clone()));
            }
            Err(e) => {
                info!("Stopped accepting agents: {}", e);
                return;
            }
        }
    }
}

/// Hello, session establishment, then wait for the connection to end
async fn handle_agent(connection: Arc<QuicConnection>, service: Arc<SessionService>) {
    let peer = connection.remote_address();
    let (hello, replier) = match connection.accept_hello().await {
        Ok(hello) => hello,
        Err(e) => {
            warn!(peer = %peer, "Agent hello failed: {}", e);
            connection.close("hello failed").await;
            return;
        }
    };

    let agent_id = hello.agent_id.clone();
    let transport: Arc<dyn AgentTransport> = connection.clone();
    match service.establish(hello, transport).await {
        Ok(session) => {
            let tunnels = session.tunnel_infos().await;
            info!(agent_id = %agent_id, peer = %peer, tunnels = tunnels.len(), "Agent connected");
            if let Err(e) = replier.respond(HelloResponse::Accepted { tunnels }).await {
                warn!(agent_id = %agent_id, "Failed to send hello response: {}", e);
            }
        }
        Err(e) => {
            let code = e.status_code();
            warn!(agent_id = %agent_id, peer = %peer, code, "Rejected agent: {}", e);
            let response = HelloResponse::Rejected {
                code,
                message: e.to_string(),
            };
            if let Err(e) = replier.respond(response).await {
                debug!(agent_id = %agent_id, "Failed to send rejection: {}", e);
            }
            let _ = tokio::time::timeout(REJECT_LINGER, connection.closed()).await;
            connection.close("rejected").await;
            return;
        }
    }

    connection.closed().await;
    info!(agent_id = %agent_id, peer = %peer, "Agent connection closed");
    if let Err(e) = service
        .connection_closed(&agent_id, &connection.connection_id())
        .await
    {
        error!(agent_id = %agent_id, "Failed to disconnect session: {}", e);
    }
}
