//! Session lifecycle of the tunnel server
//!
//! [`SessionService`] ties connected agents to their tunnels: it reconciles
//! reconnects against the previous session, allocates ports, fronts tunnels
//! with proxies and downstream routes, and keeps [`SessionRegistry`] in sync
//! with a [`SessionPersistence`] backend.

pub mod error;
pub mod persistence;
pub mod policy;
pub mod reconciler;
pub mod registry;
pub mod route;
pub mod service;
pub mod session;
mod watchers;

pub use error::{ErrorKind, ServiceError};
pub use persistence::{
    JsonFilePersistence, MemoryPersistence, PersistenceError, SessionPersistence, SessionRecord,
    SqlPersistence, TunnelRecord,
};
pub use policy::{PolicyAnswer, PolicyCheck, TransportPolicyCheck};
pub use reconciler::tunnels_to_reestablish;
pub use registry::SessionRegistry;
pub use route::{DownstreamRouteApi, HttpRouteApi, NewRoute, RouteError};
pub use service::{ServiceConfig, SessionService};
pub use session::{ConnectionInfo, Session, SessionTunnel};
