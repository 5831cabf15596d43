//! Undertow tunnel server library
//!
//! This library provides the core components for running an undertow tunnel server.
//! It can be used to embed a tunnel server in other applications or for testing.

mod accept;
mod config;
mod control_plane;
mod pending;
mod proxy;
mod registry;
mod routes;

// Re-export public types
pub use accept::{accept_with_backoff, ACCEPT_BACKOFF};
pub use config::{CaddyConfig, ResolvedCaddyConfig, ResolvedServerConfig, ServerConfig};
pub use control_plane::{ControlPlane, PlaneSettings};
pub use pending::{new_rendezvous_id, PendingConnections, RENDEZVOUS_ID_LEN};
pub use proxy::{CloseReason, ProxyContext, ProxyState, ProxyUnit, PublicConn};
pub use registry::{
    is_valid_subdomain, DomainBinding, ProxyEntry, ProxyRegistry, ProxySnapshot, ProxyStats,
    RegistryError,
};
pub use routes::{route_id, CaddyRoutes, NoopRoutes, RouteError, RouteRegistrar};
